//! Server-side delivery of one registered stream
//!
//! `StreamDeliveryHandler::get_stream` runs a stream to a terminal state on
//! the calling (worker) thread:
//!
//! ```text
//! Lookup -> Init -> Streaming -> Completed | Cancelled | TimedOut | Failed
//! ```
//!
//! Whatever the outcome, the container is released, then the registry entry
//! is removed, then the listener gets exactly one `completed` or `error`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::BufferAllocator;
use crate::backpressure::{BackpressureCoordinator, WaitState};
use crate::error::{StreamError, StreamResult};
use crate::listener::{CallContext, ServerStreamListener};
use crate::producer::{BatchedJob, ConsumptionStatus, FlushSignal, StreamProducer};
use crate::registry::StreamManager;
use crate::root::VectorSchemaRoot;
use crate::ticket::StreamTicket;

/// How a stream that was found ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { batches: usize },
    Cancelled { batches: usize },
    TimedOut { batches: usize },
}

impl StreamOutcome {
    #[must_use]
    pub const fn batches(&self) -> usize {
        match self {
            Self::Completed { batches } | Self::Cancelled { batches } | Self::TimedOut { batches } => {
                *batches
            }
        }
    }
}

/// Delivery settings.
#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    /// Memory cap for a single stream's container.
    pub per_stream_limit: usize,
    /// Fully validate every loaded batch.
    pub validate_batches: bool,
    /// Reject batches whose fields differ from the stream schema.
    pub check_schema_on_load: bool,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            per_stream_limit: usize::MAX,
            validate_batches: false,
            check_schema_on_load: true,
        }
    }
}

pub struct StreamDeliveryHandler {
    manager: Arc<StreamManager>,
    allocator: BufferAllocator,
    options: DeliveryOptions,
    accepting: AtomicBool,
}

/// Terminal state reached by the inner phases.
enum Terminal {
    Completed(usize),
    Cancelled(usize),
    TimedOut(usize),
    Failed(StreamError),
    Panicked(Box<dyn Any + Send>),
}

impl StreamDeliveryHandler {
    #[must_use]
    pub fn new(manager: Arc<StreamManager>, allocator: BufferAllocator, options: DeliveryOptions) -> Self {
        Self {
            manager,
            allocator,
            options,
            accepting: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn stream_manager(&self) -> &Arc<StreamManager> {
        &self.manager
    }

    /// Refuse streams that have not started yet.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Deliver the stream named by `ticket_bytes` to `listener`, blocking the
    /// current thread until it reaches a terminal state.
    ///
    /// Returns the outcome for streams that were found and ended by
    /// completion, cancellation or timeout; lookup failures and job errors
    /// are returned as `Err` after the listener has been told. A panic in the
    /// job is reported as an internal error and then resumed.
    pub fn get_stream(
        &self,
        ctx: &CallContext,
        ticket_bytes: &[u8],
        listener: Arc<dyn ServerStreamListener>,
    ) -> StreamResult<StreamOutcome> {
        let listener = Arc::new(ListenerGuard::new(listener));
        let started = Instant::now();

        // Lookup
        let (ticket, producer) = match self.lookup(ctx, ticket_bytes) {
            Ok(found) => found,
            Err(e) => {
                debug!(kind = e.kind(), "Stream lookup failed: {e}");
                listener.error(e.duplicate());
                return Err(e);
            }
        };

        let terminal = {
            let _entry = EntryGuard {
                manager: &self.manager,
                ticket: &ticket,
            };
            self.run_phases(ctx, &ticket, producer.as_ref(), &listener)
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match terminal {
            Terminal::Completed(batches) => {
                listener.completed();
                info!(ticket = %ticket, batches, elapsed_ms, "Stream completed");
                Ok(StreamOutcome::Completed { batches })
            }
            Terminal::Cancelled(batches) => {
                listener.error(StreamError::Cancelled(format!("stream {ticket} cancelled")));
                info!(ticket = %ticket, batches, elapsed_ms, "Stream cancelled");
                Ok(StreamOutcome::Cancelled { batches })
            }
            Terminal::TimedOut(batches) => {
                listener.error(StreamError::Timeout(format!(
                    "consumer of {ticket} did not become ready in time"
                )));
                warn!(ticket = %ticket, batches, elapsed_ms, "Stream timed out");
                Ok(StreamOutcome::TimedOut { batches })
            }
            Terminal::Failed(e) => {
                listener.error(e.duplicate());
                warn!(ticket = %ticket, kind = e.kind(), elapsed_ms, "Stream failed: {e}");
                Err(e)
            }
            Terminal::Panicked(payload) => {
                listener.error(StreamError::Internal(format!("job for {ticket} panicked")));
                warn!(ticket = %ticket, elapsed_ms, "Stream job panicked");
                panic::resume_unwind(payload)
            }
        }
    }

    fn lookup(
        &self,
        ctx: &CallContext,
        ticket_bytes: &[u8],
    ) -> StreamResult<(StreamTicket, Arc<dyn StreamProducer>)> {
        if !self.is_accepting() {
            return Err(StreamError::Unavailable("node is shutting down".to_string()));
        }
        let ticket = StreamTicket::from_bytes(ticket_bytes)?;
        let producer = self.manager.acquire_stream(&ticket, ctx)?;
        Ok((ticket, producer))
    }

    fn run_phases(
        &self,
        ctx: &CallContext,
        ticket: &StreamTicket,
        producer: &dyn StreamProducer,
        listener: &Arc<ListenerGuard>,
    ) -> Terminal {
        // Init
        let job = match producer.create_job(&self.allocator) {
            Ok(job) => job,
            Err(e) => return Terminal::Failed(e),
        };
        let cancel = Arc::new(CancelOnce::new(job.clone()));
        if ctx.is_cancelled() {
            cancel.fire();
            return Terminal::Cancelled(0);
        }

        // Streaming
        let allocator = self.allocator.new_child(
            format!("stream-{}", ticket.ticket_id()),
            self.options.per_stream_limit,
        );
        let coordinator = Arc::new(BackpressureCoordinator::new(
            listener.clone() as Arc<dyn ServerStreamListener>,
            ctx.token().clone(),
        ));
        {
            let cancel = cancel.clone();
            let coordinator = coordinator.clone();
            ctx.set_on_cancel_handler(Box::new(move || {
                cancel.fire();
                coordinator.wake();
            }));
        }

        let terminal = self.stream_batches(ctx, producer, &job, &cancel, &coordinator, &allocator, listener);

        ctx.clear_on_cancel_handler();
        if let Err(e) = allocator.close() {
            warn!(ticket = %ticket, "Stream container outlived its stream: {e}");
        }
        terminal
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_batches(
        &self,
        ctx: &CallContext,
        producer: &dyn StreamProducer,
        job: &Arc<dyn BatchedJob>,
        cancel: &Arc<CancelOnce>,
        coordinator: &Arc<BackpressureCoordinator>,
        allocator: &BufferAllocator,
        listener: &Arc<ListenerGuard>,
    ) -> Terminal {
        let root = match producer.create_root(allocator) {
            Ok(root) => root
                .with_validation(self.options.validate_batches)
                .with_schema_check(self.options.check_schema_on_load),
            Err(e) => return abort_before_run(ctx, cancel, e),
        };
        if let Err(e) = listener.start(root.schema()) {
            return abort_before_run(ctx, cancel, e);
        }

        let flush = ListenerFlushSignal {
            root: &root,
            listener,
            coordinator,
            cancel,
            token: ctx.token(),
            status: Mutex::new(None),
            failure: Mutex::new(None),
            pushed: AtomicUsize::new(0),
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| job.run(&root, &flush)));
        let cancelled_during_run = cancel.fired();
        let pushed = flush.pushed.load(Ordering::Acquire);
        let status = *flush.status.lock();
        let failure = flush.failure.lock().take();
        drop(flush);
        // Release the container before the registry entry goes away.
        drop(root);

        match result {
            Err(payload) => Terminal::Panicked(payload),
            Ok(run_result) => match (status, run_result) {
                (Some(ConsumptionStatus::Timeout), _) => Terminal::TimedOut(pushed),
                (Some(ConsumptionStatus::Cancelled), _) => Terminal::Cancelled(pushed),
                (Some(ConsumptionStatus::Error), _) => Terminal::Failed(
                    failure.unwrap_or_else(|| StreamError::Internal("flush failed".to_string())),
                ),
                // A job unblocked by the cancel reports it as an error.
                (_, Err(StreamError::Cancelled(_))) if cancelled_during_run => {
                    Terminal::Cancelled(pushed)
                }
                (_, Err(e)) => Terminal::Failed(e),
                (_, Ok(())) if cancelled_during_run => Terminal::Cancelled(pushed),
                (_, Ok(())) => Terminal::Completed(pushed),
            },
        }
    }
}

fn abort_before_run(ctx: &CallContext, cancel: &CancelOnce, err: StreamError) -> Terminal {
    // The job never ran; let it release anything it opened.
    cancel.fire();
    if ctx.is_cancelled() {
        Terminal::Cancelled(0)
    } else {
        Terminal::Failed(err)
    }
}

/// Removes the registry entry when dropped.
struct EntryGuard<'a> {
    manager: &'a StreamManager,
    ticket: &'a StreamTicket,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.manager.remove_stream(self.ticket);
    }
}

/// Forwards to `BatchedJob::on_cancel` at most once.
struct CancelOnce {
    job: Arc<dyn BatchedJob>,
    fired: AtomicBool,
}

impl CancelOnce {
    fn new(job: Arc<dyn BatchedJob>) -> Self {
        Self {
            job,
            fired: AtomicBool::new(false),
        }
    }

    fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.job.on_cancel();
        }
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Wraps the transport listener so it is terminated exactly once and never
/// receives a batch afterwards.
struct ListenerGuard {
    inner: Arc<dyn ServerStreamListener>,
    terminated: AtomicBool,
}

impl ListenerGuard {
    fn new(inner: Arc<dyn ServerStreamListener>) -> Self {
        Self {
            inner,
            terminated: AtomicBool::new(false),
        }
    }

    fn terminate(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }
}

impl ServerStreamListener for ListenerGuard {
    fn start(&self, schema: SchemaRef) -> StreamResult<()> {
        self.inner.start(schema)
    }

    fn put_next(&self, batch: RecordBatch) -> StreamResult<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(StreamError::Internal("listener already terminated".to_string()));
        }
        self.inner.put_next(batch)
    }

    fn error(&self, err: StreamError) {
        if self.terminate() {
            self.inner.error(err);
        }
    }

    fn completed(&self) {
        if self.terminate() {
            self.inner.completed();
        }
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    fn set_on_ready_handler(&self, handler: crate::listener::ReadyHandler) {
        self.inner.set_on_ready_handler(handler);
    }
}

/// Flush signal handed to the job: waits on the coordinator and pushes the
/// root's batch when the listener is ready. The first non-ready status is
/// latched and returned to every later call.
struct ListenerFlushSignal<'a> {
    root: &'a VectorSchemaRoot,
    listener: &'a ListenerGuard,
    coordinator: &'a BackpressureCoordinator,
    cancel: &'a CancelOnce,
    token: &'a CancellationToken,
    status: Mutex<Option<ConsumptionStatus>>,
    failure: Mutex<Option<StreamError>>,
    pushed: AtomicUsize,
}

impl ListenerFlushSignal<'_> {
    fn latch(&self, status: ConsumptionStatus) -> ConsumptionStatus {
        *self.status.lock() = Some(status);
        self.cancel.fire();
        self.root.clear();
        status
    }
}

impl FlushSignal for ListenerFlushSignal<'_> {
    fn await_consumption(&self, timeout: Duration) -> ConsumptionStatus {
        if let Some(status) = *self.status.lock() {
            return status;
        }

        match self.coordinator.wait_for_listener(timeout) {
            WaitState::Ready => {
                let Some(batch) = self.root.take() else {
                    return ConsumptionStatus::Ready;
                };
                match self.listener.put_next(batch) {
                    Ok(()) => {
                        self.pushed.fetch_add(1, Ordering::AcqRel);
                        ConsumptionStatus::Ready
                    }
                    Err(_) if self.token.is_cancelled() || self.listener.is_cancelled() => {
                        self.latch(ConsumptionStatus::Cancelled)
                    }
                    Err(e) => {
                        *self.failure.lock() = Some(e);
                        self.latch(ConsumptionStatus::Error)
                    }
                }
            }
            WaitState::TimedOut => self.latch(ConsumptionStatus::Timeout),
            WaitState::Cancelled => self.latch(ConsumptionStatus::Cancelled),
            WaitState::Pending => {
                *self.failure.lock() =
                    Some(StreamError::Internal("backpressure wait ended while pending".to_string()));
                self.latch(ConsumptionStatus::Error)
            }
        }
    }

    fn cancellation(&self) -> &CancellationToken {
        self.token
    }
}

#[cfg(test)]
mod tests;
