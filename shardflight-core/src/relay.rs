//! Relay producer
//!
//! Serves a ticket owned by another node by pulling the owner's stream and
//! forwarding its batches under the same backpressure discipline as a local
//! producer. The network side lives behind `RemoteStreamConnector`, so this
//! module stays transport-agnostic.

use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::allocator::BufferAllocator;
use crate::error::{StreamError, StreamResult};
use crate::producer::{BatchedJob, FlushSignal, StreamProducer};
use crate::root::VectorSchemaRoot;
use crate::ticket::StreamTicket;

/// Wait bound for each forwarded batch.
pub const PROXY_FLUSH_TIMEOUT: Duration = Duration::from_millis(1000);

/// An open upstream stream on the owning node.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteStream: Send {
    fn schema(&self) -> SchemaRef;

    /// Next upstream batch, `None` once exhausted. Blocks the calling worker.
    fn next_batch(&mut self) -> StreamResult<Option<RecordBatch>>;

    /// Release the upstream call.
    fn close(&mut self) -> StreamResult<()>;
}

/// Opens upstream streams on other nodes.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteStreamConnector: Send + Sync {
    /// Open `ticket` on its owning node. `cancel` aborts a pending open or
    /// read.
    fn open(
        &self,
        ticket: &StreamTicket,
        cancel: &CancellationToken,
    ) -> StreamResult<Box<dyn RemoteStream>>;
}

/// Upstream handle shared by the producer (which opens it) and the job
/// (which drains and closes it).
struct Upstream {
    stream: Mutex<Option<Box<dyn RemoteStream>>>,
    cancel: CancellationToken,
}

impl Upstream {
    fn close(&self) -> StreamResult<()> {
        let taken = self.stream.lock().take();
        match taken {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        }
    }

    /// Close without waiting on a worker blocked in a read. Returns false when
    /// the stream is busy; the worker then closes it after the read returns.
    fn try_close(&self) -> StreamResult<bool> {
        let Some(mut guard) = self.stream.try_lock() else {
            return Ok(false);
        };
        let taken = guard.take();
        drop(guard);
        match taken {
            Some(mut stream) => stream.close().map(|()| true),
            None => Ok(true),
        }
    }
}

pub struct ProxyStreamProducer {
    ticket: StreamTicket,
    connector: Arc<dyn RemoteStreamConnector>,
    upstream: Arc<Upstream>,
}

impl ProxyStreamProducer {
    #[must_use]
    pub fn new(ticket: StreamTicket, connector: Arc<dyn RemoteStreamConnector>) -> Self {
        Self {
            ticket,
            connector,
            upstream: Arc::new(Upstream {
                stream: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub const fn ticket(&self) -> &StreamTicket {
        &self.ticket
    }
}

impl StreamProducer for ProxyStreamProducer {
    fn create_root(&self, allocator: &BufferAllocator) -> StreamResult<VectorSchemaRoot> {
        if self.upstream.cancel.is_cancelled() {
            return Err(StreamError::Cancelled(format!(
                "relay for {} cancelled before open",
                self.ticket
            )));
        }
        let stream = self.connector.open(&self.ticket, &self.upstream.cancel)?;
        let schema = stream.schema();
        *self.upstream.stream.lock() = Some(stream);
        if self.upstream.cancel.is_cancelled() {
            // Cancelled while connecting; on_cancel may have found nothing to close.
            self.upstream.close()?;
            return Err(StreamError::Cancelled(format!(
                "relay for {} cancelled while opening",
                self.ticket
            )));
        }
        debug!(ticket = %self.ticket, "Opened upstream stream");
        Ok(VectorSchemaRoot::new(schema, allocator.clone()))
    }

    fn create_job(&self, _allocator: &BufferAllocator) -> StreamResult<Arc<dyn BatchedJob>> {
        Ok(Arc::new(ProxyBatchedJob {
            ticket: self.ticket.clone(),
            upstream: self.upstream.clone(),
        }))
    }

    fn action_name(&self) -> &str {
        "relay"
    }
}

struct ProxyBatchedJob {
    ticket: StreamTicket,
    upstream: Arc<Upstream>,
}

impl ProxyBatchedJob {
    fn next_upstream(&self) -> StreamResult<Option<RecordBatch>> {
        let mut guard = self.upstream.stream.lock();
        match guard.as_mut() {
            Some(stream) => stream.next_batch(),
            // Closed by on_cancel.
            None => Ok(None),
        }
    }
}

impl BatchedJob for ProxyBatchedJob {
    fn run(&self, root: &VectorSchemaRoot, flush: &dyn FlushSignal) -> StreamResult<()> {
        let mut forwarded = 0usize;
        loop {
            if self.is_cancelled() || flush.cancellation().is_cancelled() {
                break;
            }
            let loaded = match self.next_upstream() {
                Ok(Some(batch)) => root.load(batch),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            if let Err(e) = loaded {
                if let Err(close_err) = self.upstream.close() {
                    warn!(ticket = %self.ticket, "Failed to close upstream after error: {close_err}");
                }
                return Err(e);
            }
            if !flush.await_consumption(PROXY_FLUSH_TIMEOUT).is_ready() {
                break;
            }
            forwarded += 1;
        }

        debug!(ticket = %self.ticket, forwarded, "Relay loop finished");
        self.upstream.close().map_err(|e| {
            StreamError::Internal(format!("failed to close upstream for {}: {e}", self.ticket))
        })
    }

    fn on_cancel(&self) {
        // Unblocks a pending upstream read. May run on an async thread, so a
        // busy stream is left for the worker to close.
        self.upstream.cancel.cancel();
        match self.upstream.try_close() {
            Ok(true) => {}
            Ok(false) => debug!(ticket = %self.ticket, "Upstream busy; worker closes it"),
            Err(e) => warn!(ticket = %self.ticket, "Failed to close upstream on cancel: {e}"),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.upstream.cancel.is_cancelled()
    }
}
