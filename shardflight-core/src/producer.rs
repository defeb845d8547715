//! Stream producer and batched job contracts
//!
//! A `StreamProducer` is what the query layer registers: it knows the schema
//! of its result set and can build the one-shot `BatchedJob` that fills
//! batches. Local producers generate data; the relay producer forwards a
//! stream owned by another node. The delivery handler treats both alike.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::allocator::BufferAllocator;
use crate::error::{StreamError, StreamResult};
use crate::root::VectorSchemaRoot;

/// Outcome of waiting for the consumer to drain the previous batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionStatus {
    /// The batch loaded in the root has been pushed; keep producing.
    Ready,
    /// The consumer did not become ready in time; the stream is over.
    Timeout,
    /// The call was cancelled; the stream is over.
    Cancelled,
    /// The wait or the push failed; the stream is over.
    Error,
}

impl ConsumptionStatus {
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Pacing point between a job and the consumer.
pub trait FlushSignal: Send + Sync {
    /// Block until the consumer can take the batch currently loaded in the
    /// root, then push it. Any status other than `Ready` means the job must
    /// stop producing.
    fn await_consumption(&self, timeout: Duration) -> ConsumptionStatus;

    /// Cancellation of the call this job serves, for cooperative checks
    /// between flushes.
    fn cancellation(&self) -> &CancellationToken;
}

/// One-shot unit of work that fills batches for a single stream.
pub trait BatchedJob: Send + Sync {
    /// Produce every batch, flushing each through `flush`. Called exactly
    /// once, on the worker thread that accepted the request.
    fn run(&self, root: &VectorSchemaRoot, flush: &dyn FlushSignal) -> StreamResult<()>;

    /// Release whatever the job holds. May be called from any thread, at any
    /// time, more than once; only the first call has an effect.
    fn on_cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// Supplier of a stream's container and job.
pub trait StreamProducer: Send + Sync {
    /// Build the empty schema'd container for this stream.
    fn create_root(&self, allocator: &BufferAllocator) -> StreamResult<VectorSchemaRoot>;

    /// Build the job that fills the container.
    fn create_job(&self, allocator: &BufferAllocator) -> StreamResult<Arc<dyn BatchedJob>>;

    /// Name used in logs.
    fn action_name(&self) -> &str {
        "stream"
    }
}

/// Local producer over an already materialized result set.
pub struct MemoryStreamProducer {
    schema: SchemaRef,
    batches: Arc<Vec<RecordBatch>>,
    flush_timeout: Duration,
    name: String,
}

impl MemoryStreamProducer {
    pub fn try_new(
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        flush_timeout: Duration,
    ) -> StreamResult<Self> {
        if let Some(bad) = batches.iter().find(|b| b.schema().fields() != schema.fields()) {
            return Err(StreamError::Internal(format!(
                "batch schema {:?} does not match producer schema",
                bad.schema().fields()
            )));
        }
        Ok(Self {
            schema,
            batches: Arc::new(batches),
            flush_timeout,
            name: "memory".to_string(),
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

impl StreamProducer for MemoryStreamProducer {
    fn create_root(&self, allocator: &BufferAllocator) -> StreamResult<VectorSchemaRoot> {
        Ok(VectorSchemaRoot::new(self.schema.clone(), allocator.clone()))
    }

    fn create_job(&self, _allocator: &BufferAllocator) -> StreamResult<Arc<dyn BatchedJob>> {
        Ok(Arc::new(MemoryBatchedJob {
            batches: self.batches.clone(),
            flush_timeout: self.flush_timeout,
            cancelled: AtomicBool::new(false),
            flushed: AtomicUsize::new(0),
        }))
    }

    fn action_name(&self) -> &str {
        &self.name
    }
}

struct MemoryBatchedJob {
    batches: Arc<Vec<RecordBatch>>,
    flush_timeout: Duration,
    cancelled: AtomicBool,
    flushed: AtomicUsize,
}

impl BatchedJob for MemoryBatchedJob {
    fn run(&self, root: &VectorSchemaRoot, flush: &dyn FlushSignal) -> StreamResult<()> {
        for batch in self.batches.iter() {
            if self.is_cancelled() || flush.cancellation().is_cancelled() {
                break;
            }
            root.load(batch.clone())?;
            if !flush.await_consumption(self.flush_timeout).is_ready() {
                break;
            }
            self.flushed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            flushed = self.flushed.load(Ordering::Relaxed),
            total = self.batches.len(),
            "Memory job finished"
        );
        Ok(())
    }

    fn on_cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
