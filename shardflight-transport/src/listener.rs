//! Bridge between the blocking delivery worker and the Flight response body
//!
//! `ChannelStreamListener` is handed to `StreamDeliveryHandler::get_stream`
//! on a blocking thread. Batches travel through a one-slot channel to the
//! `ConsumptionStream`, which is polled by the response encoder. Taking a
//! batch off the channel fires the ready callback, so the worker never pushes
//! batch N+1 before batch N left the node.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow_flight::error::FlightError;
use futures::Stream;
use parking_lot::Mutex;
use shardflight_core::listener::ReadyHandler;
use shardflight_core::{CallContext, ServerStreamListener, StreamError, StreamResult};
use tokio::sync::{mpsc, oneshot};

/// Resolved once the worker either announced the schema or failed before
/// doing so.
pub type SchemaReceiver = oneshot::Receiver<StreamResult<SchemaRef>>;

type ReadySlot = Arc<Mutex<Option<ReadyHandler>>>;
type FailureSlot = Arc<Mutex<Option<StreamError>>>;

pub struct ChannelStreamListener {
    sender: Mutex<Option<mpsc::Sender<RecordBatch>>>,
    schema: Mutex<Option<oneshot::Sender<StreamResult<SchemaRef>>>>,
    ready: ReadySlot,
    failure: FailureSlot,
    ctx: CallContext,
}

impl ChannelStreamListener {
    /// Build a listener for the call `ctx` together with the consumer side.
    #[must_use]
    pub fn channel(ctx: CallContext) -> (Self, ConsumptionStream, SchemaReceiver) {
        let (tx, rx) = mpsc::channel(1);
        let (schema_tx, schema_rx) = oneshot::channel();
        let ready: ReadySlot = Arc::new(Mutex::new(None));
        let failure: FailureSlot = Arc::new(Mutex::new(None));

        let listener = Self {
            sender: Mutex::new(Some(tx)),
            schema: Mutex::new(Some(schema_tx)),
            ready: ready.clone(),
            failure: failure.clone(),
            ctx: ctx.clone(),
        };
        let consumer = ConsumptionStream {
            receiver: rx,
            ready,
            failure,
            ctx,
            finished: false,
        };
        (listener, consumer, schema_rx)
    }

    /// Close the channel; the consumer drains what is queued and ends.
    fn close(&self) {
        self.sender.lock().take();
    }
}

impl ServerStreamListener for ChannelStreamListener {
    fn start(&self, schema: SchemaRef) -> StreamResult<()> {
        let sender = self
            .schema
            .lock()
            .take()
            .ok_or_else(|| StreamError::Internal("stream already started".to_string()))?;
        sender
            .send(Ok(schema))
            .map_err(|_| StreamError::Cancelled("caller left before the schema was sent".to_string()))
    }

    fn put_next(&self, batch: RecordBatch) -> StreamResult<()> {
        let guard = self.sender.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| StreamError::Internal("stream already terminated".to_string()))?;
        sender.try_send(batch).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                StreamError::Internal("batch pushed while the consumer was not ready".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                StreamError::Cancelled("consumer went away".to_string())
            }
        })
    }

    fn error(&self, err: StreamError) {
        // Before `start` the failure becomes the RPC status itself.
        if let Some(schema) = self.schema.lock().take() {
            let _ = schema.send(Err(err));
        } else {
            *self.failure.lock() = Some(err);
        }
        self.close();
    }

    fn completed(&self) {
        if let Some(schema) = self.schema.lock().take() {
            let _ = schema.send(Err(StreamError::Internal(
                "stream completed without a schema".to_string(),
            )));
        }
        self.close();
    }

    fn is_ready(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.capacity() > 0)
    }

    fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
            || self
                .sender
                .lock()
                .as_ref()
                .is_some_and(mpsc::Sender::is_closed)
    }

    fn set_on_ready_handler(&self, handler: ReadyHandler) {
        *self.ready.lock() = Some(handler);
    }
}

/// Consumer side of a `ChannelStreamListener`.
///
/// Dropping it before the end of the stream cancels the call.
pub struct ConsumptionStream {
    receiver: mpsc::Receiver<RecordBatch>,
    ready: ReadySlot,
    failure: FailureSlot,
    ctx: CallContext,
    finished: bool,
}

impl ConsumptionStream {
    /// Handle to the terminal error recorded after the schema went out,
    /// readable once the stream ended.
    #[must_use]
    pub fn failure_slot(&self) -> Arc<Mutex<Option<StreamError>>> {
        self.failure.clone()
    }

    fn notify_ready(&self) {
        if let Some(handler) = self.ready.lock().as_ref() {
            handler();
        }
    }
}

impl Stream for ConsumptionStream {
    type Item = Result<RecordBatch, FlightError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(batch)) => {
                // The slot is free again; let the worker push the next batch.
                this.notify_ready();
                Poll::Ready(Some(Ok(batch)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ConsumptionStream {
    fn drop(&mut self) {
        if !self.finished {
            self.ctx.cancel();
        }
    }
}
