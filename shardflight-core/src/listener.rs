//! Consumer-side contract of a stream call
//!
//! The transport supplies a `ServerStreamListener` (where batches go) and a
//! `CallContext` (whether the caller is still there). Both are consumed by
//! the delivery handler and know nothing about tickets or producers.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{StreamError, StreamResult};

/// Callback fired when the listener can accept another batch.
pub type ReadyHandler = Box<dyn Fn() + Send + Sync>;

/// Callback fired once when the call is cancelled.
pub type CancelHandler = Box<dyn FnOnce() + Send>;

/// Push-style sink for one stream.
pub trait ServerStreamListener: Send + Sync {
    /// Announce the schema. Called once, before any batch.
    fn start(&self, schema: SchemaRef) -> StreamResult<()>;

    /// Push one batch. Only called after `is_ready` returned true.
    fn put_next(&self, batch: RecordBatch) -> StreamResult<()>;

    /// Terminate the stream with an error.
    fn error(&self, err: StreamError);

    /// Terminate the stream successfully.
    fn completed(&self);

    /// Whether another batch can be pushed without queueing.
    fn is_ready(&self) -> bool;

    /// Whether the consumer went away.
    fn is_cancelled(&self) -> bool;

    /// Install the callback used to wake a producer waiting for readiness.
    fn set_on_ready_handler(&self, handler: ReadyHandler);
}

/// Cancellation state of one call.
///
/// Cheap to clone. Cancelling fires the installed handler exactly once; a
/// handler installed after cancellation fires immediately.
#[derive(Clone, Default)]
pub struct CallContext {
    inner: Arc<CallInner>,
}

#[derive(Default)]
struct CallInner {
    token: CancellationToken,
    on_cancel: Mutex<Option<CancelHandler>>,
}

impl CallContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context from an existing token (e.g. a server shutdown token).
    #[must_use]
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(CallInner {
                token,
                on_cancel: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.inner.token.cancel();
        let handler = self.inner.on_cancel.lock().take();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn set_on_cancel_handler(&self, handler: CancelHandler) {
        let mut slot = self.inner.on_cancel.lock();
        if self.inner.token.is_cancelled() {
            drop(slot);
            handler();
        } else {
            *slot = Some(handler);
        }
    }

    /// Drop the installed handler; later cancellation only flips the token.
    pub fn clear_on_cancel_handler(&self) {
        self.inner.on_cancel.lock().take();
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
