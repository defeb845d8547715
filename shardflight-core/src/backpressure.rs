//! Backpressure between a producing worker thread and the consumer side
//!
//! The worker blocks in `wait_for_listener` until the listener reports it can
//! take another batch, the call is cancelled, or the timeout elapses. The
//! listener's ready callback and the cancel handler wake the worker; nothing
//! polls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::listener::ServerStreamListener;

/// State of the current wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Pending,
    Ready,
    Cancelled,
    TimedOut,
}

struct Shared {
    state: Mutex<WaitState>,
    wakeup: Condvar,
}

impl Shared {
    fn wake(&self) {
        // Taking the lock orders this wake-up after any readiness check the
        // waiter made, so the notification cannot be lost.
        let _guard = self.state.lock();
        self.wakeup.notify_all();
    }
}

pub struct BackpressureCoordinator {
    shared: Arc<Shared>,
    listener: Arc<dyn ServerStreamListener>,
    cancel: CancellationToken,
}

impl BackpressureCoordinator {
    /// Bind to `listener`, installing its ready callback.
    pub fn new(listener: Arc<dyn ServerStreamListener>, cancel: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WaitState::Pending),
            wakeup: Condvar::new(),
        });
        let on_ready = shared.clone();
        listener.set_on_ready_handler(Box::new(move || on_ready.wake()));
        Self {
            shared,
            listener,
            cancel,
        }
    }

    /// Wake a blocked waiter so it re-checks cancellation.
    pub fn wake(&self) {
        self.shared.wake();
    }

    #[must_use]
    pub fn state(&self) -> WaitState {
        *self.shared.state.lock()
    }

    /// Block until the listener is ready, the call is cancelled, or
    /// `timeout` elapses. Returns `Ready`, `Cancelled` or `TimedOut`.
    pub fn wait_for_listener(&self, timeout: Duration) -> WaitState {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        *state = WaitState::Pending;

        loop {
            if self.cancel.is_cancelled() || self.listener.is_cancelled() {
                *state = WaitState::Cancelled;
                break;
            }
            if self.listener.is_ready() {
                *state = WaitState::Ready;
                break;
            }
            if self
                .shared
                .wakeup
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                // One last look: readiness may have raced the deadline.
                *state = if self.cancel.is_cancelled() || self.listener.is_cancelled() {
                    WaitState::Cancelled
                } else if self.listener.is_ready() {
                    WaitState::Ready
                } else {
                    WaitState::TimedOut
                };
                break;
            }
        }

        trace!(state = ?*state, "Backpressure wait finished");
        *state
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use arrow::datatypes::SchemaRef;
    use arrow::record_batch::RecordBatch;

    use super::*;
    use crate::error::{StreamError, StreamResult};
    use crate::listener::ReadyHandler;

    #[derive(Default)]
    struct FlagListener {
        ready: AtomicBool,
        cancelled: AtomicBool,
        handler: Mutex<Option<ReadyHandler>>,
    }

    impl FlagListener {
        fn make_ready(&self) {
            self.ready.store(true, Ordering::SeqCst);
            if let Some(h) = self.handler.lock().as_ref() {
                h();
            }
        }
    }

    impl ServerStreamListener for FlagListener {
        fn start(&self, _schema: SchemaRef) -> StreamResult<()> {
            Ok(())
        }
        fn put_next(&self, _batch: RecordBatch) -> StreamResult<()> {
            Ok(())
        }
        fn error(&self, _err: StreamError) {}
        fn completed(&self) {}
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
        fn set_on_ready_handler(&self, handler: ReadyHandler) {
            *self.handler.lock() = Some(handler);
        }
    }

    #[test]
    fn test_ready_immediately() {
        let listener = Arc::new(FlagListener::default());
        listener.ready.store(true, Ordering::SeqCst);
        let coordinator = BackpressureCoordinator::new(listener, CancellationToken::new());
        assert_eq!(
            coordinator.wait_for_listener(Duration::from_millis(10)),
            WaitState::Ready
        );
    }

    #[test]
    fn test_times_out_when_never_ready() {
        let listener = Arc::new(FlagListener::default());
        let coordinator = BackpressureCoordinator::new(listener, CancellationToken::new());
        let started = Instant::now();
        assert_eq!(
            coordinator.wait_for_listener(Duration::from_millis(100)),
            WaitState::TimedOut
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(coordinator.state(), WaitState::TimedOut);
    }

    #[test]
    fn test_woken_by_ready_callback() {
        let listener = Arc::new(FlagListener::default());
        let coordinator = BackpressureCoordinator::new(listener.clone(), CancellationToken::new());

        let notifier = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            listener.make_ready();
        });

        assert_eq!(
            coordinator.wait_for_listener(Duration::from_secs(5)),
            WaitState::Ready
        );
        notifier.join().unwrap();
    }

    #[test]
    fn test_woken_by_cancellation() {
        let listener = Arc::new(FlagListener::default());
        let token = CancellationToken::new();
        let coordinator = Arc::new(BackpressureCoordinator::new(listener, token.clone()));

        let waker = coordinator.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.cancel();
            waker.wake();
        });

        let started = Instant::now();
        assert_eq!(
            coordinator.wait_for_listener(Duration::from_secs(5)),
            WaitState::Cancelled
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }
}
