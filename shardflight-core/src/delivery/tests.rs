use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use arrow::array::{Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use super::*;
use crate::allocator::AllocatorKind;
use crate::listener::ReadyHandler;
use crate::producer::MemoryStreamProducer;

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("value", DataType::Int64, false)]))
}

fn batch(value: i64) -> RecordBatch {
    RecordBatch::try_new(schema(), vec![Arc::new(Int64Array::from(vec![value; 16]))]).unwrap()
}

#[derive(Clone, Copy)]
enum Readiness {
    Always,
    Never,
    /// Ready until this many batches were pushed, then reports cancelled.
    CancelAfter(usize),
}

struct TestListener {
    readiness: Readiness,
    started: Mutex<Option<SchemaRef>>,
    batches: Mutex<Vec<RecordBatch>>,
    errors: Mutex<Vec<StreamError>>,
    completed: AtomicUsize,
    ready_handler: Mutex<Option<ReadyHandler>>,
    pushed_tx: Mutex<Option<mpsc::Sender<usize>>>,
}

impl TestListener {
    fn new(readiness: Readiness) -> Arc<Self> {
        Arc::new(Self {
            readiness,
            started: Mutex::new(None),
            batches: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
            ready_handler: Mutex::new(None),
            pushed_tx: Mutex::new(None),
        })
    }

    fn notify_pushes(&self) -> mpsc::Receiver<usize> {
        let (tx, rx) = mpsc::channel();
        *self.pushed_tx.lock() = Some(tx);
        rx
    }

    fn puts(&self) -> usize {
        self.batches.lock().len()
    }

    fn terminal_count(&self) -> usize {
        self.errors.lock().len() + self.completed.load(Ordering::SeqCst)
    }

    fn error_kind(&self) -> Option<&'static str> {
        self.errors.lock().first().map(StreamError::kind)
    }
}

impl ServerStreamListener for TestListener {
    fn start(&self, schema: SchemaRef) -> StreamResult<()> {
        *self.started.lock() = Some(schema);
        Ok(())
    }

    fn put_next(&self, batch: RecordBatch) -> StreamResult<()> {
        let count = {
            let mut batches = self.batches.lock();
            batches.push(batch);
            batches.len()
        };
        if let Some(tx) = self.pushed_tx.lock().as_ref() {
            let _ = tx.send(count);
        }
        Ok(())
    }

    fn error(&self, err: StreamError) {
        self.errors.lock().push(err);
    }

    fn completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        match self.readiness {
            Readiness::Always => true,
            Readiness::Never => false,
            Readiness::CancelAfter(n) => self.puts() < n,
        }
    }

    fn is_cancelled(&self) -> bool {
        match self.readiness {
            Readiness::CancelAfter(n) => self.puts() >= n,
            _ => false,
        }
    }

    fn set_on_ready_handler(&self, handler: ReadyHandler) {
        *self.ready_handler.lock() = Some(handler);
    }
}

/// Job emitting `batches` batches tagged with `tag`, recording how it was
/// driven.
struct ScriptedJob {
    tag: i64,
    batches: usize,
    timeout: Duration,
    allocator: BufferAllocator,
    runs: AtomicUsize,
    cancels: AtomicUsize,
    statuses: Mutex<Vec<ConsumptionStatus>>,
    allocated_at_cancel: AtomicUsize,
    fail_with: Mutex<Option<StreamError>>,
    panic_in_run: AtomicBool,
}

impl BatchedJob for ScriptedJob {
    fn run(&self, root: &VectorSchemaRoot, flush: &dyn FlushSignal) -> StreamResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.panic_in_run.load(Ordering::SeqCst) {
            panic!("scripted panic");
        }
        if let Some(e) = self.fail_with.lock().take() {
            return Err(e);
        }
        for _ in 0..self.batches {
            root.load(batch(self.tag))?;
            let status = flush.await_consumption(self.timeout);
            self.statuses.lock().push(status);
            if !status.is_ready() {
                break;
            }
        }
        Ok(())
    }

    fn on_cancel(&self) {
        self.allocated_at_cancel
            .store(self.allocator.allocated(), Ordering::SeqCst);
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancels.load(Ordering::SeqCst) > 0
    }
}

struct ScriptedProducer {
    tag: i64,
    batches: usize,
    timeout: Duration,
    job: Mutex<Option<Arc<ScriptedJob>>>,
    fail_with: Mutex<Option<StreamError>>,
    panic_in_run: bool,
}

impl ScriptedProducer {
    fn new(tag: i64, batches: usize, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            tag,
            batches,
            timeout,
            job: Mutex::new(None),
            fail_with: Mutex::new(None),
            panic_in_run: false,
        })
    }

    fn job(&self) -> Arc<ScriptedJob> {
        self.job.lock().clone().expect("job created")
    }
}

impl StreamProducer for ScriptedProducer {
    fn create_root(&self, allocator: &BufferAllocator) -> StreamResult<VectorSchemaRoot> {
        Ok(VectorSchemaRoot::new(schema(), allocator.clone()))
    }

    fn create_job(&self, allocator: &BufferAllocator) -> StreamResult<Arc<dyn BatchedJob>> {
        let job = Arc::new(ScriptedJob {
            tag: self.tag,
            batches: self.batches,
            timeout: self.timeout,
            allocator: allocator.clone(),
            runs: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            statuses: Mutex::new(Vec::new()),
            allocated_at_cancel: AtomicUsize::new(0),
            fail_with: Mutex::new(self.fail_with.lock().take()),
            panic_in_run: AtomicBool::new(self.panic_in_run),
        });
        *self.job.lock() = Some(job.clone());
        Ok(job)
    }
}

struct Fixture {
    manager: Arc<StreamManager>,
    allocator: BufferAllocator,
    handler: Arc<StreamDeliveryHandler>,
}

fn fixture() -> Fixture {
    let manager = Arc::new(StreamManager::new("node-a", None));
    let allocator = BufferAllocator::root("test", AllocatorKind::Accounting, 64 << 20);
    let handler = Arc::new(StreamDeliveryHandler::new(
        manager.clone(),
        allocator.clone(),
        DeliveryOptions::default(),
    ));
    Fixture {
        manager,
        allocator,
        handler,
    }
}

#[test]
fn test_happy_path_three_batches() {
    let f = fixture();
    let producer = ScriptedProducer::new(7, 3, Duration::from_secs(1));
    let ticket = f.manager.register_stream(producer.clone()).unwrap();
    let listener = TestListener::new(Readiness::Always);

    let outcome = f
        .handler
        .get_stream(&CallContext::new(), &ticket.to_bytes(), listener.clone())
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Completed { batches: 3 });
    assert_eq!(listener.puts(), 3);
    assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
    assert!(listener.errors.lock().is_empty());
    assert_eq!(listener.started.lock().clone(), Some(schema()));
    assert_eq!(producer.job().cancels.load(Ordering::SeqCst), 0);
    assert!(matches!(f.manager.get_stream(&ticket), Err(StreamError::NotFound(_))));
    assert_eq!(f.allocator.allocated(), 0);
}

#[test]
fn test_timeout_when_listener_never_ready() {
    let f = fixture();
    let producer = ScriptedProducer::new(1, 3, Duration::from_millis(100));
    let ticket = f.manager.register_stream(producer.clone()).unwrap();
    let listener = TestListener::new(Readiness::Never);

    let outcome = f
        .handler
        .get_stream(&CallContext::new(), &ticket.to_bytes(), listener.clone())
        .unwrap();

    assert_eq!(outcome, StreamOutcome::TimedOut { batches: 0 });
    let job = producer.job();
    assert_eq!(*job.statuses.lock(), vec![ConsumptionStatus::Timeout]);
    assert_eq!(listener.puts(), 0);
    assert_eq!(listener.error_kind(), Some("timeout"));
    assert_eq!(listener.terminal_count(), 1);
    // on_cancel ran while the pending batch was still held.
    assert_eq!(job.cancels.load(Ordering::SeqCst), 1);
    assert!(job.allocated_at_cancel.load(Ordering::SeqCst) > 0);
    assert!(!f.manager.contains(&ticket));
    assert_eq!(f.allocator.allocated(), 0);
}

#[test]
fn test_listener_cancels_on_fifth_flush() {
    let f = fixture();
    let producer = ScriptedProducer::new(2, 5, Duration::from_secs(5));
    let ticket = f.manager.register_stream(producer.clone()).unwrap();
    let listener = TestListener::new(Readiness::CancelAfter(4));

    let outcome = f
        .handler
        .get_stream(&CallContext::new(), &ticket.to_bytes(), listener.clone())
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Cancelled { batches: 4 });
    assert_eq!(listener.puts(), 4);
    let job = producer.job();
    assert_eq!(job.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(job.statuses.lock().last(), Some(&ConsumptionStatus::Cancelled));
    assert_eq!(listener.error_kind(), Some("cancelled"));
    assert!(!f.manager.contains(&ticket));
}

#[test]
fn test_async_cancel_unblocks_pending_wait() {
    let f = fixture();
    let producer = ScriptedProducer::new(3, 5, Duration::from_secs(30));
    let ticket = f.manager.register_stream(producer.clone()).unwrap();
    // Ready for four pushes, then the consumer stalls without going away.
    let listener = Arc::new(StallingListener {
        inner: TestListener::new(Readiness::Always),
        budget: 4,
    });
    let pushes = listener.inner.notify_pushes();
    let ctx = CallContext::new();

    let canceller = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            while let Ok(count) = pushes.recv() {
                if count == 4 {
                    thread::sleep(Duration::from_millis(20));
                    ctx.cancel();
                    break;
                }
            }
        })
    };

    let started = std::time::Instant::now();
    let outcome = f
        .handler
        .get_stream(&ctx, &ticket.to_bytes(), listener.clone())
        .unwrap();
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(outcome, StreamOutcome::Cancelled { batches: 4 });
    assert_eq!(listener.inner.puts(), 4);
    assert_eq!(producer.job().cancels.load(Ordering::SeqCst), 1);
    assert!(!f.manager.contains(&ticket));
    assert_eq!(f.allocator.allocated(), 0);
}

struct StallingListener {
    inner: Arc<TestListener>,
    budget: usize,
}

impl ServerStreamListener for StallingListener {
    fn start(&self, schema: SchemaRef) -> StreamResult<()> {
        self.inner.start(schema)
    }
    fn put_next(&self, batch: RecordBatch) -> StreamResult<()> {
        self.inner.put_next(batch)
    }
    fn error(&self, err: StreamError) {
        self.inner.error(err);
    }
    fn completed(&self) {
        self.inner.completed();
    }
    fn is_ready(&self) -> bool {
        self.inner.puts() < self.budget
    }
    fn is_cancelled(&self) -> bool {
        false
    }
    fn set_on_ready_handler(&self, handler: ReadyHandler) {
        self.inner.set_on_ready_handler(handler);
    }
}

#[test]
fn test_cancelled_before_streaming() {
    let f = fixture();
    let producer = ScriptedProducer::new(4, 3, Duration::from_secs(1));
    let ticket = f.manager.register_stream(producer.clone()).unwrap();
    let listener = TestListener::new(Readiness::Always);
    let ctx = CallContext::new();
    ctx.cancel();

    let outcome = f
        .handler
        .get_stream(&ctx, &ticket.to_bytes(), listener.clone())
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Cancelled { batches: 0 });
    let job = producer.job();
    assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    assert_eq!(job.cancels.load(Ordering::SeqCst), 1);
    assert!(listener.started.lock().is_none());
    assert_eq!(listener.terminal_count(), 1);
    assert!(!f.manager.contains(&ticket));
}

#[test]
fn test_invalid_and_unknown_tickets() {
    let f = fixture();

    let listener = TestListener::new(Readiness::Always);
    let err = f
        .handler
        .get_stream(&CallContext::new(), b"%%%", listener.clone())
        .unwrap_err();
    assert!(matches!(err, StreamError::InvalidTicket(_)));
    assert_eq!(listener.error_kind(), Some("invalid_ticket"));
    assert!(listener.started.lock().is_none());

    let unknown = StreamTicket::new("missing", "node-a").unwrap();
    let listener = TestListener::new(Readiness::Always);
    let err = f
        .handler
        .get_stream(&CallContext::new(), &unknown.to_bytes(), listener.clone())
        .unwrap_err();
    assert!(matches!(err, StreamError::NotFound(_)));
    assert_eq!(listener.terminal_count(), 1);
}

#[test]
fn test_ticket_is_single_use() {
    let f = fixture();
    let producer = ScriptedProducer::new(5, 1, Duration::from_secs(1));
    let ticket = f.manager.register_stream(producer).unwrap();

    f.handler
        .get_stream(&CallContext::new(), &ticket.to_bytes(), TestListener::new(Readiness::Always))
        .unwrap();
    let err = f
        .handler
        .get_stream(&CallContext::new(), &ticket.to_bytes(), TestListener::new(Readiness::Always))
        .unwrap_err();
    assert!(matches!(err, StreamError::NotFound(_)));
}

#[test]
fn test_second_consumer_leaves_entry_with_first() {
    let f = fixture();
    let producer = ScriptedProducer::new(6, 1, Duration::from_secs(1));
    let ticket = f.manager.register_stream(producer).unwrap();
    f.manager.acquire_stream(&ticket, &CallContext::new()).unwrap();

    let listener = TestListener::new(Readiness::Always);
    let err = f
        .handler
        .get_stream(&CallContext::new(), &ticket.to_bytes(), listener.clone())
        .unwrap_err();
    assert!(matches!(err, StreamError::SecondConsumer(_)));
    assert!(f.manager.contains(&ticket));
}

#[test]
fn test_job_error_is_reported_then_returned() {
    let f = fixture();
    let producer = ScriptedProducer::new(8, 3, Duration::from_secs(1));
    *producer.fail_with.lock() = Some(StreamError::Internal("shard closed".to_string()));
    let ticket = f.manager.register_stream(producer).unwrap();
    let listener = TestListener::new(Readiness::Always);

    let err = f
        .handler
        .get_stream(&CallContext::new(), &ticket.to_bytes(), listener.clone())
        .unwrap_err();

    assert!(matches!(err, StreamError::Internal(ref m) if m == "shard closed"));
    assert_eq!(listener.error_kind(), Some("internal"));
    assert_eq!(listener.terminal_count(), 1);
    assert!(!f.manager.contains(&ticket));
    assert_eq!(f.allocator.allocated(), 0);
}

#[test]
fn test_job_panic_cleans_up_and_resumes() {
    let f = fixture();
    let producer = Arc::new(ScriptedProducer {
        tag: 9,
        batches: 1,
        timeout: Duration::from_secs(1),
        job: Mutex::new(None),
        fail_with: Mutex::new(None),
        panic_in_run: true,
    });
    let ticket = f.manager.register_stream(producer).unwrap();
    let listener = TestListener::new(Readiness::Always);

    let handler = f.handler.clone();
    let bytes = ticket.to_bytes();
    let l = listener.clone();
    let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
        handler.get_stream(&CallContext::new(), &bytes, l)
    }));

    assert!(result.is_err());
    assert_eq!(listener.error_kind(), Some("internal"));
    assert!(!f.manager.contains(&ticket));
    assert_eq!(f.allocator.allocated(), 0);
}

#[test]
fn test_no_put_after_terminal_status() {
    // A job that ignores the status and keeps flushing.
    struct StubbornJob;

    impl BatchedJob for StubbornJob {
        fn run(&self, root: &VectorSchemaRoot, flush: &dyn FlushSignal) -> StreamResult<()> {
            for i in 0..3 {
                root.load(batch(i))?;
                let _ = flush.await_consumption(Duration::from_millis(20));
            }
            Ok(())
        }
        fn on_cancel(&self) {}
        fn is_cancelled(&self) -> bool {
            false
        }
    }

    struct StubbornProducer;

    impl StreamProducer for StubbornProducer {
        fn create_root(&self, allocator: &BufferAllocator) -> StreamResult<VectorSchemaRoot> {
            Ok(VectorSchemaRoot::new(schema(), allocator.clone()))
        }
        fn create_job(&self, _allocator: &BufferAllocator) -> StreamResult<Arc<dyn BatchedJob>> {
            Ok(Arc::new(StubbornJob))
        }
    }

    let f = fixture();
    let ticket = f.manager.register_stream(Arc::new(StubbornProducer)).unwrap();
    let listener = TestListener::new(Readiness::Never);
    let outcome = f
        .handler
        .get_stream(&CallContext::new(), &ticket.to_bytes(), listener.clone())
        .unwrap();

    assert_eq!(outcome, StreamOutcome::TimedOut { batches: 0 });
    assert_eq!(listener.puts(), 0);
    assert_eq!(listener.terminal_count(), 1);
}

#[test]
fn test_concurrent_streams_are_isolated() {
    let f = fixture();
    let producers: Vec<_> = (0..8)
        .map(|tag| ScriptedProducer::new(tag, 4, Duration::from_secs(5)))
        .collect();
    let tickets: Vec<_> = producers
        .iter()
        .map(|p| f.manager.register_stream(p.clone()).unwrap())
        .collect();

    let workers: Vec<_> = tickets
        .iter()
        .map(|ticket| {
            let handler = f.handler.clone();
            let bytes = ticket.to_bytes();
            let listener = TestListener::new(Readiness::Always);
            thread::spawn(move || {
                let outcome = handler
                    .get_stream(&CallContext::new(), &bytes, listener.clone())
                    .unwrap();
                (outcome, listener)
            })
        })
        .collect();

    for (tag, worker) in workers.into_iter().enumerate() {
        let (outcome, listener) = worker.join().unwrap();
        assert_eq!(outcome, StreamOutcome::Completed { batches: 4 });
        for b in listener.batches.lock().iter() {
            let values = b.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
            assert!(values.iter().all(|v| v == Some(tag as i64)));
        }
        assert_eq!(producers[tag].job().runs.load(Ordering::SeqCst), 1);
    }
    assert!(f.manager.is_empty());
    assert_eq!(f.allocator.allocated(), 0);
}

#[test]
fn test_registry_close_cancels_in_flight_stream() {
    let f = fixture();
    let producer = ScriptedProducer::new(10, 2, Duration::from_secs(30));
    let ticket = f.manager.register_stream(producer.clone()).unwrap();
    let listener = TestListener::new(Readiness::Never);

    let worker = {
        let handler = f.handler.clone();
        let bytes = ticket.to_bytes();
        let listener = listener.clone();
        thread::spawn(move || handler.get_stream(&CallContext::new(), &bytes, listener))
    };

    // Let the worker reach its backpressure wait.
    while producer.job.lock().is_none() {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(50));
    f.manager.close();

    let outcome = worker.join().unwrap().unwrap();
    assert_eq!(outcome, StreamOutcome::Cancelled { batches: 0 });
    assert_eq!(producer.job().cancels.load(Ordering::SeqCst), 1);
    assert_eq!(f.allocator.allocated(), 0);
}

#[test]
fn test_stopped_handler_refuses_streams() {
    let f = fixture();
    let schema = schema();
    let producer = MemoryStreamProducer::try_new(schema, vec![batch(1)], Duration::from_secs(1)).unwrap();
    let ticket = f.manager.register_stream(Arc::new(producer)).unwrap();
    f.handler.stop_accepting();

    let err = f
        .handler
        .get_stream(&CallContext::new(), &ticket.to_bytes(), TestListener::new(Readiness::Always))
        .unwrap_err();
    assert!(matches!(err, StreamError::Unavailable(_)));
    assert!(f.manager.contains(&ticket));
}

#[test]
fn test_cancel_surfacing_as_job_error_is_cancelled_outcome() {
    // Blocks like an upstream read until cancelled, then fails with the cancel.
    struct BlockedReadJob {
        cancelled: AtomicBool,
    }

    impl BatchedJob for BlockedReadJob {
        fn run(&self, _root: &VectorSchemaRoot, _flush: &dyn FlushSignal) -> StreamResult<()> {
            while !self.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Err(StreamError::Cancelled("read aborted".to_string()))
        }
        fn on_cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    struct BlockedReadProducer;

    impl StreamProducer for BlockedReadProducer {
        fn create_root(&self, allocator: &BufferAllocator) -> StreamResult<VectorSchemaRoot> {
            Ok(VectorSchemaRoot::new(schema(), allocator.clone()))
        }
        fn create_job(&self, _allocator: &BufferAllocator) -> StreamResult<Arc<dyn BatchedJob>> {
            Ok(Arc::new(BlockedReadJob {
                cancelled: AtomicBool::new(false),
            }))
        }
    }

    let f = fixture();
    let ticket = f.manager.register_stream(Arc::new(BlockedReadProducer)).unwrap();
    let listener = TestListener::new(Readiness::Always);
    let ctx = CallContext::new();

    let canceller = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            ctx.cancel();
        })
    };
    let outcome = f
        .handler
        .get_stream(&ctx, &ticket.to_bytes(), listener.clone())
        .unwrap();
    canceller.join().unwrap();

    assert_eq!(outcome, StreamOutcome::Cancelled { batches: 0 });
    assert_eq!(listener.error_kind(), Some("cancelled"));
    assert_eq!(listener.terminal_count(), 1);
    assert!(!f.manager.contains(&ticket));
}
