pub mod allocator;
pub mod backpressure;
pub mod config;
pub mod delivery;
pub mod error;
pub mod listener;
pub mod logging;
pub mod producer;
pub mod registry;
pub mod relay;
pub mod root;
pub mod ticket;

pub use allocator::{AllocatorKind, BufferAllocator};
pub use config::Config;
pub use delivery::{DeliveryOptions, StreamDeliveryHandler, StreamOutcome};
pub use error::{StreamError, StreamResult};
pub use listener::{CallContext, ServerStreamListener};
pub use producer::{BatchedJob, ConsumptionStatus, FlushSignal, MemoryStreamProducer, StreamProducer};
pub use registry::StreamManager;
pub use relay::{RemoteStream, RemoteStreamConnector};
pub use root::VectorSchemaRoot;
pub use ticket::StreamTicket;
