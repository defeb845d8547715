//! Arrow Flight binding for shardflight nodes
//!
//! Wraps the core delivery handler in a Flight `DoGet` service, relays
//! tickets owned by peers through a Flight client, and owns the node
//! lifecycle.

pub mod client;
pub mod listener;
pub mod service;
pub mod transport;

pub use client::{FlightClientConfig, FlightClientManager, FlightRemoteStream};
pub use listener::{ChannelStreamListener, ConsumptionStream};
pub use service::{FlightStreamService, AUTH_SECRET_METADATA_KEY};
pub use transport::FlightTransport;
