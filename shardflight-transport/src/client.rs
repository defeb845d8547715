//! Flight client used to relay streams owned by other nodes
//!
//! Features:
//! - Node id to address map, seeded from configuration and updatable at runtime
//! - Per-address channel caching (reuses `tonic::Channel`, evicted when idle)
//! - Shared-secret authentication via `x-cluster-secret` header
//! - Blocking adapters so relay jobs can read upstream batches on their
//!   worker thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::error::FlightError;
use arrow_flight::{FlightClient, Ticket};
use dashmap::DashMap;
use futures::StreamExt;
use moka::sync::Cache;
use shardflight_core::{RemoteStream, RemoteStreamConnector, StreamError, StreamResult, StreamTicket};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::service::AUTH_SECRET_METADATA_KEY;

/// Channels to peers idle for this long are dropped.
const CHANNEL_CACHE_TTL_SECS: u64 = 300;

const CHANNEL_CACHE_MAX_CAPACITY: u64 = 256;

#[derive(Debug, Clone)]
pub struct FlightClientConfig {
    /// Timeout for establishing a new connection to a peer
    pub connect_timeout: Duration,
    /// Shared secret sent to peers
    pub cluster_secret: Option<String>,
}

impl Default for FlightClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            cluster_secret: None,
        }
    }
}

/// Opens Flight streams on peer nodes.
///
/// Connections are made lazily on the first relay to a peer. Must be
/// created inside a Tokio runtime; `open` is then callable from blocking
/// worker threads of that runtime.
pub struct FlightClientManager {
    node_id: String,
    config: FlightClientConfig,
    peers: DashMap<String, String>,
    channels: Cache<String, Channel>,
    runtime: Handle,
    closed: AtomicBool,
}

impl FlightClientManager {
    pub fn new(node_id: impl Into<String>, config: FlightClientConfig) -> StreamResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| StreamError::Internal(format!("flight client needs a tokio runtime: {e}")))?;
        let channels = Cache::builder()
            .max_capacity(CHANNEL_CACHE_MAX_CAPACITY)
            .time_to_idle(Duration::from_secs(CHANNEL_CACHE_TTL_SECS))
            .build();

        Ok(Self {
            node_id: node_id.into(),
            config,
            peers: DashMap::new(),
            channels,
            runtime,
            closed: AtomicBool::new(false),
        })
    }

    /// Record (or replace) the Flight address of `node_id`.
    pub fn add_peer(&self, node_id: impl Into<String>, address: impl Into<String>) {
        let node_id = node_id.into();
        let address = address.into();
        if node_id == self.node_id {
            warn!(node_id = %node_id, "Ignoring peer entry for the local node");
            return;
        }
        debug!(node_id = %node_id, address = %address, "Peer address registered");
        if let Some(previous) = self.peers.insert(node_id, address) {
            self.channels.invalidate(&previous);
        }
    }

    pub fn remove_peer(&self, node_id: &str) {
        if let Some((_, address)) = self.peers.remove(node_id) {
            self.channels.invalidate(&address);
        }
    }

    #[must_use]
    pub fn peer_address(&self, node_id: &str) -> Option<String> {
        self.peers.get(node_id).map(|address| address.clone())
    }

    /// Refuse further relays and drop every cached channel.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channels.invalidate_all();
        info!(node_id = %self.node_id, "Flight client closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn get_channel(&self, address: &str) -> StreamResult<Channel> {
        if let Some(channel) = self.channels.get(address) {
            return Ok(channel);
        }

        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| StreamError::Transport(format!("invalid peer address {address}: {e}")))?
            .connect_timeout(self.config.connect_timeout);
        let channel = endpoint.connect().await.map_err(|e| {
            StreamError::Unavailable(format!("failed to connect to {address}: {e}"))
        })?;

        self.channels.insert(address.to_string(), channel.clone());
        Ok(channel)
    }

    async fn open_async(&self, address: &str, ticket: &StreamTicket) -> StreamResult<FlightRemoteParts> {
        let channel = self.get_channel(address).await?;
        let mut client = FlightClient::new(channel);
        if let Some(secret) = &self.config.cluster_secret {
            client
                .add_header(AUTH_SECRET_METADATA_KEY, secret)
                .map_err(flight_error)?;
        }

        let mut stream = match client.do_get(Ticket::new(ticket.to_bytes())).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = flight_error(e);
                if matches!(err, StreamError::Unavailable(_) | StreamError::Transport(_)) {
                    self.channels.invalidate(address);
                }
                return Err(err);
            }
        };

        // The schema arrives ahead of the first batch; read up to it so the
        // relay can size its container before streaming.
        let first = stream.next().await.transpose().map_err(flight_error)?;
        let schema = stream
            .schema()
            .cloned()
            .or_else(|| first.as_ref().map(RecordBatch::schema))
            .ok_or_else(|| StreamError::Internal(format!("upstream {ticket} sent no schema")))?;

        Ok(FlightRemoteParts {
            stream,
            schema,
            first,
        })
    }
}

struct FlightRemoteParts {
    stream: FlightRecordBatchStream,
    schema: SchemaRef,
    first: Option<RecordBatch>,
}

fn flight_error(err: FlightError) -> StreamError {
    StreamError::from(tonic::Status::from(err))
}

impl RemoteStreamConnector for FlightClientManager {
    fn open(
        &self,
        ticket: &StreamTicket,
        cancel: &CancellationToken,
    ) -> StreamResult<Box<dyn RemoteStream>> {
        if self.is_closed() {
            return Err(StreamError::Unavailable("flight client is closed".to_string()));
        }
        let address = self.peer_address(ticket.node_id()).ok_or_else(|| {
            StreamError::NotFound(format!("{ticket}: no address known for node {}", ticket.node_id()))
        })?;

        let parts = self.runtime.block_on(async {
            tokio::select! {
                () = cancel.cancelled() => Err(StreamError::Cancelled(format!("relay of {ticket} cancelled while connecting"))),
                parts = self.open_async(&address, ticket) => parts,
            }
        })?;
        debug!(ticket = %ticket, address = %address, "Upstream stream opened");

        Ok(Box::new(FlightRemoteStream {
            ticket: ticket.clone(),
            stream: Some(parts.stream),
            schema: parts.schema,
            buffered: parts.first,
            cancel: cancel.clone(),
            runtime: self.runtime.clone(),
        }))
    }
}

/// Blocking view over an upstream `DoGet`.
pub struct FlightRemoteStream {
    ticket: StreamTicket,
    stream: Option<FlightRecordBatchStream>,
    schema: SchemaRef,
    buffered: Option<RecordBatch>,
    cancel: CancellationToken,
    runtime: Handle,
}

impl RemoteStream for FlightRemoteStream {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn next_batch(&mut self) -> StreamResult<Option<RecordBatch>> {
        if let Some(batch) = self.buffered.take() {
            return Ok(Some(batch));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let cancel = &self.cancel;
        let ticket = &self.ticket;
        self.runtime.block_on(async {
            tokio::select! {
                () = cancel.cancelled() => Err(StreamError::Cancelled(format!("relay of {ticket} cancelled"))),
                next = stream.next() => next.transpose().map_err(flight_error),
            }
        })
    }

    fn close(&mut self) -> StreamResult<()> {
        // Dropping the decoder resets the upstream call.
        if self.stream.take().is_some() {
            debug!(ticket = %self.ticket, "Upstream stream closed");
        }
        self.buffered = None;
        Ok(())
    }
}
