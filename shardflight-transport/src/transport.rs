//! Node lifecycle: allocator, relay client, registry and Flight server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow_flight::flight_service_server::FlightServiceServer;
use parking_lot::Mutex;
use shardflight_core::{
    BufferAllocator, Config, MemoryStreamProducer, RemoteStreamConnector, StreamDeliveryHandler,
    StreamError, StreamManager, StreamResult, StreamTicket,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::client::{FlightClientConfig, FlightClientManager};
use crate::service::FlightStreamService;

type ServerHandle = JoinHandle<Result<(), tonic::transport::Error>>;

/// A running node.
pub struct FlightTransport {
    node_id: String,
    local_addr: SocketAddr,
    flush_timeout: Duration,
    allocator: BufferAllocator,
    client_manager: Arc<FlightClientManager>,
    stream_manager: Arc<StreamManager>,
    handler: Arc<StreamDeliveryHandler>,
    shutdown: CancellationToken,
    workers: TaskTracker,
    server: Mutex<Option<ServerHandle>>,
    stopped: AtomicBool,
}

impl FlightTransport {
    /// Bring a node up and start serving `DoGet` on `server.host:server.port`
    /// (port 0 picks a free port; see `local_addr`).
    pub async fn start(config: &Config) -> StreamResult<Self> {
        let node_id = config.node.id.clone();
        let allocator = BufferAllocator::root(
            format!("root-{node_id}"),
            config.memory.allocator,
            config.memory.limit_bytes,
        );

        let client_manager = Arc::new(FlightClientManager::new(
            node_id.clone(),
            FlightClientConfig {
                connect_timeout: config.relay_connect_timeout(),
                cluster_secret: config.server.cluster_secret.clone(),
            },
        )?);
        for (peer, address) in &config.peers {
            client_manager.add_peer(peer.clone(), address.clone());
        }

        let connector: Arc<dyn RemoteStreamConnector> = client_manager.clone();
        let stream_manager = Arc::new(StreamManager::new(node_id.clone(), Some(connector)));

        let listener = TcpListener::bind(config.listen_address())
            .await
            .map_err(|e| {
                StreamError::Unavailable(format!("failed to bind {}: {e}", config.listen_address()))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StreamError::Internal(format!("failed to read bound address: {e}")))?;

        let handler = Arc::new(StreamDeliveryHandler::new(
            stream_manager.clone(),
            allocator.clone(),
            config.delivery_options(),
        ));
        let workers = TaskTracker::new();
        let mut service = FlightStreamService::new(handler.clone()).with_task_tracker(workers.clone());
        if let Some(secret) = &config.server.cluster_secret {
            service = service.with_cluster_secret(secret.as_bytes());
        }

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(FlightServiceServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal.cancelled_owned())
                .await
        });

        info!(
            node_id = %node_id,
            address = %local_addr,
            peers = config.peers.len(),
            "Flight transport started"
        );

        Ok(Self {
            node_id,
            local_addr,
            flush_timeout: config.flush_timeout(),
            allocator,
            client_manager,
            stream_manager,
            handler,
            shutdown,
            workers,
            server: Mutex::new(Some(server)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Stop in reverse order of start. In-flight streams are cancelled and
    /// their workers awaited before the allocator closes; the call is
    /// idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node_id = %self.node_id, "Stopping flight transport");

        self.handler.stop_accepting();
        self.stream_manager.close();
        self.client_manager.close();

        self.shutdown.cancel();
        let server = self.server.lock().take();
        if let Some(server) = server {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Flight server error: {e}"),
                Err(e) => error!("Flight server task failed: {e}"),
            }
        }

        // Every worker has released its container before the arena goes.
        self.workers.close();
        if !self.workers.is_empty() {
            info!(node_id = %self.node_id, workers = self.workers.len(), "Waiting for stream workers");
        }
        self.workers.wait().await;

        if let Err(e) = self.allocator.close() {
            warn!(node_id = %self.node_id, "Root allocator closed with outstanding memory: {e}");
        }
        info!(node_id = %self.node_id, "Flight transport stopped");
    }

    /// Register materialized `batches` under a fresh ticket, using the
    /// configured flush timeout.
    pub fn register_batches(&self, schema: SchemaRef, batches: Vec<RecordBatch>) -> StreamResult<StreamTicket> {
        let producer = MemoryStreamProducer::try_new(schema, batches, self.flush_timeout)?;
        self.stream_manager.register_stream(Arc::new(producer))
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn stream_manager(&self) -> &Arc<StreamManager> {
        &self.stream_manager
    }

    #[must_use]
    pub const fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    #[must_use]
    pub fn client_manager(&self) -> &Arc<FlightClientManager> {
        &self.client_manager
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
