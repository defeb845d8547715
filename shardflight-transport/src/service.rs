//! Arrow Flight service exposing registered streams over `DoGet`

use std::sync::Arc;

use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::flight_service_server::FlightService;
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaResult, Ticket,
};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use shardflight_core::{CallContext, ServerStreamListener, StreamDeliveryHandler, StreamError};
use subtle::ConstantTimeEq;
use tokio_util::task::TaskTracker;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::listener::ChannelStreamListener;

/// Metadata key for cluster authentication shared secret
pub const AUTH_SECRET_METADATA_KEY: &str = "x-cluster-secret";

type ResponseStream<T> = BoxStream<'static, Result<T, Status>>;

/// Serves `DoGet` for tickets issued by this node's registry (or relayed
/// from a peer). Every other Flight RPC is unimplemented: streams are
/// single-use and have no descriptors.
pub struct FlightStreamService {
    handler: Arc<StreamDeliveryHandler>,
    /// Shared secret for cluster authentication (constant-time comparison)
    cluster_secret: Option<Vec<u8>>,
    /// Delivery workers, awaited on shutdown before the allocator closes
    workers: TaskTracker,
}

impl FlightStreamService {
    #[must_use]
    pub fn new(handler: Arc<StreamDeliveryHandler>) -> Self {
        Self {
            handler,
            cluster_secret: None,
            workers: TaskTracker::new(),
        }
    }

    /// Spawn delivery workers on `workers` instead of a private tracker.
    #[must_use]
    pub fn with_task_tracker(mut self, workers: TaskTracker) -> Self {
        self.workers = workers;
        self
    }

    /// When set, every `DoGet` must carry this secret in metadata.
    #[must_use]
    pub fn with_cluster_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.cluster_secret = Some(secret.into());
        self
    }

    #[allow(clippy::result_large_err)]
    fn authenticate<T>(&self, request: &Request<T>) -> Result<(), Status> {
        let Some(expected) = &self.cluster_secret else {
            return Ok(());
        };

        let provided = request
            .metadata()
            .get(AUTH_SECRET_METADATA_KEY)
            .ok_or_else(|| Status::unauthenticated("missing cluster authentication secret"))?
            .as_bytes();

        if expected.ct_eq(provided).into() {
            Ok(())
        } else {
            Err(Status::unauthenticated("invalid cluster authentication secret"))
        }
    }
}

/// Cancels the call if `do_get` is dropped before handing out the body.
struct CancelOnDrop(Option<CallContext>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(ctx) = self.0.take() {
            ctx.cancel();
        }
    }
}

#[tonic::async_trait]
#[allow(clippy::result_large_err)]
impl FlightService for FlightStreamService {
    type HandshakeStream = ResponseStream<HandshakeResponse>;
    type ListFlightsStream = ResponseStream<FlightInfo>;
    type DoGetStream = ResponseStream<FlightData>;
    type DoPutStream = ResponseStream<PutResult>;
    type DoActionStream = ResponseStream<arrow_flight::Result>;
    type ListActionsStream = ResponseStream<ActionType>;
    type DoExchangeStream = ResponseStream<FlightData>;

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented("handshake is not supported"))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("streams are not listable"))
    }

    async fn get_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("streams are addressed by ticket only"))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("streams are addressed by ticket only"))
    }

    async fn get_schema(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        Err(Status::unimplemented("the schema is sent at the head of DoGet"))
    }

    async fn do_get(
        &self,
        request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        self.authenticate(&request)?;
        let ticket = request.into_inner().ticket;

        let ctx = CallContext::new();
        let guard = CancelOnDrop(Some(ctx.clone()));
        let (listener, consumer, schema_rx) = ChannelStreamListener::channel(ctx.clone());
        let listener: Arc<dyn ServerStreamListener> = Arc::new(listener);

        let handler = self.handler.clone();
        self.workers.spawn_blocking(move || {
            match handler.get_stream(&ctx, &ticket, listener) {
                Ok(outcome) => debug!(?outcome, "DoGet finished"),
                Err(e) => debug!(kind = e.kind(), "DoGet failed: {e}"),
            }
        });

        let schema = match schema_rx.await {
            Ok(Ok(schema)) => schema,
            Ok(Err(e)) => {
                guard.disarm();
                return Err(e.into());
            }
            Err(_) => {
                guard.disarm();
                warn!("Stream worker exited before announcing a schema");
                return Err(Status::internal("stream worker exited before announcing a schema"));
            }
        };
        guard.disarm();

        // A failure after the schema went out ends the body with its status.
        let failure = consumer.failure_slot();
        let trailer = stream::once(async move { failure.lock().take() })
            .filter_map(|failure| async move { failure.map(|e: StreamError| Err(Status::from(e))) });
        let body = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .build(consumer)
            .map_err(Status::from)
            .chain(trailer);

        Ok(Response::new(body.boxed()))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("streams are produced in-process"))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("do_exchange is not supported"))
    }

    async fn do_action(
        &self,
        _request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        Err(Status::unimplemented("no actions are offered"))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        Ok(Response::new(stream::empty().boxed()))
    }
}
