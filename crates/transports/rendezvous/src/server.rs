//! HTTP server exposing the rendezvous service
//!
//! Endpoints:
//! - POST /register - Announce a peer
//! - GET /peers - List announced peers
//! - POST /signal - Deposit a signal in the recipient's mailbox
//! - GET /signal/:peer_id - Drain a peer's mailbox
//! - GET /ice-servers - ICE endpoints for transport session creation
//! - GET /health - Health check

use crate::error::{Error, Result};
use crate::protocol::{
    ErrorResponse, HealthResponse, IceServersResponse, PeerInfo, RegisterRequest,
    RegisterResponse, SendSignalRequest, SendSignalResponse, SignalRecord,
};
use crate::service::RendezvousService;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Rendezvous HTTP server
pub struct RendezvousServer {
    /// Server bind address
    bind_address: String,
    /// Shared service state
    service: Arc<RendezvousService>,
}

impl RendezvousServer {
    /// Create a server bound to the service's configured address
    pub fn new(service: Arc<RendezvousService>) -> Self {
        Self {
            bind_address: service.config().bind_address.clone(),
            service,
        }
    }

    /// Shared service handle
    pub fn service(&self) -> Arc<RendezvousService> {
        Arc::clone(&self.service)
    }

    /// Build the router with all endpoints
    pub fn build_router(&self) -> Router {
        router(Arc::clone(&self.service))
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| Error::ServerError(format!("Invalid bind address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::ServerError(format!("Failed to bind: {}", e)))?;

        self.serve_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    ///
    /// The sweeper runs for exactly as long as the server does.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::ServerError(format!("Failed to get local addr: {}", e)))?;

        tracing::info!("Rendezvous service listening on {}", local_addr);

        let (sweeper_tx, sweeper_rx) = watch::channel(false);
        let sweeper = self.service.spawn_sweeper(sweeper_rx);

        let router = self.build_router();

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::ServerError(format!("Server error: {}", e)));

        let _ = sweeper_tx.send(true);
        let _ = sweeper.await;

        tracing::info!("Rendezvous service stopped");

        result
    }
}

/// Router over a shared service
pub fn router(service: Arc<RendezvousService>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/register", post(register_handler))
        .route("/peers", get(peers_handler))
        .route("/signal", post(send_signal_handler))
        .route("/signal/:peer_id", get(fetch_signals_handler))
        .route("/ice-servers", get(ice_servers_handler))
        .with_state(service)
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::cors::CorsLayer::permissive()),
        )
}

/// Map service errors to HTTP status codes and structured responses
fn map_error(e: Error) -> ApiError {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let message = match e {
        Error::InvalidArgument(msg) => msg,
        other => other.to_string(),
    };

    (status, Json(ErrorResponse { error: message }))
}

fn map_rejection(rejection: JsonRejection) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: format!("Invalid request body: {}", rejection.body_text()),
        }),
    )
}

// Handler implementations

async fn root_handler() -> &'static str {
    "PeerLink rendezvous service is running"
}

/// GET /health
async fn health_handler(State(service): State<Arc<RendezvousService>>) -> Json<HealthResponse> {
    Json(service.health())
}

/// POST /register
async fn register_handler(
    State(service): State<Arc<RendezvousService>>,
    body: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> std::result::Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let Json(request) = body.map_err(map_rejection)?;

    let response = service.register(request).map_err(|e| {
        tracing::warn!("Rejected registration: {}", e);
        map_error(e)
    })?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /peers
async fn peers_handler(State(service): State<Arc<RendezvousService>>) -> Json<Vec<PeerInfo>> {
    Json(service.list_peers())
}

/// POST /signal
async fn send_signal_handler(
    State(service): State<Arc<RendezvousService>>,
    body: std::result::Result<Json<SendSignalRequest>, JsonRejection>,
) -> std::result::Result<(StatusCode, Json<SendSignalResponse>), ApiError> {
    let Json(request) = body.map_err(map_rejection)?;

    let response = service.send_signal(request).map_err(|e| {
        tracing::warn!("Rejected signal: {}", e);
        map_error(e)
    })?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /signal/:peer_id
async fn fetch_signals_handler(
    State(service): State<Arc<RendezvousService>>,
    Path(peer_id): Path<String>,
) -> Json<Vec<SignalRecord>> {
    Json(service.fetch_signals(&peer_id))
}

/// GET /ice-servers
async fn ice_servers_handler(
    State(service): State<Arc<RendezvousService>>,
) -> Json<IceServersResponse> {
    Json(service.ice_servers())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendezvousConfig;

    #[test]
    fn test_map_error_status() {
        let (status, body) = map_error(Error::InvalidArgument("peerId is required".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0.error, "peerId is required");

        let (status, _) = map_error(Error::ServerError("boom".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let service = Arc::new(RendezvousService::new(RendezvousConfig::default()));
        let Json(health) = health_handler(State(service)).await;
        assert_eq!(health.status, "healthy");
        assert!(health.timestamp > 0);
    }
}
