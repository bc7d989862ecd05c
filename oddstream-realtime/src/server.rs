//! HTTP server for the realtime surface.
//!
//! Exactly two routes: `/healthz` and the `/ws` upgrade endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, routing::get};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::RealtimeError;
use crate::state::AppState;
use crate::ws::ws_handler;

/// The realtime HTTP/WebSocket server.
pub struct RealtimeServer {
    bind_address: String,
    state: Arc<AppState>,
}

impl RealtimeServer {
    /// Creates a server over the shared application state.
    #[must_use]
    pub fn new(bind_address: &str, state: Arc<AppState>) -> Self {
        Self {
            bind_address: bind_address.to_string(),
            state,
        }
    }

    /// Binds the listener and serves until shutdown is initiated.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid, binding fails, or
    /// the server aborts.
    pub async fn run(self) -> Result<(), RealtimeError> {
        let addr: SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| RealtimeError::Server(format!("invalid bind address: {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RealtimeError::Server(format!("failed to bind to {addr}: {e}")))?;

        info!("realtime server listening on {}", addr);

        let shutdown = self.state.shutdown.clone();
        let app = router(self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
            .await
            .map_err(|e| RealtimeError::Server(format!("server error: {e}")))
    }
}

/// Builds the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,
}

/// `GET /healthz`
async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
