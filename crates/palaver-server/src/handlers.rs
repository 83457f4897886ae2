//! HTTP surface of the relay.
//!
//! This module owns the shared server state and the WebSocket upgrade
//! endpoint; the per-connection lifecycle lives in [`crate::session`].

use crate::config::Config;
use crate::metrics;
use crate::session;
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use palaver_core::{Broadcaster, IdentityResolver, MessageStore, Registry, RoomDirectory};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shared server state.
///
/// Constructed once at startup and passed to every connection; the registry
/// and broadcaster are never recreated mid-run.
pub struct AppState {
    /// Live connections grouped by room.
    pub registry: Arc<Registry>,
    /// Room fan-out over the registry.
    pub broadcaster: Broadcaster,
    /// Credential resolution.
    pub identity: Arc<dyn IdentityResolver>,
    /// Room existence and membership checks.
    pub directory: Arc<dyn RoomDirectory>,
    /// Message persistence.
    pub store: Arc<dyn MessageStore>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state over the given collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        identity: Arc<dyn IdentityResolver>,
        directory: Arc<dyn RoomDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            identity,
            directory,
            store,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(
    config: Config,
    identity: Arc<dyn IdentityResolver>,
    directory: Arc<dyn RoomDirectory>,
    store: Arc<dyn MessageStore>,
) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone(), identity, directory, store));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.ws_route(), get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Palaver relay listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}/<room_id>",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Connection-time parameters.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Bearer credential for the connecting user.
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The room id arrives as the trailing path segment and the credential as
/// the `token` query parameter; both are checked by the session after the
/// handshake so refusals can carry a close code.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| session::run(socket, room_id, params.token, state))
}
