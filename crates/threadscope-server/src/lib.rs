//! Live snapshot server.
//!
//! Pushes every sampler snapshot to connected viewers over WebSocket, one
//! JSON text frame per snapshot, and exposes a small JSON index and health
//! route next to it.

pub mod config;
pub mod error;
pub mod hub;
pub mod session;

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Serialize;
use threadscope_core::{Sampler, SamplerState, StatsProvider, default_provider};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use config::{ServerConfig, SessionConfig};
pub use error::ServerError;
pub use hub::Hub;
pub use session::{CloseReason, Session, SessionHandle, SessionState, SessionSummary};

/// Shared server state.
struct AppState {
    sampler: Sampler,
    hub: Hub,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    sampler: String,
    sessions: usize,
    sessions_accepted: u64,
    snapshots_produced: u64,
    interval_ms: u64,
}

async fn handle_ws(
    State(state): State<Arc<AppState>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            log::warn!("rejected websocket handshake: {rejection}");
            return rejection.into_response();
        }
    };

    let hub = state.hub.clone();
    upgrade
        .on_failed_upgrade(|e| log::warn!("websocket upgrade failed: {e}"))
        .on_upgrade(move |socket| async move {
            hub.accept(socket).await;
        })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let sampler_state = state.sampler.state();
    Json(HealthResponse {
        status: if sampler_state == SamplerState::Running {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        sampler: sampler_state.to_string(),
        sessions: state.hub.session_count(),
        sessions_accepted: state.hub.accepted(),
        snapshots_produced: state.sampler.produced(),
        interval_ms: state.sampler.config().interval.as_millis() as u64,
    })
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = state.hub.config();
    Json(serde_json::json!({
        "name": "threadscope",
        "version": threadscope_core::VERSION,
        "endpoints": {
            "/": "This API index",
            "/ws": {
                "protocol": "websocket",
                "description": "One JSON snapshot per sampler tick",
                "ping_interval_ms": config.ping_interval.as_millis() as u64,
                "read_deadline_ms": config.read_deadline.as_millis() as u64,
            },
            "/health": "Health check",
        },
    }))
}

/// Build the axum router over a running sampler and its hub.
pub fn build_router(sampler: Sampler, hub: Hub) -> Router {
    let state = Arc::new(AppState { sampler, hub });

    Router::new()
        .route("/", get(handle_index))
        .route("/ws", get(handle_ws))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Bind `config.host:config.port` and serve with the platform's default
/// provider until `shutdown` fires.
pub async fn run_server(config: ServerConfig, shutdown: CancellationToken) -> Result<(), ServerError> {
    config.validate()?;
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    log::info!("listening on http://{addr} (viewers: ws://{addr}/ws)");
    serve(listener, default_provider(), config, shutdown).await
}

/// Serve on an already bound listener.
///
/// Starts the sampler and the broadcast task, then runs the HTTP server.
/// On shutdown every session is closed and the sampler is stopped and joined
/// before this returns.
pub async fn serve(
    listener: TcpListener,
    provider: Arc<dyn StatsProvider>,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    log::info!("sampling with provider: {}", provider.name());
    let sampler = Sampler::new(provider, config.sampler.clone());
    let hub = Hub::new(config.session.clone(), shutdown.child_token());
    let dispatch = hub.spawn_dispatch(sampler.subscribe());
    sampler.start()?;

    let app = build_router(sampler.clone(), hub.clone());
    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await;

    log::info!("shutting down ({} open sessions)", hub.session_count());
    hub.shutdown();
    sampler.shutdown().await;
    if let Err(e) = dispatch.await {
        log::error!("broadcast task failed: {e}");
    }
    served.map_err(ServerError::Serve)
}
