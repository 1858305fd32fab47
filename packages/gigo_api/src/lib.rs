// Library interface for the GIGO external API
// Exposes the broadcast fan-out router so it can be served by the binary or embedded in tests

pub mod auth;
pub mod broadcast;
pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod origin;

use anyhow::Result;
use axum::{Router, middleware, routing::get};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::{SessionAuth, auth_middleware};
use crate::broker::Broker;
use crate::config::{AppConfig, BroadcastConfig};
use crate::metrics::ServerMetrics;
use crate::origin::OriginPolicy;

#[derive(Clone)]
pub struct AppState {
    /// Process-wide broker client
    pub broker: Arc<dyn Broker>,
    /// Websocket Origin allow-list
    pub origins: Arc<OriginPolicy>,
    pub auth: Arc<SessionAuth>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub broadcast: BroadcastConfig,
    /// Cancelled on server shutdown; every broadcast session hangs off it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &AppConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        Ok(Self {
            broker,
            origins: Arc::new(OriginPolicy::new(&config.http.allowed_origins)?),
            auth: Arc::new(SessionAuth::new(&config.http)),
            metrics: Arc::new(ServerMetrics::new()),
            broadcast: config.broadcast.clone(),
            shutdown: CancellationToken::new(),
        })
    }
}

/// All HTTP routes, behind the session auth middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping_handler))
        .route("/healthz", get(handlers::healthz_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/broadcast/ws", get(handlers::broadcast_ws_handler))
        .route("/api/broadcast/ws/{id}", get(handlers::broadcast_ws_handler))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth_middleware,
        ))
        .with_state(state)
}
