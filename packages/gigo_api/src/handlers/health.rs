use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::AppState;

/// Budget for the broker round-trip behind `/healthz`.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub health: String,
}

/// Liveness probe for the load balancer
pub async fn ping_handler() -> impl IntoResponse {
    Json(PingResponse {
        status: "running".into(),
    })
}

/// Health check - 500 when the broker does not answer within the budget
pub async fn healthz_handler(State(state): State<AppState>) -> Response {
    let healthy = match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.broker.health_check()).await
    {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(broker = state.broker.backend_name(), error = %e, "broker health check failed");
            false
        }
        Err(_) => {
            warn!(broker = state.broker.backend_name(), "broker health check timed out");
            false
        }
    };

    let (status, health) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "not ok")
    };
    (
        status,
        Json(HealthResponse {
            health: health.into(),
        }),
    )
        .into_response()
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
