use axum::{
    Extension,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

use crate::AppState;
use crate::auth::CallingUser;
use crate::broadcast::{BroadcastSession, ConnectionEnv};
use crate::error::ApiError;

/// Broadcast/notification fan-out websocket.
///
/// Checks run in order and each one aborts the request before the next:
/// principal (500), origin (403), upgrade (500). Only then is the protocol
/// switched and the session started.
pub async fn broadcast_ws_handler(
    State(state): State<AppState>,
    user: CallingUser,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(err) = state.origins.check(&headers) {
        state.metrics.upgrade_rejected();
        return err.into_response();
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            state.metrics.upgrade_rejected();
            return ApiError::UpgradeFailed(rejection.body_text()).into_response();
        }
    };

    let remote_ip = request_ip(&headers).or(connect_info.map(|Extension(ConnectInfo(addr))| addr.ip()));
    let env = ConnectionEnv::new(user.id, user.user_name, remote_ip);
    debug!(user_id = env.user_id, conn_id = %env.conn_id, "upgrading broadcast websocket");

    let session = BroadcastSession::new(
        env,
        state.broker.clone(),
        state.metrics.clone(),
        state.broadcast.clone(),
        &state.shutdown,
    );

    upgrade
        .on_failed_upgrade(|e| warn!(error = %e, "broadcast websocket upgrade failed"))
        .on_upgrade(move |socket: WebSocket| async move {
            let (sink, stream) = socket.split();
            session.run(sink, stream).await;
        })
}

/// Caller address as reported by the fronting proxy.
fn request_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .and_then(|ip| ip.trim().parse().ok())
}
