//! Structured error responses shared by every HTTP handler.
//!
//! Every failure leaves the server as `{"message": "<string>"}` with a status
//! code. What gets logged is the error's `Display`; what the client sees is
//! the response message, which is deliberately opaque for server faults.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error occurred";
pub const LOGIN_REQUIRED_MESSAGE: &str = "You must be logged in to access the GIGO system.";
pub const LOGOUT_MESSAGE: &str = "logout";
pub const FORBIDDEN_MESSAGE: &str = "forbidden";

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("calling user missing from context")]
    AuthMissing,

    #[error("auth cookie is not present")]
    LoginRequired,

    #[error("authentication token invalid: {0}")]
    InvalidToken(String),

    #[error("user id missing after successful token authentication")]
    InvalidSubject,

    #[error("invalid origin {origin:?}")]
    OriginRejected { origin: String },

    #[error("failed to accept websocket connection: {0}")]
    UpgradeFailed(String),

    #[error("{context}: {source}")]
    Internal {
        context: String,
        /// Message returned to the caller, see [`select_error_response`].
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ApiError {
    /// Wrap a core failure, picking the client message from the core's
    /// response map when it carries one.
    pub fn internal(
        context: impl Into<String>,
        response: Option<&serde_json::Map<String, serde_json::Value>>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        ApiError::Internal {
            context: context.into(),
            message: select_error_response(INTERNAL_ERROR_MESSAGE, response),
            source: source.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthMissing
            | ApiError::InvalidSubject
            | ApiError::UpgradeFailed(_)
            | ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::LoginRequired | ApiError::InvalidToken(_) | ApiError::OriginRejected { .. } => {
                StatusCode::FORBIDDEN
            }
        }
    }

    /// The message the client sees.
    pub fn response_message(&self) -> String {
        match self {
            ApiError::AuthMissing | ApiError::UpgradeFailed(_) => INTERNAL_ERROR_MESSAGE.into(),
            ApiError::LoginRequired => LOGIN_REQUIRED_MESSAGE.into(),
            ApiError::InvalidToken(_) | ApiError::InvalidSubject => LOGOUT_MESSAGE.into(),
            ApiError::OriginRejected { .. } => FORBIDDEN_MESSAGE.into(),
            ApiError::Internal { message, .. } => message.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }

        let body = ErrorBody {
            message: self.response_message(),
        };
        (status, Json(body)).into_response()
    }
}

/// Pick the message for an error response.
///
/// Returns `response["message"]` when present and a string, otherwise
/// `default_message`.
pub fn select_error_response(
    default_message: &str,
    response: Option<&serde_json::Map<String, serde_json::Value>>,
) -> String {
    response
        .and_then(|r| r.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or(default_message)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn select_default_without_response() {
        assert_eq!(select_error_response("default", None), "default");
    }

    #[test]
    fn select_string_message() {
        let res = map(json!({ "message": "x" }));
        assert_eq!(select_error_response("default", Some(&res)), "x");
    }

    #[test]
    fn select_ignores_non_string_message() {
        let res = map(json!({ "message": 42 }));
        assert_eq!(select_error_response("default", Some(&res)), "default");
    }

    #[test]
    fn select_ignores_missing_message() {
        let res = map(json!({ "other": "y" }));
        assert_eq!(select_error_response("default", Some(&res)), "default");
    }

    #[test]
    fn statuses() {
        assert_eq!(
            ApiError::AuthMissing.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiError::LoginRequired.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::OriginRejected {
                origin: "https://evil.example".into()
            }
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::UpgradeFailed("no upgrade header".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn server_faults_are_opaque() {
        assert_eq!(
            ApiError::AuthMissing.response_message(),
            INTERNAL_ERROR_MESSAGE
        );
        assert_eq!(
            ApiError::UpgradeFailed("connection header missing".into()).response_message(),
            INTERNAL_ERROR_MESSAGE
        );
    }

    #[test]
    fn internal_uses_core_message() {
        let res = map(json!({ "message": "broadcast limit reached" }));
        let err = ApiError::internal("core failed", Some(&res), anyhow::anyhow!("boom"));
        assert_eq!(err.response_message(), "broadcast limit reached");

        let err = ApiError::internal("core failed", None, anyhow::anyhow!("boom"));
        assert_eq!(err.response_message(), INTERNAL_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn response_body_shape() {
        let response = ApiError::OriginRejected {
            origin: "https://evil.example".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.message, "forbidden");
    }
}
