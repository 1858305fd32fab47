//! Session authentication: HS256 session tokens carried in the `gigoAuthToken`
//! cookie (or an `Authorization: Bearer` header).
//!
//! The middleware verifies the token once and places a [`CallingUser`] in the
//! request extensions. Handlers never re-authenticate; they extract the
//! principal with the [`CallingUser`] extractor.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::SET_COOKIE,
    middleware::Next,
    response::{AppendHeaders, IntoResponse, Response},
};
use axum_extra::{
    extract::cookie::{Cookie, CookieJar, SameSite},
    headers::{Authorization, HeaderMapExt, authorization::Bearer},
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::ApiError;

pub const AUTH_COOKIE_NAME: &str = "gigoAuthToken";

// =============================================================================
// CallingUser
// =============================================================================

/// The authenticated principal. Immutable for the lifetime of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingUser {
    pub id: i64,
    pub user_name: String,
}

/// Session token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Decimal user id.
    pub sub: String,
    pub user_name: String,
    /// Expiry, seconds since the unix epoch.
    pub exp: u64,
}

// =============================================================================
// SessionAuth (shared across middleware and handlers)
// =============================================================================

/// Token keys plus the cookie settings used when a session is revoked.
pub struct SessionAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    development_mode: bool,
    domain: String,
}

impl SessionAuth {
    pub fn new(config: &HttpConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            development_mode: config.development_mode,
            domain: config.domain.clone(),
        }
    }

    /// Mint a session token for `user` valid for `ttl`.
    pub fn issue(&self, user: &CallingUser, ttl: Duration) -> Result<String, ApiError> {
        let claims = Claims {
            sub: user.id.to_string(),
            user_name: user.user_name.clone(),
            exp: (SystemTime::now() + ttl)
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ApiError::internal("failed to sign session token", None, e))
    }

    /// Verify a token and resolve the principal it names.
    pub fn verify(&self, token: &str) -> Result<CallingUser, ApiError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| ApiError::InvalidToken(e.to_string()))?;

        let id = match data.claims.sub.parse::<i64>() {
            Ok(id) if id > 0 => id,
            _ => return Err(ApiError::InvalidSubject),
        };
        Ok(CallingUser {
            id,
            user_name: data.claims.user_name,
        })
    }

    /// An expired `gigoAuthToken` cookie scoped to `.<domain>`.
    pub fn revoke_cookie(&self) -> Cookie<'static> {
        let same_site = if self.development_mode {
            SameSite::Lax
        } else {
            SameSite::Strict
        };
        let mut cookie = Cookie::build((AUTH_COOKIE_NAME, ""))
            .path("/")
            .http_only(true)
            .same_site(same_site)
            .secure(!self.development_mode)
            .domain(format!(".{}", self.domain))
            .build();
        cookie.make_removal();
        cookie
    }
}

// =============================================================================
// Auth Middleware
// =============================================================================

/// Auth middleware for HTTP routes.
///
/// 1. Public routes (ping, health, metrics) → pass through
/// 2. No token → 403 "You must be logged in..."
/// 3. Invalid or expired token → 403 "logout", cookie revoked
/// 4. Valid token → `CallingUser` inserted into extensions
pub async fn auth_middleware(
    State(auth): State<Arc<SessionAuth>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if is_public_route(request.uri().path()) {
        return next.run(request).await;
    }

    let Some(token) = session_token(&request) else {
        return ApiError::LoginRequired.into_response();
    };

    match auth.verify(&token) {
        Ok(user) => {
            debug!(user_id = user.id, "session authenticated");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err @ ApiError::InvalidToken(_)) => {
            warn!(path = %request.uri().path(), "cookie revoked");
            (
                AppendHeaders([(SET_COOKIE, auth.revoke_cookie().to_string())]),
                err,
            )
                .into_response()
        }
        Err(err) => err.into_response(),
    }
}

fn session_token(request: &Request<Body>) -> Option<String> {
    let jar = CookieJar::from_headers(request.headers());
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }
    request
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

fn is_public_route(path: &str) -> bool {
    path == "/ping" || path == "/healthz" || path == "/metrics"
}

// =============================================================================
// Axum Extractors
// =============================================================================

/// Extract CallingUser from request extensions (set by middleware).
/// Missing principal is a server fault: 500 "internal server error occurred".
impl<S> axum::extract::FromRequestParts<S> for CallingUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CallingUser>()
            .cloned()
            .ok_or(ApiError::AuthMissing)
    }
}
