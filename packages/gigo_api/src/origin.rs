//! Origin allow-list for websocket upgrades.

use anyhow::{Context, Result};
use axum::http::{HeaderMap, header::ORIGIN};
use regex::Regex;
use tracing::debug;

use crate::error::ApiError;

/// Compiled allow-list of Origin patterns.
///
/// Each configured entry is a regular expression matched against the raw
/// Origin header value; any single match allows the request.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    patterns: Vec<Regex>,
}

impl OriginPolicy {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(p).with_context(|| format!("invalid allowed origin pattern {p:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn allows(&self, origin: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(origin))
    }

    /// A missing or non-ASCII Origin header is checked as the empty string.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let origin = headers
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if self.allows(origin) {
            debug!(origin, "origin allowed");
            return Ok(());
        }
        Err(ApiError::OriginRejected {
            origin: origin.to_string(),
        })
    }
}
