use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / gigo.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   gigo.toml:       [http]
//                    development_mode = true
//
//   env var:         GIGO_HTTP__DEVELOPMENT_MODE=true   (double underscore = nesting)
//
//   (single underscore stays within field names: GIGO_BROADCAST__PING_INTERVAL_MS)

pub const CONFIG_FILE_NAME: &str = "gigo.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub http: HttpFileConfig,
    #[serde(default)]
    pub broker: BrokerFileConfig,
    #[serde(default)]
    pub broadcast: BroadcastFileConfig,
}

/// Listener settings (lives under `[server]` in gigo.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// HTTP surface settings (lives under `[http]` in gigo.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpFileConfig {
    /// Regex patterns matched against the Origin header of websocket upgrades.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Relaxes cookie flags (no `Secure`, `SameSite=Lax`).
    #[serde(default)]
    pub development_mode: bool,
    /// Cookie scope; cookies are set for `.<domain>`.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// HS256 secret for session tokens.
    #[serde(default)]
    pub jwt_secret: String,
}

impl Default for HttpFileConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            development_mode: false,
            domain: default_domain(),
            jwt_secret: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process broker; nothing survives a restart.
    #[default]
    Memory,
    /// NATS JetStream.
    Nats,
}

/// Message broker settings (lives under `[broker]` in gigo.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerFileConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// JetStream stream holding `broadcast.message.*`.
    #[serde(default = "default_message_stream")]
    pub message_stream: String,
    /// JetStream stream holding `broadcast.notification.*`.
    #[serde(default = "default_notification_stream")]
    pub notification_stream: String,
}

impl Default for BrokerFileConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            url: default_broker_url(),
            message_stream: default_message_stream(),
            notification_stream: default_notification_stream(),
        }
    }
}

/// Websocket fan-out timing (lives under `[broadcast]` in gigo.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastFileConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

impl Default for BroadcastFileConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    31000
}
fn default_allowed_origins() -> Vec<String> {
    vec![r"^https?://localhost(:[0-9]+)?$".to_string()]
}
fn default_domain() -> String {
    "localhost".to_string()
}
fn default_broker_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}
fn default_message_stream() -> String {
    "BROADCAST_MESSAGE".to_string()
}
fn default_notification_stream() -> String {
    "BROADCAST_NOTIFICATION".to_string()
}
fn default_poll_timeout_ms() -> u64 {
    100
}
fn default_ping_interval_ms() -> u64 {
    1000
}

/// Build a figment that layers: defaults → gigo.toml → GIGO_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `GIGO_HTTP__DOMAIN=gigo.dev`  →  `http.domain = "gigo.dev"`
///   `GIGO_BROKER__KIND=nats`      →  `broker.kind = "nats"`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE_NAME)))
        .merge(Env::prefixed("GIGO_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// HTTP surface configuration (runtime view).
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub allowed_origins: Vec<String>,
    pub development_mode: bool,
    pub domain: String,
    pub jwt_secret: String,
}

impl HttpConfig {
    pub fn from_file(fc: &HttpFileConfig) -> Result<Self> {
        if fc.jwt_secret.is_empty() {
            bail!("http.jwt_secret must be set (GIGO_HTTP__JWT_SECRET)");
        }
        Ok(Self {
            allowed_origins: fc.allowed_origins.clone(),
            development_mode: fc.development_mode,
            domain: fc.domain.clone(),
            jwt_secret: fc.jwt_secret.clone(),
        })
    }
}

/// Broker connection configuration (runtime view).
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub url: String,
    pub message_stream: String,
    pub notification_stream: String,
}

impl BrokerConfig {
    pub fn from_file(fc: &BrokerFileConfig) -> Self {
        Self {
            kind: fc.kind,
            url: fc.url.clone(),
            message_stream: fc.message_stream.clone(),
            notification_stream: fc.notification_stream.clone(),
        }
    }
}

/// Websocket fan-out timing (runtime view).
#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Bounded wait of one broker poll; also the worker cancellation latency.
    pub poll_timeout: Duration,
    /// Interval between protocol-level pings.
    pub ping_interval: Duration,
}

impl BroadcastConfig {
    pub fn from_file(fc: &BroadcastFileConfig) -> Self {
        Self {
            poll_timeout: Duration::from_millis(fc.poll_timeout_ms.max(1)),
            ping_interval: Duration::from_millis(fc.ping_interval_ms.max(1)),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self::from_file(&BroadcastFileConfig::default())
    }
}

/// Everything the server needs at startup.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub http: HttpConfig,
    pub broker: BrokerConfig,
    pub broadcast: BroadcastConfig,
}

impl AppConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let listen_addr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "invalid listen address {}:{}",
                    fc.server.host, fc.server.port
                )
            })?;

        Ok(Self {
            listen_addr,
            http: HttpConfig::from_file(&fc.http)?,
            broker: BrokerConfig::from_file(&fc.broker),
            broadcast: BroadcastConfig::from_file(&fc.broadcast),
        })
    }

    /// Load and validate configuration from `config_dir`.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let fc: FileConfig = load_config(config_dir)
            .extract()
            .context("failed to load configuration")?;
        info!(
            "Configuration loaded (broker: {:?}, origins: {})",
            fc.broker.kind,
            fc.http.allowed_origins.len()
        );
        Self::from_file(&fc)
    }
}

/// Default configuration directory: `~/.config/gigo` (platform equivalent).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gigo")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_broadcast_defaults() {
        let bc = BroadcastConfig::default();
        assert_eq!(bc.poll_timeout, Duration::from_millis(100));
        assert_eq!(bc.ping_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_http_file_config_defaults() {
        let d = HttpFileConfig::default();
        assert!(!d.development_mode);
        assert_eq!(d.domain, "localhost");
        assert_eq!(d.allowed_origins.len(), 1);
        assert!(d.jwt_secret.is_empty());
    }

    #[test]
    fn test_broker_defaults_to_memory() {
        let d = BrokerFileConfig::default();
        assert_eq!(d.kind, BrokerKind::Memory);
        assert_eq!(d.notification_stream, "BROADCAST_NOTIFICATION");
    }

    // ── from_file ───────────────────────────────────────────────────────

    #[test]
    fn test_missing_jwt_secret_is_rejected() {
        let fc = FileConfig::default();
        assert!(AppConfig::from_file(&fc).is_err());
    }

    #[test]
    fn test_app_config_from_file() {
        let mut fc = FileConfig::default();
        fc.http.jwt_secret = "secret".into();
        fc.server.port = 8080;
        let ac = AppConfig::from_file(&fc).unwrap();
        assert_eq!(ac.listen_addr.port(), 8080);
        assert_eq!(ac.http.jwt_secret, "secret");
        assert_eq!(ac.broker.kind, BrokerKind::Memory);
    }

    #[test]
    fn test_invalid_host_is_rejected() {
        let mut fc = FileConfig::default();
        fc.http.jwt_secret = "secret".into();
        fc.server.host = "not a host".into();
        assert!(AppConfig::from_file(&fc).is_err());
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let bc = BroadcastConfig::from_file(&BroadcastFileConfig {
            poll_timeout_ms: 0,
            ping_interval_ms: 0,
        });
        assert_eq!(bc.poll_timeout, Duration::from_millis(1));
        assert_eq!(bc.ping_interval, Duration::from_millis(1));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.port, 31000);
        assert_eq!(fc.broadcast.poll_timeout_ms, 100);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            concat!(
                "[http]\n",
                "allowed_origins = [\"^https://gigo\\\\.dev$\"]\n",
                "development_mode = true\n",
                "domain = \"gigo.dev\"\n",
                "jwt_secret = \"s3cret\"\n",
                "[broker]\n",
                "kind = \"nats\"\n",
                "[broadcast]\n",
                "ping_interval_ms = 500\n",
            ),
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.http.allowed_origins, vec![r"^https://gigo\.dev$"]);
        assert!(fc.http.development_mode);
        assert_eq!(fc.http.domain, "gigo.dev");
        assert_eq!(fc.broker.kind, BrokerKind::Nats);
        assert_eq!(fc.broadcast.ping_interval_ms, 500);
        assert_eq!(fc.broadcast.poll_timeout_ms, 100);
    }

    #[test]
    fn test_app_config_load() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[http]\njwt_secret = \"s3cret\"\n[server]\nport = 9000\n",
        )
        .unwrap();
        let ac = AppConfig::load(tmp.path()).unwrap();
        assert_eq!(ac.listen_addr.port(), 9000);
    }
}
