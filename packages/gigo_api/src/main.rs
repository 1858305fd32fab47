use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::MakeSpan, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use broadcast_wire::{Channel, Envelope};
use gigo_api::auth::{CallingUser, SessionAuth};
use gigo_api::broker::{Broker, MemoryBroker};
use gigo_api::config::{AppConfig, BrokerConfig, BrokerKind, default_config_dir};
use gigo_api::{AppState, create_router};

/// Custom span maker that includes a unique request ID
#[derive(Clone, Copy)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "gigo-api")]
#[command(about = "GIGO external API: broadcast and notification websocket")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding gigo.toml (defaults to ~/.config/gigo)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server in the foreground (default)
    Serve(ServeArgs),

    /// Publish one record onto a user's broadcast subject
    Publish(PublishArgs),

    /// Mint a session token for local testing
    Token(TokenArgs),
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Override the bind host from the config file
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Override the port from the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the broker backend from the config file
    #[arg(long, value_enum)]
    broker: Option<BrokerKind>,
}

#[derive(Parser)]
struct PublishArgs {
    /// Recipient user id
    user_id: i64,

    #[arg(value_enum)]
    channel: PublishChannel,

    /// Text delivered to the client as a JSON string
    text: String,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PublishChannel {
    Message,
    Notification,
}

impl From<PublishChannel> for Channel {
    fn from(c: PublishChannel) -> Self {
        match c {
            PublishChannel::Message => Channel::Message,
            PublishChannel::Notification => Channel::Notification,
        }
    }
}

#[derive(Parser)]
struct TokenArgs {
    user_id: i64,

    #[arg(default_value = "gigo")]
    user_name: String,

    /// Token lifetime in seconds
    #[arg(long, default_value = "3600")]
    ttl: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "gigo_api=debug,tower_http=debug,info"
    } else {
        "gigo_api=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);
    let config = AppConfig::load(&config_dir)
        .with_context(|| format!("failed to load config from {}", config_dir.display()))?;

    match cli.command {
        None => run_server(config, ServeArgs::default()).await,
        Some(Commands::Serve(args)) => run_server(config, args).await,
        Some(Commands::Publish(args)) => publish(config, args).await,
        Some(Commands::Token(args)) => {
            let auth = SessionAuth::new(&config.http);
            let token = auth.issue(
                &CallingUser {
                    id: args.user_id,
                    user_name: args.user_name,
                },
                Duration::from_secs(args.ttl),
            )?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn connect_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match config.kind {
        BrokerKind::Memory => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "nats")]
        BrokerKind::Nats => {
            let broker = gigo_api::broker::NatsBroker::connect(config)
                .await
                .with_context(|| format!("failed to connect to NATS at {}", config.url))?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "nats"))]
        BrokerKind::Nats => bail!("NATS broker requested but gigo-api was built without the `nats` feature"),
    }
}

async fn run_server(mut config: AppConfig, args: ServeArgs) -> Result<()> {
    if let Some(kind) = args.broker {
        config.broker.kind = kind;
    }
    if args.host.is_some() || args.port.is_some() {
        let host = args
            .host
            .unwrap_or_else(|| config.listen_addr.ip().to_string());
        let port = args.port.unwrap_or(config.listen_addr.port());
        config.listen_addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;
    }

    info!("Starting GIGO external API");
    let broker = connect_broker(&config.broker).await?;
    info!(broker = broker.backend_name(), "Broker ready");
    if matches!(config.broker.kind, BrokerKind::Memory) {
        warn!("Using the in-memory broker; records only reach sockets in this process");
    }

    let state = AppState::new(&config, broker)?;
    let shutdown = state.shutdown.clone();

    let app = create_router(state)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("Listening on http://{}", listener.local_addr()?);

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, closing broadcast sockets...");
        shutdown.cancel();
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn publish(config: AppConfig, args: PublishArgs) -> Result<()> {
    if matches!(config.broker.kind, BrokerKind::Memory) {
        bail!("publishing needs a shared broker; set broker.kind = \"nats\"");
    }
    let broker = connect_broker(&config.broker).await?;

    let channel = Channel::from(args.channel);
    let envelope = match channel {
        Channel::Message => Envelope::message(args.text),
        Channel::Notification => Envelope::notification(args.text),
    };
    let payload = broadcast_wire::encode(&envelope)?;
    let subject = channel.subject(args.user_id);

    broker.publish(&subject, Bytes::from(payload)).await?;
    info!(subject = %subject, "Published");
    Ok(())
}
