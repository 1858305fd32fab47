//! Per-connection supervisor for the broadcast websocket.
//!
//! Task layout for one accepted socket:
//!
//! ```text
//! broker ─► message worker ──────┐
//!                                ├─► writer ─► socket (write half)
//! broker ─► notification worker ─┘
//!
//! socket (read half) ─► reader ─► hub ─► workers, writer
//! ```
//!
//! The session owns the hub and the task set. It fires the hub once every
//! worker has exited, then waits for the writer to close the socket.

use axum::extract::ws::Message;
use broadcast_wire::Channel;
use futures::{Sink, Stream};
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, info_span};
use uuid::Uuid;

use super::hub::{CancellationHub, TeardownReason};
use super::reader::detach_reader;
use super::subscriber::{SubscriptionPair, subscribe_pair};
use super::worker::{PoisonPolicy, PollWorker, WorkerExit};
use super::writer::{SocketWriter, WriterExit, close_going_away};
use crate::broker::Broker;
use crate::config::BroadcastConfig;
use crate::metrics::ServerMetrics;

/// Capacity of each worker → writer channel. One slot keeps the hand-off
/// as close to a rendezvous as tokio's mpsc allows.
const OUTBOUND_CAPACITY: usize = 1;

/// The request environment a session runs in, attached to every log line.
#[derive(Debug, Clone)]
pub struct ConnectionEnv {
    pub user_id: i64,
    pub user_name: String,
    pub conn_id: Uuid,
    pub remote_ip: Option<IpAddr>,
}

impl ConnectionEnv {
    pub fn new(user_id: i64, user_name: impl Into<String>, remote_ip: Option<IpAddr>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            conn_id: Uuid::new_v4(),
            remote_ip,
        }
    }

    pub fn span(&self) -> Span {
        info_span!(
            "broadcast_ws",
            user_id = self.user_id,
            user_name = %self.user_name,
            conn_id = %self.conn_id,
            remote_ip = ?self.remote_ip,
        )
    }
}

/// How a session ended.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub reason: TeardownReason,
    /// `None` when the writer never started (subscribe failure).
    pub writer: Option<WriterExit>,
    pub workers: Vec<(Channel, WorkerExit)>,
}

pub struct BroadcastSession {
    env: ConnectionEnv,
    broker: Arc<dyn Broker>,
    metrics: Arc<ServerMetrics>,
    config: BroadcastConfig,
    hub: CancellationHub,
}

impl BroadcastSession {
    pub fn new(
        env: ConnectionEnv,
        broker: Arc<dyn Broker>,
        metrics: Arc<ServerMetrics>,
        config: BroadcastConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            env,
            broker,
            metrics,
            config,
            hub: CancellationHub::child_of(shutdown),
        }
    }

    pub fn hub(&self) -> &CancellationHub {
        &self.hub
    }

    /// Run the session over an accepted socket's two halves until teardown.
    pub async fn run<S, R, E>(self, sink: S, stream: R) -> SessionReport
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let span = self.env.span();
        self.supervise(sink, stream).instrument(span).await
    }

    async fn supervise<S, R, E>(self, mut sink: S, stream: R) -> SessionReport
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        self.metrics.connection_opened();
        info!("broadcast websocket accepted");

        let reader = tokio::spawn(detach_reader(stream, self.hub.clone()).in_current_span());

        let pair = match subscribe_pair(self.broker.as_ref(), self.env.user_id).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to subscribe to broadcast subjects");
                self.metrics.subscribe_failed();
                self.hub.fire(TeardownReason::SubscribeFailed);
                close_going_away(&mut sink).await;
                let _ = reader.await;
                return self.finish(None, Vec::new());
            }
        };

        let (mut workers, messages, notifications) = self.spawn_workers(pair);

        let writer = SocketWriter::new(
            sink,
            messages,
            notifications,
            self.hub.clone(),
            self.config.ping_interval,
            self.metrics.clone(),
            self.env.user_id,
        );
        let writer = tokio::spawn(writer.run().in_current_span());

        let mut exits = Vec::with_capacity(2);
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(exit) => exits.push(exit),
                Err(e) => error!(error = %e, "poll worker panicked"),
            }
        }
        self.hub.fire(TeardownReason::WorkersExited);

        let writer_exit = match writer.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                error!(error = %e, "socket writer panicked");
                None
            }
        };
        let _ = reader.await;

        self.finish(writer_exit, exits)
    }

    #[allow(clippy::type_complexity)]
    fn spawn_workers(
        &self,
        pair: SubscriptionPair,
    ) -> (
        JoinSet<(Channel, WorkerExit)>,
        mpsc::Receiver<super::Outbound>,
        mpsc::Receiver<super::Outbound>,
    ) {
        let (message_tx, message_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (notification_tx, notification_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let mut workers = JoinSet::new();
        for (channel, subscription, tx) in [
            (Channel::Message, pair.message, message_tx),
            (Channel::Notification, pair.notification, notification_tx),
        ] {
            let worker = PollWorker::new(
                channel,
                subscription,
                tx,
                PoisonPolicy::for_channel(channel),
                self.broker.clone(),
                self.hub.clone(),
                self.config.poll_timeout,
                self.metrics.clone(),
            );
            workers.spawn(async move { (channel, worker.run().await) }.in_current_span());
        }

        (workers, message_rx, notification_rx)
    }

    fn finish(self, writer: Option<WriterExit>, workers: Vec<(Channel, WorkerExit)>) -> SessionReport {
        self.metrics.connection_closed();
        let reason = self.hub.reason().unwrap_or(TeardownReason::Shutdown);
        info!(%reason, ?writer, ?workers, "broadcast websocket closed");
        SessionReport {
            reason,
            writer,
            workers,
        }
    }
}
