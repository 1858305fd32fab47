//! The socket writer: sole owner of the websocket's write half.

use axum::extract::ws::{CloseFrame, Message, close_code};
use bytes::Bytes;
use futures::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use super::Outbound;
use super::hub::{CancellationHub, TeardownReason};
use crate::metrics::ServerMetrics;

pub const CLOSE_REASON: &str = "closing websocket";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    Cancelled,
    WriteFailed,
    PingFailed,
}

pub struct SocketWriter<S> {
    sink: S,
    messages: mpsc::Receiver<Outbound>,
    notifications: mpsc::Receiver<Outbound>,
    hub: CancellationHub,
    ping_interval: Duration,
    metrics: Arc<ServerMetrics>,
    user_id: i64,
}

impl<S> SocketWriter<S>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    pub fn new(
        sink: S,
        messages: mpsc::Receiver<Outbound>,
        notifications: mpsc::Receiver<Outbound>,
        hub: CancellationHub,
        ping_interval: Duration,
        metrics: Arc<ServerMetrics>,
        user_id: i64,
    ) -> Self {
        Self {
            sink,
            messages,
            notifications,
            hub,
            ping_interval,
            metrics,
            user_id,
        }
    }

    /// Multiplex both channels and the ping timer onto the socket until the
    /// hub fires or a write fails. Always fires the hub and closes the socket
    /// with "going away" on the way out.
    pub async fn run(mut self) -> WriterExit {
        let exit = self.write_loop().await;

        match exit {
            WriterExit::WriteFailed => self.hub.fire(TeardownReason::WriteFailed),
            WriterExit::PingFailed => self.hub.fire(TeardownReason::PingFailed),
            WriterExit::Cancelled => false,
        };
        close_going_away(&mut self.sink).await;
        exit
    }

    async fn write_loop(&mut self) -> WriterExit {
        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.hub.fired() => return WriterExit::Cancelled,
                _ = ping.tick() => {
                    if let Err(e) = self.sink.send(Message::Ping(Bytes::new())).await {
                        warn!(user_id = self.user_id, error = %e, "failed to ping websocket");
                        self.metrics.write_failed();
                        return WriterExit::PingFailed;
                    }
                    self.metrics.ping_sent();
                }
                Some(out) = self.messages.recv() => {
                    if !self.write(out).await {
                        return WriterExit::WriteFailed;
                    }
                }
                Some(out) = self.notifications.recv() => {
                    if !self.write(out).await {
                        return WriterExit::WriteFailed;
                    }
                }
            }
        }
    }

    async fn write(&mut self, out: Outbound) -> bool {
        let channel = out.channel;
        let frame = match out.into_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(user_id = self.user_id, %channel, error = %e, "failed to encode frame");
                self.metrics.write_failed();
                return false;
            }
        };
        if let Err(e) = self.sink.send(frame).await {
            warn!(user_id = self.user_id, %channel, error = %e, "failed to write to websocket");
            self.metrics.write_failed();
            return false;
        }
        self.metrics.frame_sent(channel);
        true
    }
}

/// Send the close frame (1001 going away) and shut the sink. Errors are
/// expected when the peer is already gone and are only logged.
pub async fn close_going_away<S>(sink: &mut S)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let frame = CloseFrame {
        code: close_code::AWAY,
        reason: CLOSE_REASON.into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not delivered");
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "socket already closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broadcast_wire::Channel;
    use futures::StreamExt;
    use futures::channel::mpsc as fmpsc;

    struct Harness {
        frames: fmpsc::UnboundedReceiver<Message>,
        messages: mpsc::Sender<Outbound>,
        notifications: mpsc::Sender<Outbound>,
        hub: CancellationHub,
        metrics: Arc<ServerMetrics>,
        writer: tokio::task::JoinHandle<WriterExit>,
    }

    fn spawn_writer(ping_interval: Duration) -> Harness {
        let (sink, frames) = fmpsc::unbounded::<Message>();
        let (messages, messages_rx) = mpsc::channel(1);
        let (notifications, notifications_rx) = mpsc::channel(1);
        let hub = CancellationHub::new();
        let metrics = Arc::new(ServerMetrics::new());
        let writer = SocketWriter::new(
            sink,
            messages_rx,
            notifications_rx,
            hub.clone(),
            ping_interval,
            metrics.clone(),
            42,
        );
        Harness {
            frames,
            messages,
            notifications,
            hub,
            metrics,
            writer: tokio::spawn(writer.run()),
        }
    }

    fn assert_going_away(frame: Option<Message>) {
        match frame {
            Some(Message::Close(Some(cf))) => {
                assert_eq!(cf.code, close_code::AWAY);
                assert_eq!(cf.reason.as_str(), CLOSE_REASON);
            }
            other => panic!("expected going-away close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn writes_json_string_frames() {
        let mut h = spawn_writer(Duration::from_secs(60));
        h.messages
            .send(Outbound::new(Channel::Message, "hello".into()))
            .await
            .unwrap();
        h.notifications
            .send(Outbound::new(Channel::Notification, "you have \"mail\"".into()))
            .await
            .unwrap();

        let mut texts = Vec::new();
        for _ in 0..2 {
            match h.frames.next().await {
                Some(Message::Text(t)) => texts.push(t.as_str().to_string()),
                other => panic!("expected text frame, got {other:?}"),
            }
        }
        texts.sort();
        assert_eq!(texts, vec![r#""hello""#, r#""you have \"mail\"""#]);

        h.hub.fire(TeardownReason::ClientClosed);
        h.writer.await.unwrap();
        let snap = h.metrics.snapshot();
        assert_eq!(snap.delivery.messages_sent, 1);
        assert_eq!(snap.delivery.notifications_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_every_interval() {
        let mut h = spawn_writer(Duration::from_secs(1));
        let start = Instant::now();
        for i in 1..=3u32 {
            match h.frames.next().await {
                Some(Message::Ping(p)) => assert!(p.is_empty()),
                other => panic!("expected ping, got {other:?}"),
            }
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_secs(1) * i);
            assert!(elapsed < Duration::from_secs(1) * i + Duration::from_millis(200));
        }
        assert_eq!(h.metrics.snapshot().delivery.pings_sent, 3);
    }

    #[tokio::test]
    async fn cancellation_closes_once_with_going_away() {
        let mut h = spawn_writer(Duration::from_secs(60));
        h.hub.fire(TeardownReason::ClientClosed);
        assert_eq!(h.writer.await.unwrap(), WriterExit::Cancelled);

        assert_going_away(h.frames.next().await);
        // sink closed: stream ends, no second close frame
        assert!(h.frames.next().await.is_none());
        assert_eq!(h.hub.reason(), Some(TeardownReason::ClientClosed));
    }

    #[tokio::test]
    async fn write_failure_fires_hub() {
        let h = spawn_writer(Duration::from_secs(60));
        drop(h.frames);
        h.messages
            .send(Outbound::new(Channel::Message, "lost".into()))
            .await
            .unwrap();

        assert_eq!(h.writer.await.unwrap(), WriterExit::WriteFailed);
        assert_eq!(h.hub.reason(), Some(TeardownReason::WriteFailed));
        assert_eq!(h.metrics.snapshot().errors.write, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_failure_fires_hub() {
        let h = spawn_writer(Duration::from_secs(1));
        drop(h.frames);
        assert_eq!(h.writer.await.unwrap(), WriterExit::PingFailed);
        assert_eq!(h.hub.reason(), Some(TeardownReason::PingFailed));
    }

    #[tokio::test]
    async fn closed_channels_do_not_end_writer() {
        let mut h = spawn_writer(Duration::from_secs(60));
        drop(h.messages);
        drop(h.notifications);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.writer.is_finished());

        h.hub.fire(TeardownReason::WorkersExited);
        assert_eq!(h.writer.await.unwrap(), WriterExit::Cancelled);
        assert_going_away(h.frames.next().await);
    }
}
