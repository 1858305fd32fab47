//! Detached read half: turns client-initiated close into a hub firing.

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use tracing::debug;

use super::hub::{CancellationHub, TeardownReason};

/// Drain the socket's read half until the client goes away or the hub fires.
///
/// Reading keeps control frames flowing (pongs, the close handshake). Data
/// frames from the client carry no meaning on this socket and are dropped.
pub async fn detach_reader<R, E>(mut stream: R, hub: CancellationHub)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            _ = hub.fired() => return,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Close(close))) => {
                debug!(code = ?close.as_ref().map(|c| c.code), "client closed websocket");
                hub.fire(TeardownReason::ClientClosed);
                return;
            }
            Some(Ok(Message::Pong(_) | Message::Ping(_))) => {}
            Some(Ok(_)) => debug!("ignoring client data frame"),
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                hub.fire(TeardownReason::ReadFailed);
                return;
            }
            None => {
                hub.fire(TeardownReason::ClientClosed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{CloseFrame, close_code};
    use futures::channel::mpsc;
    use std::time::Duration;

    type Frames = mpsc::UnboundedSender<Result<Message, String>>;

    fn spawn_reader() -> (Frames, CancellationHub, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded::<Result<Message, String>>();
        let hub = CancellationHub::new();
        let task = tokio::spawn(detach_reader(rx, hub.clone()));
        (tx, hub, task)
    }

    async fn finished(task: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reader exits")
            .unwrap();
    }

    #[tokio::test]
    async fn close_frame_fires_hub() {
        let (tx, hub, task) = spawn_reader();
        tx.unbounded_send(Ok(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "bye".into(),
        }))))
        .unwrap();
        finished(task).await;
        assert_eq!(hub.reason(), Some(TeardownReason::ClientClosed));
    }

    #[tokio::test]
    async fn end_of_stream_fires_hub() {
        let (tx, hub, task) = spawn_reader();
        drop(tx);
        finished(task).await;
        assert_eq!(hub.reason(), Some(TeardownReason::ClientClosed));
    }

    #[tokio::test]
    async fn read_error_fires_hub() {
        let (tx, hub, task) = spawn_reader();
        tx.unbounded_send(Err("connection reset".into())).unwrap();
        finished(task).await;
        assert_eq!(hub.reason(), Some(TeardownReason::ReadFailed));
    }

    #[tokio::test]
    async fn pongs_and_data_are_ignored() {
        let (tx, hub, task) = spawn_reader();
        tx.unbounded_send(Ok(Message::Pong(Default::default())))
            .unwrap();
        tx.unbounded_send(Ok(Message::Text("hi".into()))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!hub.is_fired());
        assert!(!task.is_finished());

        hub.fire(TeardownReason::WriteFailed);
        finished(task).await;
        assert_eq!(hub.reason(), Some(TeardownReason::WriteFailed));
    }
}
