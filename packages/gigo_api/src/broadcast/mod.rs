//! Per-user broadcast and notification fan-out over a websocket.

mod hub;
mod reader;
mod session;
mod subscriber;
mod worker;
mod writer;

use axum::extract::ws::Message;
use broadcast_wire::Channel;

pub use hub::{CancellationHub, TeardownReason};
pub use reader::detach_reader;
pub use session::{BroadcastSession, ConnectionEnv, SessionReport};
pub use subscriber::{SubscriptionPair, subscribe_pair};
pub use worker::{PoisonPolicy, PollWorker, WorkerExit, decode_payload};
pub use writer::{CLOSE_REASON, SocketWriter, WriterExit, close_going_away};

/// A decoded payload on its way from a poll worker to the writer. Distinct
/// from the broker envelope: only the inner string survives decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub channel: Channel,
    pub payload: String,
}

impl Outbound {
    pub fn new(channel: Channel, payload: String) -> Self {
        Self { channel, payload }
    }

    /// The payload as a JSON string in a text frame. The client receives the
    /// string itself, not an object wrapping it.
    pub fn into_frame(self) -> Result<Message, serde_json::Error> {
        let json = serde_json::to_string(&self.payload)?;
        Ok(Message::Text(json.into()))
    }
}
