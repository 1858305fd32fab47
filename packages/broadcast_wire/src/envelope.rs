//! Broker envelope codec.
//!
//! Wire format: `[tag][fields]`, produced by `postcard` from [`Envelope`].
//!
//! - `tag` is the variant index as a varint; only `0x00` (message) and
//!   `0x01` (notification) are defined, so it is always one byte.
//! - `fields` is the variant's single string: varint byte length followed by
//!   UTF-8 bytes.
//!
//! Unknown tags, truncated strings, invalid UTF-8 and trailing bytes are all
//! decode errors. Nothing is skipped or defaulted.

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::subject::Channel;

const TAG_MESSAGE: u8 = 0x00;
const TAG_NOTIFICATION: u8 = 0x01;

/// Broadcast shown to every connected client of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub init_message: String,
}

/// A notification for a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastNotification {
    pub notification: String,
}

/// One broker record. Variant order is part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Message(BroadcastMessage),
    Notification(BroadcastNotification),
}

impl Envelope {
    pub fn message(init_message: impl Into<String>) -> Self {
        Envelope::Message(BroadcastMessage {
            init_message: init_message.into(),
        })
    }

    pub fn notification(notification: impl Into<String>) -> Self {
        Envelope::Notification(BroadcastNotification {
            notification: notification.into(),
        })
    }

    pub fn channel(&self) -> Channel {
        match self {
            Envelope::Message(_) => Channel::Message,
            Envelope::Notification(_) => Channel::Notification,
        }
    }

    /// The opaque string the client renders.
    pub fn into_payload(self) -> String {
        match self {
            Envelope::Message(m) => m.init_message,
            Envelope::Notification(n) => n.notification,
        }
    }
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    Ok(postcard::to_allocvec(envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    match bytes.first() {
        None => return Err(WireError::Empty),
        Some(&(TAG_MESSAGE | TAG_NOTIFICATION)) => {}
        Some(&tag) => return Err(WireError::UnknownTag(tag)),
    }

    let (envelope, rest) = postcard::take_from_bytes::<Envelope>(bytes)?;
    if !rest.is_empty() {
        return Err(WireError::TrailingBytes(rest.len()));
    }
    Ok(envelope)
}

/// Decode a record from a message subject. A notification is an error.
pub fn decode_message(bytes: &[u8]) -> Result<BroadcastMessage, WireError> {
    match decode(bytes)? {
        Envelope::Message(m) => Ok(m),
        other => Err(WireError::UnexpectedVariant {
            expected: Channel::Message,
            found: other.channel(),
        }),
    }
}

/// Decode a record from a notification subject. A message is an error.
pub fn decode_notification(bytes: &[u8]) -> Result<BroadcastNotification, WireError> {
    match decode(bytes)? {
        Envelope::Notification(n) => Ok(n),
        other => Err(WireError::UnexpectedVariant {
            expected: Channel::Notification,
            found: other.channel(),
        }),
    }
}
