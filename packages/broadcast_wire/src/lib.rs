//! Binary broker envelopes and subject naming for GIGO broadcast fan-out.
//!
//! Producers publish one [`Envelope`] per broker record on a per-user subject
//! (see [`Channel::subject`]). The websocket gateway decodes it back into the
//! inner string and forwards that string to the browser untouched.

pub mod envelope;
pub mod error;
pub mod subject;

pub use envelope::{
    BroadcastMessage, BroadcastNotification, Envelope, decode, decode_message,
    decode_notification, encode,
};
pub use error::WireError;
pub use subject::Channel;
