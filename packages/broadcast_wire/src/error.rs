//! Decode and encode failures for broker envelopes.

use crate::subject::Channel;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty envelope")]
    Empty,

    #[error("unknown envelope tag {0:#04x}")]
    UnknownTag(u8),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),

    #[error("expected a {expected} envelope, found a {found} envelope")]
    UnexpectedVariant { expected: Channel, found: Channel },
}

impl From<postcard::Error> for WireError {
    fn from(err: postcard::Error) -> Self {
        WireError::Malformed(err.to_string())
    }
}
