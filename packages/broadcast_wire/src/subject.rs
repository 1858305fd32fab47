//! Per-user broker subjects.

use std::fmt;

use serde::{Deserialize, Serialize};

const MESSAGE_SUBJECT_PREFIX: &str = "broadcast.message";
const NOTIFICATION_SUBJECT_PREFIX: &str = "broadcast.notification";

/// The two broadcast sources a user's socket fans in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// System-wide broadcast messages (`InitMessage` payloads).
    Message,
    /// Per-user notifications (`Notification` payloads).
    Notification,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Message, Channel::Notification];

    /// Subject this channel uses for `user_id`, e.g. `broadcast.message.42`.
    pub fn subject(self, user_id: i64) -> String {
        format!("{}.{}", self.subject_prefix(), user_id)
    }

    pub fn subject_prefix(self) -> &'static str {
        match self {
            Channel::Message => MESSAGE_SUBJECT_PREFIX,
            Channel::Notification => NOTIFICATION_SUBJECT_PREFIX,
        }
    }

    /// Wildcard subject covering every user, used when declaring streams.
    pub fn wildcard_subject(self) -> String {
        format!("{}.*", self.subject_prefix())
    }

    /// Channel owning a concrete subject such as `broadcast.notification.7`.
    pub fn from_subject(subject: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| {
            subject
                .strip_prefix(c.subject_prefix())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|user| !user.is_empty() && !user.contains('.'))
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Message => "message",
            Channel::Notification => "notification",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
