//! Fire-once teardown signal shared by every task of one broadcast socket.

use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Why a broadcast socket was torn down. Only the first reason is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The client sent a close frame or the connection ended.
    ClientClosed,
    /// Reading from the socket failed.
    ReadFailed,
    /// A frame write failed.
    WriteFailed,
    /// A ping write failed.
    PingFailed,
    /// Every poll worker has exited.
    WorkersExited,
    /// The broker subscriptions could not be created.
    SubscribeFailed,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TeardownReason::ClientClosed => "client closed",
            TeardownReason::ReadFailed => "read failed",
            TeardownReason::WriteFailed => "write failed",
            TeardownReason::PingFailed => "ping failed",
            TeardownReason::WorkersExited => "workers exited",
            TeardownReason::SubscribeFailed => "subscribe failed",
            TeardownReason::Shutdown => "server shutdown",
        })
    }
}

/// Many-triggerer, many-observer cancellation signal.
///
/// Derived from the server's shutdown token rather than the HTTP request, so
/// it outlives the upgrade handler. Firing is idempotent.
#[derive(Debug, Clone)]
pub struct CancellationHub {
    token: CancellationToken,
    reason: Arc<OnceLock<TeardownReason>>,
}

impl Default for CancellationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationHub {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// A hub that also fires when `shutdown` is cancelled.
    pub fn child_of(shutdown: &CancellationToken) -> Self {
        Self {
            token: shutdown.child_token(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Fire the hub. Returns `true` only for the call that fired it first.
    pub fn fire(&self, reason: TeardownReason) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the hub has fired.
    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    /// First recorded reason; a hub cancelled through its parent reports
    /// [`TeardownReason::Shutdown`].
    pub fn reason(&self) -> Option<TeardownReason> {
        match self.reason.get() {
            Some(reason) => Some(*reason),
            None if self.token.is_cancelled() => Some(TeardownReason::Shutdown),
            None => None,
        }
    }
}
