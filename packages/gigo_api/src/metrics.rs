//! Server metrics for observability
//!
//! Counters for the broadcast websocket fan-out, exposed as JSON on `/metrics`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use broadcast_wire::Channel;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open broadcast websockets
    pub active_connections: AtomicU64,
    /// Total broadcast websockets accepted since server start
    pub total_connections: AtomicU64,
    /// Upgrades the broadcast handler refused before the protocol switch
    /// (origin or handshake). Auth failures are answered by the middleware
    /// and are not counted here.
    pub rejected_upgrades: AtomicU64,

    // Delivery metrics
    /// Broadcast messages written to clients
    pub messages_sent: AtomicU64,
    /// Notifications written to clients
    pub notifications_sent: AtomicU64,
    /// Deliveries acknowledged to the broker
    pub acks: AtomicU64,
    /// Pings written
    pub pings_sent: AtomicU64,

    // Error metrics
    /// Envelopes that failed to decode
    pub decode_failures: AtomicU64,
    /// Notification stream purges triggered by undecodable envelopes
    pub purges: AtomicU64,
    /// Socket write or ping failures
    pub write_failures: AtomicU64,
    /// Broker subscribe failures
    pub subscribe_failures: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn upgrade_rejected(&self) {
        self.rejected_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    // Delivery tracking
    pub fn frame_sent(&self, channel: Channel) {
        match channel {
            Channel::Message => self.messages_sent.fetch_add(1, Ordering::Relaxed),
            Channel::Notification => self.notifications_sent.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn acked(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn decode_failed(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn purged(&self) {
        self.purges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_failed(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribe_failed(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                rejected: self.rejected_upgrades.load(Ordering::Relaxed),
            },
            delivery: DeliveryMetrics {
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
                acks: self.acks.load(Ordering::Relaxed),
                pings_sent: self.pings_sent.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                decode: self.decode_failures.load(Ordering::Relaxed),
                purges: self.purges.load(Ordering::Relaxed),
                write: self.write_failures.load(Ordering::Relaxed),
                subscribe: self.subscribe_failures.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub delivery: DeliveryMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMetrics {
    pub messages_sent: u64,
    pub notifications_sent: u64,
    pub acks: u64,
    pub pings_sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub decode: u64,
    pub purges: u64,
    pub write: u64,
    pub subscribe: u64,
}
