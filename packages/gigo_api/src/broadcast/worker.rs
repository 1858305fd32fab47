//! Poll workers: one per subscription, feeding the socket writer.

use broadcast_wire::{Channel, WireError, decode_message, decode_notification};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::Outbound;
use super::hub::CancellationHub;
use crate::broker::{Broker, BrokerError, Delivery, Subscription};
use crate::metrics::ServerMetrics;

/// What a worker does with a record it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonPolicy {
    /// Log and exit. The record stays unacked and is redelivered later.
    ExitOnly,
    /// Purge the worker's subject, log and exit. A single malformed record
    /// would otherwise block the subject forever.
    PurgeAndExit,
}

impl PoisonPolicy {
    pub fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::Message => PoisonPolicy::ExitOnly,
            Channel::Notification => PoisonPolicy::PurgeAndExit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The hub fired.
    Cancelled,
    /// The broker closed the subscription.
    SubscriptionClosed,
    /// A non-timeout poll error.
    PollFailed,
    /// A record failed to decode.
    Poisoned,
    /// The outbound channel has no receiver.
    WriterGone,
}

pub struct PollWorker {
    channel: Channel,
    subscription: Box<dyn Subscription>,
    outbound: mpsc::Sender<Outbound>,
    policy: PoisonPolicy,
    broker: Arc<dyn Broker>,
    hub: CancellationHub,
    poll_timeout: Duration,
    metrics: Arc<ServerMetrics>,
}

impl PollWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Channel,
        subscription: Box<dyn Subscription>,
        outbound: mpsc::Sender<Outbound>,
        policy: PoisonPolicy,
        broker: Arc<dyn Broker>,
        hub: CancellationHub,
        poll_timeout: Duration,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            channel,
            subscription,
            outbound,
            policy,
            broker,
            hub,
            poll_timeout,
            metrics,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Poll until the hub fires or a terminal error occurs, then release the
    /// subscription.
    pub async fn run(mut self) -> WorkerExit {
        let exit = self.poll_loop().await;
        self.subscription.release().await;
        debug!(channel = %self.channel, ?exit, "poll worker exited");
        exit
    }

    async fn poll_loop(&mut self) -> WorkerExit {
        loop {
            if self.hub.is_fired() {
                return WorkerExit::Cancelled;
            }

            let polled = tokio::select! {
                biased;
                _ = self.hub.fired() => return WorkerExit::Cancelled,
                polled = self.subscription.next(self.poll_timeout) => polled,
            };

            let delivery = match polled {
                Ok(delivery) => delivery,
                Err(BrokerError::Timeout) => continue,
                Err(BrokerError::SubscriptionClosed) => return WorkerExit::SubscriptionClosed,
                Err(e) => {
                    error!(
                        channel = %self.channel,
                        subject = %self.subscription.subject(),
                        error = %e,
                        "failed to poll broadcast subscription"
                    );
                    return WorkerExit::PollFailed;
                }
            };

            let payload = match decode_payload(self.channel, &delivery.payload) {
                Ok(payload) => payload,
                Err(e) => return self.poisoned(e).await,
            };

            let sent = tokio::select! {
                biased;
                _ = self.hub.fired() => return WorkerExit::Cancelled,
                sent = self.outbound.send(Outbound::new(self.channel, payload)) => sent,
            };
            if sent.is_err() {
                return WorkerExit::WriterGone;
            }

            self.ack(delivery).await;
        }
    }

    async fn ack(&self, delivery: Delivery) {
        match delivery.ack().await {
            Ok(()) => self.metrics.acked(),
            Err(e) => debug!(channel = %self.channel, error = %e, "ack failed"),
        }
    }

    async fn poisoned(&self, err: WireError) -> WorkerExit {
        self.metrics.decode_failed();
        let subject = self.subscription.subject();

        match self.policy {
            PoisonPolicy::ExitOnly => {
                error!(channel = %self.channel, subject, error = %err, "failed to decode broadcast envelope");
            }
            PoisonPolicy::PurgeAndExit => match self.broker.purge(subject).await {
                Ok(()) => {
                    self.metrics.purged();
                    error!(
                        channel = %self.channel,
                        subject,
                        error = %err,
                        "failed to decode broadcast envelope, subject purged"
                    );
                }
                Err(purge_err) => {
                    error!(
                        channel = %self.channel,
                        subject,
                        error = %err,
                        purge_error = %purge_err,
                        "failed to decode broadcast envelope, purge failed"
                    );
                }
            },
        }

        if self.hub.is_fired() {
            warn!(channel = %self.channel, "poisoned record observed during teardown");
        }
        WorkerExit::Poisoned
    }
}

/// Decode the record a subject is expected to carry into its inner string.
pub fn decode_payload(channel: Channel, bytes: &[u8]) -> Result<String, WireError> {
    match channel {
        Channel::Message => decode_message(bytes).map(|m| m.init_message),
        Channel::Notification => decode_notification(bytes).map(|n| n.notification),
    }
}
