//! NATS JetStream adapter.
//!
//! Each subscription is an ephemeral pull consumer filtered to one subject
//! with explicit ack. A poll is a single-message fetch that expires after the
//! caller's bounded wait. Purge is a stream purge filtered to the subject, so
//! other users' records on the same stream are untouched.

use async_nats::jetstream::{
    self,
    consumer::{AckPolicy, PullConsumer, pull},
    stream,
};
use async_trait::async_trait;
use broadcast_wire::Channel;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

use super::{Acker, Broker, BrokerError, BrokerResult, Delivery, Subscription};
use crate::config::BrokerConfig;

/// Ephemeral consumers left behind by a crashed gateway are reaped after this.
const CONSUMER_INACTIVE_THRESHOLD: Duration = Duration::from_secs(30);

pub struct NatsBroker {
    client: async_nats::Client,
    js: jetstream::Context,
    message_stream: String,
    notification_stream: String,
}

impl NatsBroker {
    /// Connect and make sure both broadcast streams exist.
    pub async fn connect(config: &BrokerConfig) -> BrokerResult<Self> {
        let client = async_nats::connect(config.url.as_str())
            .await
            .map_err(|e| BrokerError::Backend(format!("connect {}: {e}", config.url)))?;
        let js = jetstream::new(client.clone());

        let broker = Self {
            client,
            js,
            message_stream: config.message_stream.clone(),
            notification_stream: config.notification_stream.clone(),
        };
        for channel in Channel::ALL {
            broker.ensure_stream(channel).await?;
        }
        info!(url = %config.url, "connected to NATS JetStream");
        Ok(broker)
    }

    fn stream_name(&self, channel: Channel) -> &str {
        match channel {
            Channel::Message => &self.message_stream,
            Channel::Notification => &self.notification_stream,
        }
    }

    async fn ensure_stream(&self, channel: Channel) -> BrokerResult<()> {
        self.js
            .get_or_create_stream(stream::Config {
                name: self.stream_name(channel).to_string(),
                subjects: vec![channel.wildcard_subject()],
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Backend(format!("stream {}: {e}", self.stream_name(channel))))?;
        Ok(())
    }

    async fn stream_for(&self, subject: &str) -> Result<stream::Stream, String> {
        let channel = Channel::from_subject(subject)
            .ok_or_else(|| format!("{subject} is not a broadcast subject"))?;
        self.js
            .get_stream(self.stream_name(channel))
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn subscribe(&self, subject: &str) -> BrokerResult<Box<dyn Subscription>> {
        let fail = |reason: String| BrokerError::Subscribe {
            subject: subject.to_string(),
            reason,
        };

        let stream = self.stream_for(subject).await.map_err(fail)?;
        let consumer: PullConsumer = stream
            .create_consumer(pull::Config {
                filter_subject: subject.to_string(),
                ack_policy: AckPolicy::Explicit,
                inactive_threshold: CONSUMER_INACTIVE_THRESHOLD,
                ..Default::default()
            })
            .await
            .map_err(|e| fail(e.to_string()))?;

        let name = consumer.cached_info().name.clone();
        debug!(subject = %subject, consumer = %name, "jetstream consumer created");

        Ok(Box::new(NatsSubscription {
            subject: subject.to_string(),
            client: self.client.clone(),
            stream,
            consumer,
            name,
            released: false,
        }))
    }

    async fn purge(&self, subject: &str) -> BrokerResult<()> {
        let fail = |reason: String| BrokerError::Purge {
            subject: subject.to_string(),
            reason,
        };

        let stream = self.stream_for(subject).await.map_err(fail)?;
        let response = stream
            .purge()
            .filter(subject)
            .await
            .map_err(|e| fail(e.to_string()))?;
        debug!(subject = %subject, purged = response.purged, "jetstream subject purged");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> BrokerResult<()> {
        let fail = |reason: String| BrokerError::Publish {
            subject: subject.to_string(),
            reason,
        };

        self.js
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| fail(e.to_string()))?
            .await
            .map_err(|e| fail(e.to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> BrokerResult<()> {
        match self.client.connection_state() {
            async_nats::connection::State::Connected => Ok(()),
            state => Err(BrokerError::Backend(format!("nats connection {state:?}"))),
        }
    }

    fn backend_name(&self) -> &'static str {
        "nats"
    }
}

struct NatsSubscription {
    subject: String,
    client: async_nats::Client,
    stream: stream::Stream,
    consumer: PullConsumer,
    name: String,
    released: bool,
}

#[async_trait]
impl Subscription for NatsSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn next(&mut self, timeout: Duration) -> BrokerResult<Delivery> {
        if self.released {
            return Err(BrokerError::SubscriptionClosed);
        }

        let fetched = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(timeout)
            .messages()
            .await;
        let mut batch = match fetched {
            Ok(batch) => batch,
            Err(e) => return Err(self.fetch_failed(e.to_string()).await),
        };

        match batch.next().await {
            Some(Ok(message)) => {
                let payload = message.payload.clone();
                Ok(Delivery::new(payload, NatsAcker { message }))
            }
            Some(Err(e)) => Err(self.fetch_failed(e.to_string()).await),
            None => Err(BrokerError::Timeout),
        }
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.stream.delete_consumer(&self.name).await {
            // The inactivity threshold reaps it eventually.
            debug!(subject = %self.subject, consumer = %self.name, error = %e, "failed to delete consumer");
        }
    }
}

impl NatsSubscription {
    /// Classify a fetch failure. A dropped connection or a consumer deleted
    /// under us closes the subscription; anything else is a backend error.
    async fn fetch_failed(&mut self, reason: String) -> BrokerError {
        let connected = matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        );
        let consumer_exists = connected && self.consumer.info().await.is_ok();
        fetch_error(connected, consumer_exists, reason)
    }
}

fn fetch_error(connected: bool, consumer_exists: bool, reason: String) -> BrokerError {
    if !connected || !consumer_exists {
        debug!(connected, consumer_exists, reason = %reason, "jetstream subscription closed");
        BrokerError::SubscriptionClosed
    } else {
        BrokerError::Backend(reason)
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(self: Box<Self>) -> BrokerResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
