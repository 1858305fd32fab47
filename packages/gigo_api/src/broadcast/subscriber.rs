//! Per-user subscription setup.

use broadcast_wire::Channel;
use tracing::debug;

use crate::broker::{Broker, BrokerResult, Subscription};

/// Both explicit-ack subscriptions of one user, each handed to one worker.
pub struct SubscriptionPair {
    pub message: Box<dyn Subscription>,
    pub notification: Box<dyn Subscription>,
}

/// Subscribe to `broadcast.message.<id>` and `broadcast.notification.<id>`.
///
/// On failure nothing is left subscribed: the message subscription is
/// released before the notification error is returned.
pub async fn subscribe_pair(broker: &dyn Broker, user_id: i64) -> BrokerResult<SubscriptionPair> {
    let mut message = broker
        .subscribe(&Channel::Message.subject(user_id))
        .await?;

    let notification = match broker
        .subscribe(&Channel::Notification.subject(user_id))
        .await
    {
        Ok(sub) => sub,
        Err(e) => {
            message.release().await;
            return Err(e);
        }
    };

    debug!(user_id, "broadcast subscriptions created");
    Ok(SubscriptionPair {
        message,
        notification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, MemoryBroker};

    #[tokio::test]
    async fn subscribes_both_subjects() {
        let broker = MemoryBroker::new();
        let pair = subscribe_pair(&broker, 42).await.unwrap();
        assert_eq!(pair.message.subject(), "broadcast.message.42");
        assert_eq!(pair.notification.subject(), "broadcast.notification.42");
        assert_eq!(broker.live_subscriptions("broadcast.message.42"), 1);
        assert_eq!(broker.live_subscriptions("broadcast.notification.42"), 1);
    }

    #[tokio::test]
    async fn message_failure_leaves_nothing() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribe("broadcast.message.42");
        assert!(matches!(
            subscribe_pair(&broker, 42).await,
            Err(BrokerError::Subscribe { .. })
        ));
        assert_eq!(broker.live_subscriptions("broadcast.message.42"), 0);
        assert_eq!(broker.live_subscriptions("broadcast.notification.42"), 0);
    }

    #[tokio::test]
    async fn notification_failure_releases_message_subscription() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribe("broadcast.notification.42");
        assert!(subscribe_pair(&broker, 42).await.is_err());
        assert_eq!(broker.live_subscriptions("broadcast.message.42"), 0);
        assert_eq!(broker.live_subscriptions("broadcast.notification.42"), 0);
    }
}
