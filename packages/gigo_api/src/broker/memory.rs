//! In-memory implementation of the broker.
//!
//! # Semantics
//! - One FIFO queue per subject. Records published before anyone subscribes
//!   are retained until consumed or purged.
//! - Every live subscription on a subject pulls from the same queue.
//! - Explicit ack: a pulled record stays in flight until acked. Releasing a
//!   subscription puts its unacked records back at the head of the queue in
//!   their original order.
//! - Purge drops queued and in-flight records for the subject.
//!
//! - A subject's queue is dropped once it has no queued records, no records
//!   in flight and no live subscriptions.
//!
//! Not durable. Counters (acks, purges, live subscriptions) and failure
//! injection exist so tests can observe and perturb the websocket core. The
//! ack and purge counters outlive the queues and are kept for the lifetime
//! of the broker.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{Acker, Broker, BrokerError, BrokerResult, Delivery, Subscription};

#[derive(Default)]
struct SubjectState {
    pending: VecDeque<(u64, Bytes)>,
    /// seq → (subscription id, payload)
    in_flight: BTreeMap<u64, (u64, Bytes)>,
    subscribers: usize,
    notify: Arc<Notify>,
}

impl SubjectState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.subscribers == 0
    }
}

#[derive(Default)]
struct SubjectCounters {
    acks: usize,
    purges: usize,
}

#[derive(Default)]
struct State {
    subjects: HashMap<String, SubjectState>,
    counters: HashMap<String, SubjectCounters>,
    /// subscription id → subject
    live: HashMap<u64, String>,
    /// Subscriptions the broker has invalidated under their owner.
    invalidated: HashSet<u64>,
    fail_subscribe: HashSet<String>,
    fail_poll: HashSet<String>,
    fail_ack: HashSet<String>,
    next_seq: u64,
    next_subscription: u64,
}

impl State {
    fn subject(&mut self, subject: &str) -> &mut SubjectState {
        self.subjects.entry(subject.to_string()).or_default()
    }

    fn counters(&mut self, subject: &str) -> &mut SubjectCounters {
        self.counters.entry(subject.to_string()).or_default()
    }

    fn prune(&mut self, subject: &str) {
        if self.subjects.get(subject).is_some_and(SubjectState::is_idle) {
            self.subjects.remove(subject);
            debug!(subject = %subject, "memory subject dropped");
        }
    }
}

struct Shared {
    state: Mutex<State>,
    healthy: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        state.invalidated.remove(&id);
        let Some(subject) = state.live.remove(&id) else {
            return;
        };
        let queue = state.subject(&subject);
        queue.subscribers = queue.subscribers.saturating_sub(1);
        let unacked: Vec<u64> = queue
            .in_flight
            .iter()
            .filter(|(_, (owner, _))| *owner == id)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in unacked.into_iter().rev() {
            if let Some((_, payload)) = queue.in_flight.remove(&seq) {
                queue.pending.push_front((seq, payload));
            }
        }
        if !queue.pending.is_empty() {
            queue.notify.notify_waiters();
        }
        state.prune(&subject);
        debug!(subject = %subject, subscription = id, "memory subscription released");
    }
}

/// In-process broker. Cloning shares the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                healthy: AtomicBool::new(true),
            }),
        }
    }

    /// Acknowledged deliveries on `subject`.
    pub fn acks(&self, subject: &str) -> usize {
        self.shared
            .lock()
            .counters
            .get(subject)
            .map_or(0, |c| c.acks)
    }

    /// Purge calls observed on `subject`.
    pub fn purges(&self, subject: &str) -> usize {
        self.shared
            .lock()
            .counters
            .get(subject)
            .map_or(0, |c| c.purges)
    }

    /// Records queued and not yet pulled.
    pub fn pending(&self, subject: &str) -> usize {
        self.shared
            .lock()
            .subjects
            .get(subject)
            .map_or(0, |s| s.pending.len())
    }

    /// Records pulled and not yet acked.
    pub fn in_flight(&self, subject: &str) -> usize {
        self.shared
            .lock()
            .subjects
            .get(subject)
            .map_or(0, |s| s.in_flight.len())
    }

    /// Subjects currently holding a queue.
    pub fn tracked_subjects(&self) -> usize {
        self.shared.lock().subjects.len()
    }

    pub fn live_subscriptions(&self, subject: &str) -> usize {
        self.shared
            .lock()
            .live
            .values()
            .filter(|s| s.as_str() == subject)
            .count()
    }

    /// Make the next `subscribe(subject)` fail.
    pub fn fail_next_subscribe(&self, subject: &str) {
        self.shared.lock().fail_subscribe.insert(subject.to_string());
    }

    /// Make the next poll on `subject` fail with a backend error.
    pub fn fail_next_poll(&self, subject: &str) {
        let mut state = self.shared.lock();
        state.fail_poll.insert(subject.to_string());
        if let Some(queue) = state.subjects.get(subject) {
            queue.notify.notify_waiters();
        }
    }

    /// Make the next ack of a delivery on `subject` fail. The delivery stays
    /// in flight.
    pub fn fail_next_ack(&self, subject: &str) {
        self.shared.lock().fail_ack.insert(subject.to_string());
    }

    /// Invalidate every live subscription on `subject`, as a broker does
    /// when a consumer is deleted under its client.
    pub fn invalidate(&self, subject: &str) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state
            .live
            .iter()
            .filter(|(_, s)| s.as_str() == subject)
            .map(|(id, _)| *id)
            .collect();
        state.invalidated.extend(ids);
        if let Some(queue) = state.subjects.get(subject) {
            queue.notify.notify_waiters();
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.shared.healthy.store(healthy, Ordering::Relaxed);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, subject: &str) -> BrokerResult<Box<dyn Subscription>> {
        let mut state = self.shared.lock();
        if state.fail_subscribe.remove(subject) {
            return Err(BrokerError::Subscribe {
                subject: subject.to_string(),
                reason: "injected failure".into(),
            });
        }

        state.next_subscription += 1;
        let id = state.next_subscription;
        state.live.insert(id, subject.to_string());
        let queue = state.subject(subject);
        queue.subscribers += 1;
        let notify = queue.notify.clone();
        debug!(subject, subscription = id, "memory subscription created");

        Ok(Box::new(MemorySubscription {
            id,
            subject: subject.to_string(),
            shared: self.shared.clone(),
            notify,
            released: false,
        }))
    }

    async fn purge(&self, subject: &str) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        let dropped = match state.subjects.get_mut(subject) {
            Some(queue) => {
                let dropped = queue.pending.len() + queue.in_flight.len();
                queue.pending.clear();
                queue.in_flight.clear();
                dropped
            }
            None => 0,
        };
        state.counters(subject).purges += 1;
        state.prune(subject);
        debug!(subject, dropped, "memory subject purged");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        let queue = state.subject(subject);
        queue.pending.push_back((seq, payload));
        queue.notify.notify_waiters();
        Ok(())
    }

    async fn health_check(&self) -> BrokerResult<()> {
        if self.shared.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(BrokerError::Backend("memory broker marked unhealthy".into()))
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySubscription {
    id: u64,
    subject: String,
    shared: Arc<Shared>,
    notify: Arc<Notify>,
    released: bool,
}

impl MemorySubscription {
    fn try_take(&self) -> BrokerResult<Option<Delivery>> {
        let mut state = self.shared.lock();
        if !state.live.contains_key(&self.id) || state.invalidated.contains(&self.id) {
            return Err(BrokerError::SubscriptionClosed);
        }
        if state.fail_poll.remove(&self.subject) {
            return Err(BrokerError::Backend("injected poll failure".into()));
        }

        let queue = state.subject(&self.subject);
        let Some((seq, payload)) = queue.pending.pop_front() else {
            return Ok(None);
        };
        queue.in_flight.insert(seq, (self.id, payload.clone()));

        Ok(Some(Delivery::new(
            payload,
            MemoryAcker {
                shared: self.shared.clone(),
                subject: self.subject.clone(),
                seq,
            },
        )))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn next(&mut self, timeout: Duration) -> BrokerResult<Delivery> {
        if self.released {
            return Err(BrokerError::SubscriptionClosed);
        }
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking the queue so a publish
            // between the check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(delivery);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BrokerError::Timeout);
            }
        }
    }

    async fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(self.id);
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if !self.released {
            self.shared.release(self.id);
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    subject: String,
    seq: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        if state.fail_ack.remove(&self.subject) {
            return Err(BrokerError::Ack("injected ack failure".into()));
        }

        let acked = state
            .subjects
            .get_mut(&self.subject)
            .and_then(|queue| queue.in_flight.remove(&self.seq))
            .is_some();
        if !acked {
            return Err(BrokerError::Ack(format!(
                "delivery {} on {} is no longer in flight",
                self.seq, self.subject
            )));
        }
        state.counters(&self.subject).acks += 1;
        state.prune(&self.subject);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBJECT: &str = "broadcast.message.42";
    const WAIT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn publish_then_pull_in_order() {
        let broker = MemoryBroker::new();
        broker.publish(SUBJECT, Bytes::from_static(b"a")).await.unwrap();
        broker.publish(SUBJECT, Bytes::from_static(b"b")).await.unwrap();

        let mut sub = broker.subscribe(SUBJECT).await.unwrap();
        assert_eq!(sub.next(WAIT).await.unwrap().payload, "a");
        assert_eq!(sub.next(WAIT).await.unwrap().payload, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_times_out() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT).await.unwrap();
        let started = Instant::now();
        assert!(matches!(sub.next(WAIT).await, Err(BrokerError::Timeout)));
        assert!(started.elapsed() >= WAIT);
    }

    #[tokio::test]
    async fn waiting_pull_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher
                .publish(SUBJECT, Bytes::from_static(b"late"))
                .await
                .unwrap();
        });

        let delivery = sub.next(Duration::from_secs(5)).await.unwrap();
        assert_eq!(delivery.payload, "late");
    }

    #[tokio::test]
    async fn ack_is_counted_once() {
        let broker = MemoryBroker::new();
        broker.publish(SUBJECT, Bytes::from_static(b"x")).await.unwrap();
        let mut sub = broker.subscribe(SUBJECT).await.unwrap();

        let delivery = sub.next(WAIT).await.unwrap();
        assert_eq!(broker.in_flight(SUBJECT), 1);
        delivery.ack().await.unwrap();
        assert_eq!(broker.acks(SUBJECT), 1);
        assert_eq!(broker.in_flight(SUBJECT), 0);
    }

    #[tokio::test]
    async fn release_requeues_unacked_in_order() {
        let broker = MemoryBroker::new();
        for p in ["1", "2", "3"] {
            broker.publish(SUBJECT, Bytes::from(p)).await.unwrap();
        }

        let mut sub = broker.subscribe(SUBJECT).await.unwrap();
        let _d1 = sub.next(WAIT).await.unwrap();
        let _d2 = sub.next(WAIT).await.unwrap();
        sub.release().await;
        assert_eq!(broker.live_subscriptions(SUBJECT), 0);
        assert_eq!(broker.pending(SUBJECT), 3);

        let mut again = broker.subscribe(SUBJECT).await.unwrap();
        assert_eq!(again.next(WAIT).await.unwrap().payload, "1");
        assert_eq!(again.next(WAIT).await.unwrap().payload, "2");
        assert_eq!(again.next(WAIT).await.unwrap().payload, "3");
    }

    #[tokio::test]
    async fn release_is_idempotent_and_closes() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT).await.unwrap();
        assert_eq!(broker.live_subscriptions(SUBJECT), 1);

        sub.release().await;
        sub.release().await;
        assert_eq!(broker.live_subscriptions(SUBJECT), 0);
        assert!(matches!(
            sub.next(WAIT).await,
            Err(BrokerError::SubscriptionClosed)
        ));
    }

    #[tokio::test]
    async fn drop_releases() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe(SUBJECT).await.unwrap();
        drop(sub);
        assert_eq!(broker.live_subscriptions(SUBJECT), 0);
    }

    #[tokio::test]
    async fn purge_drops_pending_and_in_flight() {
        let broker = MemoryBroker::new();
        broker.publish(SUBJECT, Bytes::from_static(b"a")).await.unwrap();
        broker.publish(SUBJECT, Bytes::from_static(b"b")).await.unwrap();
        let mut sub = broker.subscribe(SUBJECT).await.unwrap();
        let delivery = sub.next(WAIT).await.unwrap();

        broker.purge(SUBJECT).await.unwrap();
        assert_eq!(broker.purges(SUBJECT), 1);
        assert_eq!(broker.pending(SUBJECT), 0);
        assert!(delivery.ack().await.is_err());
        assert_eq!(broker.acks(SUBJECT), 0);
    }

    #[tokio::test]
    async fn purge_is_per_subject() {
        let broker = MemoryBroker::new();
        broker.publish(SUBJECT, Bytes::from_static(b"keep")).await.unwrap();
        broker.purge("broadcast.notification.42").await.unwrap();
        assert_eq!(broker.pending(SUBJECT), 1);
        assert_eq!(broker.purges(SUBJECT), 0);
    }

    #[tokio::test]
    async fn injected_subscribe_failure_fires_once() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribe(SUBJECT);
        assert!(matches!(
            broker.subscribe(SUBJECT).await,
            Err(BrokerError::Subscribe { .. })
        ));
        assert_eq!(broker.live_subscriptions(SUBJECT), 0);
        assert!(broker.subscribe(SUBJECT).await.is_ok());
    }

    #[tokio::test]
    async fn injected_poll_failure() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT).await.unwrap();
        broker.fail_next_poll(SUBJECT);
        assert!(matches!(sub.next(WAIT).await, Err(BrokerError::Backend(_))));
        assert!(matches!(sub.next(WAIT).await, Err(BrokerError::Timeout)));
    }

    #[tokio::test]
    async fn invalidate_wakes_waiting_pull() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT).await.unwrap();

        let b = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            b.invalidate(SUBJECT);
        });

        assert!(matches!(
            sub.next(Duration::from_secs(5)).await,
            Err(BrokerError::SubscriptionClosed)
        ));
    }

    #[tokio::test]
    async fn injected_ack_failure_keeps_delivery_in_flight() {
        let broker = MemoryBroker::new();
        broker.publish(SUBJECT, Bytes::from_static(b"x")).await.unwrap();
        let mut sub = broker.subscribe(SUBJECT).await.unwrap();

        broker.fail_next_ack(SUBJECT);
        let delivery = sub.next(WAIT).await.unwrap();
        assert!(matches!(delivery.ack().await, Err(BrokerError::Ack(_))));
        assert_eq!(broker.acks(SUBJECT), 0);
        assert_eq!(broker.in_flight(SUBJECT), 1);

        // release hands the unacked record back
        sub.release().await;
        assert_eq!(broker.pending(SUBJECT), 1);
    }

    #[tokio::test]
    async fn idle_subjects_are_dropped() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT).await.unwrap();
        broker.publish(SUBJECT, Bytes::from_static(b"x")).await.unwrap();
        broker.purge("broadcast.notification.42").await.unwrap();
        assert_eq!(broker.tracked_subjects(), 1);

        sub.next(WAIT).await.unwrap().ack().await.unwrap();
        assert_eq!(broker.tracked_subjects(), 1);
        sub.release().await;
        assert_eq!(broker.tracked_subjects(), 0);

        // counters survive the queue
        assert_eq!(broker.acks(SUBJECT), 1);
        assert_eq!(broker.purges("broadcast.notification.42"), 1);
    }

    #[tokio::test]
    async fn records_without_subscribers_keep_their_subject() {
        let broker = MemoryBroker::new();
        broker.publish(SUBJECT, Bytes::from_static(b"x")).await.unwrap();
        let sub = broker.subscribe(SUBJECT).await.unwrap();
        drop(sub);
        assert_eq!(broker.tracked_subjects(), 1);
        assert_eq!(broker.pending(SUBJECT), 1);

        broker.purge(SUBJECT).await.unwrap();
        assert_eq!(broker.tracked_subjects(), 0);
    }

    #[tokio::test]
    async fn health_toggle() {
        let broker = MemoryBroker::new();
        assert!(broker.health_check().await.is_ok());
        broker.set_healthy(false);
        assert!(broker.health_check().await.is_err());
    }
}
