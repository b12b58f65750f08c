//! In-process bus broker.
//!
//! [`MemoryBus`] is a single-node stand-in for a JetStream-style bus: a global
//! durable sequence, persistent streams with retention and a dedup window,
//! memory-only delivery for ephemeral tiers and round-robin queue groups.
//! Each [`MemoryBusClient`] has its own simulated link that can be dropped and
//! restored to exercise outage handling.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::bus::{
    BusError, BusTransport, DeliverFrom, PublishAck, RawMessage, Sequence, SubscriptionId,
    TransportSubscription,
};
use crate::time::now_millis;
use crate::topic::{subject_matches, DurabilityPolicy};

type ClientId = u64;

struct StoredMessage {
    sequence: Sequence,
    subject: String,
    msg_id: String,
    payload: Bytes,
    stored_at: u64,
}

struct StreamState {
    policy: DurabilityPolicy,
    messages: VecDeque<StoredMessage>,
    /// msg_id -> (sequence, first seen)
    dedup: HashMap<String, (Sequence, u64)>,
}

impl StreamState {
    fn new(policy: DurabilityPolicy) -> Self {
        Self {
            policy,
            messages: VecDeque::new(),
            dedup: HashMap::new(),
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.policy
            .subjects
            .iter()
            .any(|filter| subject_matches(filter, subject))
    }

    fn prune(&mut self, now: u64) -> usize {
        let before = self.messages.len();
        if let Some(retention) = self.policy.retention {
            let cutoff = now.saturating_sub(retention.as_millis() as u64);
            while self
                .messages
                .front()
                .is_some_and(|message| message.stored_at < cutoff)
            {
                self.messages.pop_front();
            }
        }
        match self.policy.dedup_window {
            Some(window) => {
                let window = window.as_millis() as u64;
                self.dedup.retain(|_, (_, seen)| seen.saturating_add(window) > now);
            }
            None => self.dedup.clear(),
        }
        before - self.messages.len()
    }
}

struct BrokerSubscription {
    client: ClientId,
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<RawMessage>,
}

#[derive(Default)]
struct BrokerState {
    sequence: Sequence,
    next_subscription: SubscriptionId,
    next_client: ClientId,
    streams: HashMap<String, StreamState>,
    subscriptions: BTreeMap<SubscriptionId, BrokerSubscription>,
    /// (group, pattern) -> round-robin cursor
    group_cursors: HashMap<(String, String), usize>,
    /// (group, pattern) -> highest durable sequence handed to any member
    group_positions: HashMap<(String, String), Sequence>,
}

impl BrokerState {
    fn deliver(&mut self, message: &RawMessage) -> usize {
        self.subscriptions.retain(|_, sub| !sub.tx.is_closed());

        let mut delivered = 0;
        let mut groups: BTreeMap<(String, String), Vec<SubscriptionId>> = BTreeMap::new();

        for (id, sub) in &self.subscriptions {
            if !subject_matches(&sub.pattern, &message.subject) {
                continue;
            }
            match &sub.queue_group {
                None => {
                    if sub.tx.send(message.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                Some(group) => groups
                    .entry((group.clone(), sub.pattern.clone()))
                    .or_default()
                    .push(*id),
            }
        }

        for (key, members) in groups {
            let cursor = self.group_cursors.entry(key.clone()).or_insert(0);
            let chosen = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            let sent = self
                .subscriptions
                .get(&chosen)
                .is_some_and(|sub| sub.tx.send(message.clone()).is_ok());
            if sent {
                delivered += 1;
                if let Some(sequence) = message.sequence {
                    self.advance_group(key, sequence);
                }
            }
        }

        trace!(subject = %message.subject, delivered, "Bus delivery");
        delivered
    }

    fn advance_group(&mut self, key: (String, String), sequence: Sequence) {
        let position = self.group_positions.entry(key).or_insert(0);
        *position = (*position).max(sequence);
    }

    fn replay(&self, pattern: &str, after: Sequence) -> Vec<RawMessage> {
        let mut replay: Vec<RawMessage> = self
            .streams
            .values()
            .filter(|stream| stream.policy.persistent)
            .flat_map(|stream| stream.messages.iter())
            .filter(|message| message.sequence > after && subject_matches(pattern, &message.subject))
            .map(|message| RawMessage {
                subject: message.subject.clone(),
                payload: message.payload.clone(),
                msg_id: Some(message.msg_id.clone()),
                sequence: Some(message.sequence),
            })
            .collect();
        replay.sort_by_key(|message| message.sequence);
        replay
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The broker shared by every client.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBus {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client with its own link, initially up.
    #[must_use]
    pub fn client(&self) -> MemoryBusClient {
        let id = {
            let mut state = lock(&self.state);
            state.next_client += 1;
            state.next_client
        };
        let (link, _) = watch::channel(true);
        MemoryBusClient {
            id,
            state: Arc::clone(&self.state),
            link: Arc::new(link),
        }
    }

    /// Number of messages currently retained by a stream.
    #[must_use]
    pub fn stream_len(&self, stream: &str) -> Option<usize> {
        lock(&self.state)
            .streams
            .get(stream)
            .map(|stream| stream.messages.len())
    }

    /// Highest durable sequence assigned so far.
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        lock(&self.state).sequence
    }

    /// Apply retention and dedup windows as of `now_ms`.
    ///
    /// Returns the number of messages removed.
    pub fn expire_at(&self, now_ms: u64) -> usize {
        lock(&self.state)
            .streams
            .values_mut()
            .map(|stream| stream.prune(now_ms))
            .sum()
    }
}

/// One connection to a [`MemoryBus`].
#[derive(Clone)]
pub struct MemoryBusClient {
    id: ClientId,
    state: Arc<Mutex<BrokerState>>,
    link: Arc<watch::Sender<bool>>,
}

impl MemoryBusClient {
    /// Simulate losing the link: live subscriptions are torn down and every
    /// call fails until [`restore_link`](Self::restore_link).
    pub fn drop_link(&self) {
        self.link.send_replace(false);
        let mut state = lock(&self.state);
        state.subscriptions.retain(|_, sub| sub.client != self.id);
        info!(client = self.id, "Bus link dropped");
    }

    /// Bring the link back. Subscriptions are not restored automatically.
    pub fn restore_link(&self) {
        self.link.send_replace(true);
        info!(client = self.id, "Bus link restored");
    }

    /// Whether the link is currently up.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        *self.link.borrow()
    }

    fn check_link(&self) -> Result<(), BusError> {
        if self.is_linked() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }
}

#[async_trait]
impl BusTransport for MemoryBusClient {
    async fn connect(&self) -> Result<(), BusError> {
        self.check_link()
    }

    async fn disconnected(&self) {
        let mut rx = self.link.subscribe();
        // The sender lives as long as self, so this only ends on a drop.
        let _ = rx.wait_for(|up| !*up).await;
    }

    async fn ensure_stream(&self, policy: &DurabilityPolicy) -> Result<(), BusError> {
        self.check_link()?;
        let mut state = lock(&self.state);
        state.streams.entry(policy.stream.to_string()).or_insert_with(|| {
            debug!(stream = policy.stream, persistent = policy.persistent, "Stream created");
            StreamState::new(*policy)
        });
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.check_link()?;
        let message = RawMessage {
            subject: subject.to_string(),
            payload,
            msg_id: None,
            sequence: None,
        };
        lock(&self.state).deliver(&message);
        Ok(())
    }

    async fn publish_durable(
        &self,
        stream: &str,
        subject: &str,
        msg_id: &str,
        payload: Bytes,
    ) -> Result<PublishAck, BusError> {
        self.check_link()?;
        let now = now_millis();
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;
        if !stream_state.policy.persistent {
            return Err(BusError::Rejected(format!("stream {stream} is memory-only")));
        }
        if !stream_state.captures(subject) {
            return Err(BusError::SubjectNotInStream {
                stream: stream.to_string(),
                subject: subject.to_string(),
            });
        }

        stream_state.prune(now);
        if let Some((sequence, _)) = stream_state.dedup.get(msg_id) {
            debug!(stream, msg_id, sequence, "Duplicate durable publish");
            return Ok(PublishAck {
                sequence: *sequence,
                duplicate: true,
            });
        }

        state.sequence += 1;
        let sequence = state.sequence;
        if stream_state.policy.dedup_window.is_some() {
            stream_state
                .dedup
                .insert(msg_id.to_string(), (sequence, now));
        }
        stream_state.messages.push_back(StoredMessage {
            sequence,
            subject: subject.to_string(),
            msg_id: msg_id.to_string(),
            payload: payload.clone(),
            stored_at: now,
        });

        state.deliver(&RawMessage {
            subject: subject.to_string(),
            payload,
            msg_id: Some(msg_id.to_string()),
            sequence: Some(sequence),
        });

        Ok(PublishAck {
            sequence,
            duplicate: false,
        })
    }

    async fn subscribe(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
        deliver: DeliverFrom,
    ) -> Result<TransportSubscription, BusError> {
        self.check_link()?;
        let (tx, receiver) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);

        if let DeliverFrom::After(after) = deliver {
            // A queue group resumes from its shared position, so a backlog
            // already handed to one member is not replayed to another.
            let group_key = queue_group.map(|group| (group.to_string(), pattern.to_string()));
            let from = group_key
                .as_ref()
                .and_then(|key| state.group_positions.get(key))
                .map_or(after, |position| after.max(*position));

            let replay = state.replay(pattern, from);
            if let (Some(key), Some(last)) = (group_key, replay.last().and_then(|m| m.sequence)) {
                state.advance_group(key, last);
            }
            for message in replay {
                let _ = tx.send(message);
            }
        }

        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscriptions.insert(
            id,
            BrokerSubscription {
                client: self.id,
                pattern: pattern.to_string(),
                queue_group: queue_group.map(str::to_string),
                tx,
            },
        );

        Ok(TransportSubscription {
            id,
            head: state.sequence,
            receiver,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        lock(&self.state).subscriptions.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::{TopicCategory, DURABILITY_TABLE};
    use std::time::Duration;

    async fn provisioned() -> (MemoryBus, MemoryBusClient) {
        let bus = MemoryBus::new();
        let client = bus.client();
        for (_, policy) in &DURABILITY_TABLE {
            client.ensure_stream(policy).await.unwrap();
        }
        (bus, client)
    }

    #[tokio::test]
    async fn test_durable_publish_dedups_within_window() {
        let (bus, client) = provisioned().await;

        let first = client
            .publish_durable("CHAT_MESSAGES", "chat.u.s.msg", "m1", Bytes::from_static(b"a"))
            .await
            .unwrap();
        let again = client
            .publish_durable("CHAT_MESSAGES", "chat.u.s.msg", "m1", Bytes::from_static(b"a"))
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(first.sequence, again.sequence);
        assert_eq!(bus.stream_len("CHAT_MESSAGES"), Some(1));
    }

    #[tokio::test]
    async fn test_durable_publish_checks_stream() {
        let (_bus, client) = provisioned().await;

        let err = client
            .publish_durable("CHAT_MESSAGES", "user.u.auth", "x", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::SubjectNotInStream { .. }));

        let err = client
            .publish_durable("EPHEMERAL", "chat.u.s.typing", "x", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Rejected(_)));

        let err = client
            .publish_durable("NOPE", "chat.u.s.msg", "x", Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err, BusError::StreamNotFound("NOPE".into()));
    }

    #[tokio::test]
    async fn test_replay_after_sequence_skips_memory_tier() {
        let (_bus, client) = provisioned().await;

        client.publish("chat.u.s.typing", Bytes::from_static(b"t")).await.unwrap();
        let one = client
            .publish_durable("CHAT_MESSAGES", "chat.u.s.msg", "1", Bytes::from_static(b"1"))
            .await
            .unwrap();
        client
            .publish_durable("CHAT_MESSAGES", "chat.u.s.msg", "2", Bytes::from_static(b"2"))
            .await
            .unwrap();

        let mut sub = client
            .subscribe("chat.u.>", None, DeliverFrom::After(one.sequence))
            .await
            .unwrap();
        let replayed = sub.receiver.try_recv().unwrap();
        assert_eq!(&replayed.payload[..], b"2");
        assert!(sub.receiver.try_recv().is_err());
        assert_eq!(sub.head, one.sequence + 1);
    }

    #[tokio::test]
    async fn test_queue_group_delivers_to_one_member() {
        let (_bus, client) = provisioned().await;

        let mut a = client
            .subscribe("llm.request.*", Some("workers"), DeliverFrom::New)
            .await
            .unwrap();
        let mut b = client
            .subscribe("llm.request.*", Some("workers"), DeliverFrom::New)
            .await
            .unwrap();

        for i in 0..4 {
            client
                .publish(&format!("llm.request.r{i}"), Bytes::new())
                .await
                .unwrap();
        }

        let mut count_a = 0;
        while a.receiver.try_recv().is_ok() {
            count_a += 1;
        }
        let mut count_b = 0;
        while b.receiver.try_recv().is_ok() {
            count_b += 1;
        }
        assert_eq!((count_a, count_b), (2, 2));
    }

    #[tokio::test]
    async fn test_queue_group_replays_backlog_to_one_member() {
        let (bus, client) = provisioned().await;
        let other = bus.client();

        client
            .publish_durable("EVENTS", "llm.request.r1", "r1", Bytes::from_static(b"r1"))
            .await
            .unwrap();

        let mut first = client
            .subscribe("llm.request.*", Some("workers"), DeliverFrom::After(0))
            .await
            .unwrap();
        let mut second = other
            .subscribe("llm.request.*", Some("workers"), DeliverFrom::After(0))
            .await
            .unwrap();

        assert_eq!(&first.receiver.try_recv().unwrap().payload[..], b"r1");
        assert!(first.receiver.try_recv().is_err());
        assert!(second.receiver.try_recv().is_err());

        // A different group keeps its own position.
        let mut audit = other
            .subscribe("llm.request.*", Some("audit"), DeliverFrom::After(0))
            .await
            .unwrap();
        assert!(audit.receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_drop_link_closes_subscriptions() {
        let (_bus, client) = provisioned().await;
        let mut sub = client
            .subscribe("user.u.*", None, DeliverFrom::New)
            .await
            .unwrap();

        client.drop_link();
        client.disconnected().await;
        assert!(sub.receiver.recv().await.is_none());
        assert_eq!(client.connect().await, Err(BusError::NotConnected));
        assert_eq!(
            client.publish("user.u.auth", Bytes::new()).await,
            Err(BusError::NotConnected)
        );

        client.restore_link();
        assert!(client.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_retention_expires_old_events() {
        let (bus, client) = provisioned().await;
        client
            .publish_durable("EVENTS", "user.u.quota", "q1", Bytes::new())
            .await
            .unwrap();

        let retention = TopicCategory::Events
            .policy()
            .retention
            .unwrap_or(Duration::ZERO);
        assert_eq!(bus.expire_at(now_millis()), 0);
        assert_eq!(
            bus.expire_at(now_millis() + retention.as_millis() as u64 + 1_000),
            1
        );
        assert_eq!(bus.stream_len("EVENTS"), Some(0));
    }
}
