//! Messaging bridge.
//!
//! Wraps a [`BusTransport`] with the durability table, a reconnecting
//! supervisor and a subscription registry that survives outages.
//!
//! The link moves through `Disconnected → Connecting → Connected`. While it is
//! not connected, [`MessagingBridge::publish`] drops messages and new
//! subscriptions are recorded; entering `Connected` activates every recorded
//! subscription. Durable subscriptions resume after the last sequence they
//! delivered, so an outage neither loses nor repeats durable messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bus::{
    BusError, BusTransport, DeliverFrom, PublishAck, RawMessage, Sequence, SubscriptionId,
};
use crate::envelope::Envelope;
use crate::error::ErrorKind;
use crate::topic::{Subject, TopicPattern, DURABILITY_TABLE};

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The durable layer could not accept the write.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Durable publish requested for a memory-tier subject.
    #[error("Subject {0} is not in a durable tier")]
    NotDurable(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BridgeError {
    /// Taxonomy kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            BridgeError::NotDurable(_) | BridgeError::Encode(_) => ErrorKind::InvalidRequest,
        }
    }
}

impl From<BusError> for BridgeError {
    fn from(err: BusError) -> Self {
        BridgeError::TransportUnavailable(err.to_string())
    }
}

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
}

impl BridgeState {
    /// Label for logs and health output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Disconnected => "disconnected",
            BridgeState::Connecting => "connecting",
            BridgeState::Connected => "connected",
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling.
    pub max_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// A decoded message handed to a subscription handler.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub envelope: Envelope,
    /// Durable sequence; `None` for memory-tier messages.
    pub sequence: Option<Sequence>,
}

/// Subscription callback. Called from the subscription's delivery task, in
/// publish order; must not block.
pub type Handler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Bridge statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeStats {
    pub published: u64,
    pub dropped_publishes: u64,
    pub delivered: u64,
    pub reconnects: u64,
    pub subscriptions: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped_publishes: AtomicU64,
    delivered: AtomicU64,
    reconnects: AtomicU64,
}

/// Who a registry entry belongs to. Members of a queue group share one entry,
/// so the group holds a single transport subscription and a single resume
/// cursor however many members it has.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    Owner(String),
    Group(String),
}

type RegistryKey = (Scope, String);

/// `(owner, handler)` pairs fed by one transport subscription.
type Members = Arc<StdMutex<Vec<(String, Handler)>>>;

fn lock_members(members: &Members) -> MutexGuard<'_, Vec<(String, Handler)>> {
    members.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Active {
    transport_id: SubscriptionId,
    task: JoinHandle<()>,
}

struct Entry {
    pattern: String,
    queue_group: Option<String>,
    members: Members,
    /// Highest durable sequence handed to a member.
    last_seq: Arc<AtomicU64>,
    started: bool,
    active: Option<Active>,
}

impl Entry {
    fn new(pattern: &TopicPattern, queue_group: Option<&str>, owner: &str, handler: Handler) -> Self {
        Self {
            pattern: pattern.as_str().to_string(),
            queue_group: queue_group.map(str::to_string),
            members: Arc::new(StdMutex::new(vec![(owner.to_string(), handler)])),
            last_seq: Arc::new(AtomicU64::new(0)),
            started: false,
            active: None,
        }
    }

    fn has_member(&self, owner: &str) -> bool {
        lock_members(&self.members).iter().any(|(member, _)| member == owner)
    }

    fn member_count(&self) -> usize {
        lock_members(&self.members).len()
    }

    /// Add `owner`, or replace its handler if it is already a member.
    fn upsert_member(&self, owner: &str, handler: Handler) {
        let mut members = lock_members(&self.members);
        match members.iter().position(|(member, _)| member == owner) {
            Some(index) => members[index].1 = handler,
            None => members.push((owner.to_string(), handler)),
        }
    }

    /// Remove `owner`. Returns `true` if no members are left.
    fn remove_member(&self, owner: &str) -> bool {
        let mut members = lock_members(&self.members);
        members.retain(|(member, _)| member != owner);
        members.is_empty()
    }

    async fn activate(&mut self, transport: &dyn BusTransport, counters: &Arc<Counters>) -> Result<(), BusError> {
        let deliver = if self.started {
            DeliverFrom::After(self.last_seq.load(Ordering::Acquire))
        } else {
            DeliverFrom::New
        };

        let subscription = transport
            .subscribe(&self.pattern, self.queue_group.as_deref(), deliver)
            .await?;

        if !self.started {
            self.last_seq.store(subscription.head, Ordering::Release);
            self.started = true;
        }

        let task = tokio::spawn(pump(
            subscription.receiver,
            Arc::clone(&self.members),
            Arc::clone(&self.last_seq),
            Arc::clone(counters),
        ));
        self.active = Some(Active {
            transport_id: subscription.id,
            task,
        });

        debug!(pattern = %self.pattern, group = ?self.queue_group, ?deliver, "Subscription active");
        Ok(())
    }

    async fn deactivate(&mut self, transport: &dyn BusTransport) {
        if let Some(active) = self.active.take() {
            active.task.abort();
            // The link may already be gone; the transport drops it either way.
            let _ = transport.unsubscribe(active.transport_id).await;
        }
    }
}

/// Pick the next member in rotation.
fn next_handler(members: &Members, turn: &mut usize) -> Option<Handler> {
    let members = lock_members(members);
    if members.is_empty() {
        return None;
    }
    let (_, handler) = &members[*turn % members.len()];
    *turn = turn.wrapping_add(1);
    Some(Arc::clone(handler))
}

/// Delivery task for one subscription.
async fn pump(
    mut receiver: mpsc::UnboundedReceiver<RawMessage>,
    members: Members,
    last_seq: Arc<AtomicU64>,
    counters: Arc<Counters>,
) {
    let mut turn = 0;
    while let Some(raw) = receiver.recv().await {
        if let Some(sequence) = raw.sequence {
            if sequence <= last_seq.load(Ordering::Acquire) {
                trace!(subject = %raw.subject, sequence, "Skipping already delivered message");
                continue;
            }
            last_seq.store(sequence, Ordering::Release);
        }

        let envelope = match Envelope::from_slice(&raw.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(subject = %raw.subject, error = %e, "Dropping undecodable bus message");
                continue;
            }
        };
        let Some(handler) = next_handler(&members, &mut turn) else {
            trace!(subject = %raw.subject, "No members left, message dropped");
            continue;
        };

        counters.delivered.fetch_add(1, Ordering::Relaxed);
        handler(BusMessage {
            subject: raw.subject,
            envelope,
            sequence: raw.sequence,
        });
    }
}

/// Remove `owner` from whatever it holds on `pattern`. Returns whether it held
/// anything, plus the entry to tear down once no members are left.
fn detach(
    registry: &mut HashMap<RegistryKey, Entry>,
    owner: &str,
    pattern: &str,
) -> (bool, Option<Entry>) {
    let own = (Scope::Owner(owner.to_string()), pattern.to_string());
    if let Some(entry) = registry.remove(&own) {
        return (true, Some(entry));
    }

    let group = registry
        .iter()
        .find(|((scope, key_pattern), entry)| {
            matches!(scope, Scope::Group(_)) && key_pattern == pattern && entry.has_member(owner)
        })
        .map(|(key, _)| key.clone());
    let Some(group) = group else {
        return (false, None);
    };
    let emptied = registry
        .get(&group)
        .is_some_and(|entry| entry.remove_member(owner));
    if emptied {
        (true, registry.remove(&group))
    } else {
        (true, None)
    }
}

struct Inner {
    transport: Arc<dyn BusTransport>,
    config: BridgeConfig,
    state: watch::Sender<BridgeState>,
    registry: Mutex<HashMap<RegistryKey, Entry>>,
    counters: Arc<Counters>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn is_connected(&self) -> bool {
        *self.state.borrow() == BridgeState::Connected
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = previous.as_str(), to = state.as_str(), "Bridge state changed");
        }
    }

    /// Connect, provision streams, then activate every recorded subscription.
    async fn establish(&self) -> Result<(), BusError> {
        self.transport.connect().await?;
        for (_, policy) in &DURABILITY_TABLE {
            self.transport.ensure_stream(policy).await?;
        }

        let mut registry = self.registry.lock().await;
        for entry in registry.values_mut() {
            if entry.active.is_none() {
                entry.activate(self.transport.as_ref(), &self.counters).await?;
            }
        }
        // Set under the registry lock so a concurrent subscribe sees either
        // the old state (and is activated above) or Connected.
        self.set_state(BridgeState::Connected);
        Ok(())
    }

    async fn deactivate_all(&self) {
        let mut registry = self.registry.lock().await;
        self.set_state(BridgeState::Disconnected);
        for entry in registry.values_mut() {
            entry.deactivate(self.transport.as_ref()).await;
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut backoff = self.config.initial_backoff;
        let mut first = true;

        loop {
            self.set_state(BridgeState::Connecting);
            match self.establish().await {
                Ok(()) => {
                    if !first {
                        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    first = false;
                    backoff = self.config.initial_backoff;

                    self.transport.disconnected().await;
                    warn!("Bus link lost");
                    self.deactivate_all().await;
                }
                Err(e) => {
                    debug!(error = %e, backoff_ms = backoff.as_millis() as u64, "Bus connect failed");
                    self.deactivate_all().await;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    async fn register(
        &self,
        owner: &str,
        pattern: &TopicPattern,
        queue_group: Option<&str>,
        handler: Handler,
    ) {
        let mut registry = self.registry.lock().await;

        let (replaced, emptied) = detach(&mut registry, owner, pattern.as_str());
        if replaced {
            debug!(owner, pattern = %pattern, "Replacing subscription");
        }
        if let Some(mut previous) = emptied {
            previous.deactivate(self.transport.as_ref()).await;
        }

        let key = match queue_group {
            Some(group) => (Scope::Group(group.to_string()), pattern.as_str().to_string()),
            None => (Scope::Owner(owner.to_string()), pattern.as_str().to_string()),
        };
        if let Some(entry) = registry.get(&key) {
            entry.upsert_member(owner, handler);
            debug!(owner, group = ?queue_group, pattern = %pattern, "Joined queue group");
            return;
        }

        let mut entry = Entry::new(pattern, queue_group, owner, handler);
        if self.is_connected() {
            if let Err(e) = entry.activate(self.transport.as_ref(), &self.counters).await {
                // Stays recorded; the supervisor activates it on reconnect.
                debug!(owner, pattern = %pattern, error = %e, "Subscription queued");
            }
        } else {
            debug!(owner, pattern = %pattern, "Bridge not connected, subscription queued");
        }
        registry.insert(key, entry);
    }
}

/// Topic-based messaging over a reconnecting bus link.
///
/// Cheap to clone; all clones share one link and one registry.
#[derive(Clone)]
pub struct MessagingBridge {
    inner: Arc<Inner>,
}

impl MessagingBridge {
    /// Create a bridge and start its connection supervisor.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(transport: Arc<dyn BusTransport>, config: BridgeConfig) -> Self {
        let (state, _) = watch::channel(BridgeState::Disconnected);
        let inner = Arc::new(Inner {
            transport,
            config,
            state,
            registry: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            supervisor: StdMutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&inner).supervise());
        *inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Self { inner }
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        *self.inner.state.borrow()
    }

    /// Whether the link is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Watch link state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.inner.state.subscribe()
    }

    /// Wait until the link is connected.
    pub async fn wait_connected(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == BridgeState::Connected).await;
    }

    /// Best-effort publish.
    ///
    /// Silently drops the message when the link is down. Persistent-tier
    /// subjects still go through the durable path, but failures are only
    /// logged.
    pub async fn publish(&self, subject: &Subject, envelope: &Envelope) {
        if !self.is_connected() {
            self.inner.counters.dropped_publishes.fetch_add(1, Ordering::Relaxed);
            trace!(subject = %subject, "Bridge not connected, publish dropped");
            return;
        }

        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Failed to encode envelope");
                return;
            }
        };

        let policy = subject.policy();
        let topic = subject.to_string();
        let result = if policy.persistent {
            self.inner
                .transport
                .publish_durable(policy.stream, &topic, &envelope.id.to_string(), payload)
                .await
                .map(|_| ())
        } else {
            self.inner.transport.publish(&topic, payload).await
        };

        match result {
            Ok(()) => {
                self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
                trace!(subject = %topic, kind = %envelope.kind, "Published");
            }
            Err(e) => {
                self.inner.counters.dropped_publishes.fetch_add(1, Ordering::Relaxed);
                debug!(subject = %topic, error = %e, "Publish dropped");
            }
        }
    }

    /// Publish with at-least-once delivery, returning once the bus has
    /// persisted the message.
    ///
    /// The envelope id is the dedup key, so retrying the same envelope inside
    /// the dedup window is safe.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotDurable`] for memory-tier subjects and
    /// [`BridgeError::TransportUnavailable`] when the link is down or the bus
    /// rejects the write.
    pub async fn publish_durable(
        &self,
        subject: &Subject,
        envelope: &Envelope,
    ) -> Result<PublishAck, BridgeError> {
        let policy = subject.policy();
        if !policy.persistent {
            return Err(BridgeError::NotDurable(subject.to_string()));
        }
        if !self.is_connected() {
            return Err(BridgeError::TransportUnavailable(
                "bus link is down".to_string(),
            ));
        }

        let ack = self
            .inner
            .transport
            .publish_durable(
                policy.stream,
                &subject.to_string(),
                &envelope.id.to_string(),
                envelope.to_bytes()?,
            )
            .await?;

        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(subject = %subject, sequence = ack.sequence, duplicate = ack.duplicate, "Durable publish acknowledged");
        Ok(ack)
    }

    /// Subscribe `owner` to a pattern.
    ///
    /// Subscribing again with the same owner and pattern replaces the previous
    /// handler. When the link is down the subscription is recorded and
    /// activated once it comes back.
    pub async fn subscribe(&self, owner: &str, pattern: &TopicPattern, handler: Handler) {
        self.inner.register(owner, pattern, None, handler).await;
    }

    /// Subscribe as a member of a queue group; each message reaches exactly
    /// one member of the group, including messages replayed after an outage.
    ///
    /// Members on this bridge share one bus subscription and take turns.
    pub async fn subscribe_queue(
        &self,
        owner: &str,
        pattern: &TopicPattern,
        group: &str,
        handler: Handler,
    ) {
        self.inner.register(owner, pattern, Some(group), handler).await;
    }

    /// Remove one subscription. Returns `false` if it did not exist.
    pub async fn unsubscribe(&self, owner: &str, pattern: &TopicPattern) -> bool {
        let (removed, emptied) = {
            let mut registry = self.inner.registry.lock().await;
            detach(&mut registry, owner, pattern.as_str())
        };
        if let Some(mut entry) = emptied {
            entry.deactivate(self.inner.transport.as_ref()).await;
        }
        removed
    }

    /// Remove every subscription held by `owner`. Returns how many were removed.
    pub async fn unsubscribe_owner(&self, owner: &str) -> usize {
        let (count, emptied) = {
            let mut registry = self.inner.registry.lock().await;
            let keys: Vec<RegistryKey> = registry
                .iter()
                .filter(|((scope, _), entry)| match scope {
                    Scope::Owner(key_owner) => key_owner == owner,
                    Scope::Group(_) => entry.has_member(owner),
                })
                .map(|(key, _)| key.clone())
                .collect();

            let mut emptied = Vec::new();
            for key in &keys {
                if registry.get(key).is_some_and(|entry| entry.remove_member(owner)) {
                    emptied.extend(registry.remove(key));
                }
            }
            (keys.len(), emptied)
        };

        for mut entry in emptied {
            entry.deactivate(self.inner.transport.as_ref()).await;
        }
        if count > 0 {
            debug!(owner, count, "Removed owner subscriptions");
        }
        count
    }

    /// Get bridge statistics.
    pub async fn stats(&self) -> BridgeStats {
        let counters = &self.inner.counters;
        BridgeStats {
            published: counters.published.load(Ordering::Relaxed),
            dropped_publishes: counters.dropped_publishes.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
            subscriptions: self
                .inner
                .registry
                .lock()
                .await
                .values()
                .map(Entry::member_count)
                .sum(),
        }
    }

    /// Stop the supervisor and tear down every subscription.
    pub async fn shutdown(&self) {
        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            handle.abort();
        }
        self.inner.deactivate_all().await;
        info!("Bridge shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::events;
    use crate::memory_bus::{MemoryBus, MemoryBusClient};
    use crate::topic::{ChatKind, UserKind};
    use serde_json::json;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> BridgeConfig {
        BridgeConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        }
    }

    fn collector() -> (Handler, mpsc::UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |message| {
            let _ = tx.send(message);
        });
        (handler, rx)
    }

    async fn connected_bridge() -> (MemoryBus, MemoryBusClient, MessagingBridge) {
        let bus = MemoryBus::new();
        let client = bus.client();
        let bridge = MessagingBridge::start(Arc::new(client.clone()), config());
        timeout(WAIT, bridge.wait_connected()).await.unwrap();
        (bus, client, bridge)
    }

    async fn wait_state(bridge: &MessagingBridge, pred: impl Fn(BridgeState) -> bool) {
        let mut rx = bridge.subscribe_state();
        timeout(WAIT, rx.wait_for(|state| pred(*state)))
            .await
            .unwrap()
            .unwrap();
    }

    fn chat(kind: ChatKind) -> Subject {
        Subject::chat("u1", "s1", kind).unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let (_bus, _client, bridge) = connected_bridge().await;
        let (handler, mut rx) = collector();
        bridge
            .subscribe("c1", &TopicPattern::chat_all("u1").unwrap(), handler)
            .await;

        let envelope = Envelope::new(events::TYPING, json!({"is_typing": true}));
        bridge.publish(&chat(ChatKind::Typing), &envelope).await;

        let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(message.subject, "chat.u1.s1.typing");
        assert_eq!(message.envelope, envelope);
        assert_eq!(message.sequence, None);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_noop() {
        let bus = MemoryBus::new();
        let client = bus.client();
        client.drop_link();
        let bridge = MessagingBridge::start(Arc::new(client), config());

        let envelope = Envelope::new(events::MESSAGE_CREATED, json!({}));
        bridge.publish(&chat(ChatKind::Msg), &envelope).await;

        assert_ne!(bridge.state(), BridgeState::Connected);
        assert_eq!(bridge.stats().await.dropped_publishes, 1);
        let err = bridge
            .publish_durable(&chat(ChatKind::Msg), &envelope)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
    }

    #[tokio::test]
    async fn test_publish_durable_rejects_memory_tier() {
        let (_bus, _client, bridge) = connected_bridge().await;
        let envelope = Envelope::new(events::TYPING, json!({}));
        let err = bridge
            .publish_durable(&chat(ChatKind::Typing), &envelope)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotDurable(_)));
    }

    #[tokio::test]
    async fn test_publish_durable_retry_is_deduplicated() {
        let (bus, _client, bridge) = connected_bridge().await;
        let envelope = Envelope::new(events::MESSAGE_CREATED, json!({"id": 1}));

        let first = bridge
            .publish_durable(&chat(ChatKind::Msg), &envelope)
            .await
            .unwrap();
        let retry = bridge
            .publish_durable(&chat(ChatKind::Msg), &envelope)
            .await
            .unwrap();

        assert_eq!(first.sequence, retry.sequence);
        assert!(retry.duplicate);
        assert_eq!(bus.stream_len("CHAT_MESSAGES"), Some(1));
    }

    #[tokio::test]
    async fn test_subscription_queued_until_connected() {
        let bus = MemoryBus::new();
        let client = bus.client();
        client.drop_link();
        let bridge = MessagingBridge::start(Arc::new(client.clone()), config());

        let (handler, mut rx) = collector();
        let pattern = TopicPattern::user_all("u1").unwrap();
        bridge.subscribe("c1", &pattern, handler).await;
        assert_eq!(bridge.stats().await.subscriptions, 1);

        client.restore_link();
        timeout(WAIT, bridge.wait_connected()).await.unwrap();

        let subject = Subject::user("u1", UserKind::Notification).unwrap();
        bridge
            .publish(&subject, &Envelope::new("notice", json!({})))
            .await;
        let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(message.subject, "user.u1.notification");
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_handler() {
        let (_bus, _client, bridge) = connected_bridge().await;
        let pattern = TopicPattern::chat_all("u1").unwrap();
        let (old_handler, mut old_rx) = collector();
        let (new_handler, mut new_rx) = collector();

        bridge.subscribe("c1", &pattern, old_handler).await;
        bridge.subscribe("c1", &pattern, new_handler).await;
        assert_eq!(bridge.stats().await.subscriptions, 1);

        bridge
            .publish(&chat(ChatKind::Status), &Envelope::new("status", json!({})))
            .await;
        assert!(timeout(WAIT, new_rx.recv()).await.unwrap().is_some());
        // The replaced handler was dropped with its delivery task.
        assert!(timeout(WAIT, old_rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outage_resumes_durable_without_duplicates() {
        let (bus, client, bridge) = connected_bridge().await;
        let (handler, mut rx) = collector();
        bridge
            .subscribe("c1", &TopicPattern::chat_all("u1").unwrap(), handler)
            .await;

        let before = Envelope::new(events::MESSAGE_CREATED, json!({"n": 1}));
        bridge.publish_durable(&chat(ChatKind::Msg), &before).await.unwrap();
        let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.envelope.id, before.id);

        client.drop_link();
        wait_state(&bridge, |state| state != BridgeState::Connected).await;

        // Another publisher keeps writing while this link is down.
        let other = bus.client();
        let during = Envelope::new(events::MESSAGE_CREATED, json!({"n": 2}));
        other
            .publish_durable(
                "CHAT_MESSAGES",
                "chat.u1.s1.msg",
                &during.id.to_string(),
                during.to_bytes().unwrap(),
            )
            .await
            .unwrap();
        other
            .publish("chat.u1.s1.typing", Envelope::new(events::TYPING, json!({})).to_bytes().unwrap())
            .await
            .unwrap();

        client.restore_link();
        timeout(WAIT, bridge.wait_connected()).await.unwrap();

        let resumed = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(resumed.envelope.id, during.id);
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.stats().await.reconnects, 1);
    }

    #[tokio::test]
    async fn test_queue_subscribers_share_work() {
        let (_bus, _client, bridge) = connected_bridge().await;
        let pattern = TopicPattern::parse("llm.request.*").unwrap();
        let (a, mut rx_a) = collector();
        let (b, mut rx_b) = collector();
        bridge.subscribe_queue("worker-a", &pattern, "llm", a).await;
        bridge.subscribe_queue("worker-b", &pattern, "llm", b).await;

        let subject = Subject::llm(crate::topic::LlmDirection::Request, "r1").unwrap();
        bridge
            .publish_durable(&subject, &Envelope::new("llm_request", json!({})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let got_a = rx_a.try_recv().is_ok();
        let got_b = rx_b.try_recv().is_ok();
        assert!(got_a ^ got_b);
    }

    #[tokio::test]
    async fn test_queue_group_outage_replays_to_one_member() {
        let (bus, client, bridge) = connected_bridge().await;
        let pattern = TopicPattern::parse("llm.request.*").unwrap();
        let (a, mut rx_a) = collector();
        let (b, mut rx_b) = collector();
        bridge.subscribe_queue("worker-a", &pattern, "llm", a).await;
        bridge.subscribe_queue("worker-b", &pattern, "llm", b).await;
        assert_eq!(bridge.stats().await.subscriptions, 2);

        client.drop_link();
        wait_state(&bridge, |state| state != BridgeState::Connected).await;

        let request = Envelope::new("llm_request", json!({"prompt": "hi"}));
        bus.client()
            .publish_durable(
                "EVENTS",
                "llm.request.r1",
                &request.id.to_string(),
                request.to_bytes().unwrap(),
            )
            .await
            .unwrap();

        client.restore_link();
        timeout(WAIT, bridge.wait_connected()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut handled = Vec::new();
        while let Ok(message) = rx_a.try_recv() {
            handled.push(("worker-a", message.envelope.id));
        }
        while let Ok(message) = rx_b.try_recv() {
            handled.push(("worker-b", message.envelope.id));
        }
        assert_eq!(handled.len(), 1, "handled by {handled:?}");
        assert_eq!(handled[0].1, request.id);
    }

    #[tokio::test]
    async fn test_queue_group_survives_member_leaving() {
        let (_bus, _client, bridge) = connected_bridge().await;
        let pattern = TopicPattern::parse("llm.request.*").unwrap();
        let (a, mut rx_a) = collector();
        let (b, mut rx_b) = collector();
        bridge.subscribe_queue("worker-a", &pattern, "llm", a).await;
        bridge.subscribe_queue("worker-b", &pattern, "llm", b).await;

        assert!(bridge.unsubscribe("worker-a", &pattern).await);
        assert!(!bridge.unsubscribe("worker-a", &pattern).await);
        assert_eq!(bridge.stats().await.subscriptions, 1);

        for id in ["r1", "r2"] {
            let subject = Subject::llm(crate::topic::LlmDirection::Request, id).unwrap();
            bridge
                .publish_durable(&subject, &Envelope::new("llm_request", json!({})))
                .await
                .unwrap();
        }
        for _ in 0..2 {
            assert!(timeout(WAIT, rx_b.recv()).await.unwrap().is_some());
        }
        // worker-a's handler went away with its membership.
        assert!(timeout(WAIT, rx_a.recv()).await.unwrap().is_none());

        assert_eq!(bridge.unsubscribe_owner("worker-b").await, 1);
        assert_eq!(bridge.stats().await.subscriptions, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_owner_is_idempotent() {
        let (_bus, _client, bridge) = connected_bridge().await;
        let (handler, _rx) = collector();
        bridge
            .subscribe("c1", &TopicPattern::user_all("u1").unwrap(), Arc::clone(&handler))
            .await;
        bridge
            .subscribe("c1", &TopicPattern::chat_all("u1").unwrap(), handler)
            .await;

        assert_eq!(bridge.unsubscribe_owner("c1").await, 2);
        assert_eq!(bridge.unsubscribe_owner("c1").await, 0);
        assert!(!bridge.unsubscribe("c1", &TopicPattern::admin_all()).await);
    }
}
