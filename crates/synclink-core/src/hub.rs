//! Connection hub.
//!
//! The hub owns the table of live connections, keyed by user and device, and
//! mediates between sockets and the messaging bridge. Each connection gets a
//! writer task draining its [`OutboundQueue`] and a reader task dispatching
//! control frames; the table is never locked across socket I/O or bridge
//! calls.

use dashmap::DashMap;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use synclink_protocol::{
    codes, ClientFrame, PushFrame, Reply, ServerFrame, PROTOCOL_VERSION,
};
use synclink_transport::{ConnectionId, FrameSink, FrameSource};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::auth::Identity;
use crate::bridge::{BusMessage, Handler, MessagingBridge};
use crate::envelope::{events, EnvelopeId, Envelope};
use crate::error::ErrorKind;
use crate::presence::PresenceTracker;
use crate::queue::{OutboundQueue, PushOutcome};
use crate::sync::{SyncHandler, SyncRequest};
use crate::time::now_millis;
use crate::topic::{ChatKind, PatternScope, Subject, TopicError, TopicPattern, UserKind};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("Not allowed to subscribe to {0}")]
    Forbidden(String),

    #[error("Subscription limit of {0} reached")]
    TooManySubscriptions(usize),

    #[error("Connection is closed")]
    Closed,
}

impl HubError {
    /// Taxonomy kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::InvalidTopic(_) | HubError::TooManySubscriptions(_) => {
                ErrorKind::InvalidRequest
            }
            HubError::Forbidden(_) => ErrorKind::Forbidden,
            HubError::Closed => ErrorKind::ConnectionLost,
        }
    }

    fn reply(&self) -> Reply {
        let code = match self {
            HubError::InvalidTopic(_) => codes::INVALID_TOPIC,
            HubError::Forbidden(_) => codes::FORBIDDEN,
            HubError::TooManySubscriptions(_) => codes::MAX_SUBSCRIPTIONS,
            HubError::Closed => codes::UNAVAILABLE,
        };
        Reply::error(code, self.to_string(), false)
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound frames buffered per connection before the oldest is dropped.
    pub outbound_capacity: usize,
    /// Maximum topic subscriptions per connection.
    pub max_subscriptions: usize,
    /// Deadline for a single socket write.
    pub write_timeout: Duration,
    /// Envelope ids remembered per connection for duplicate suppression.
    pub dedup_memory: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            max_subscriptions: 100,
            write_timeout: Duration::from_secs(5),
            dedup_memory: 1024,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Registered,
    Closing,
    Closed,
}

const STATE_REGISTERED: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Default)]
struct HubCounters {
    total_connections: AtomicU64,
    slow_consumer_drops: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

/// Bounded memory of recently delivered envelope ids.
struct RecentIds {
    order: VecDeque<EnvelopeId>,
    seen: HashSet<EnvelopeId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if the id was already remembered.
    fn remember(&mut self, id: EnvelopeId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One registered device connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    state: AtomicU8,
    outbound: OutboundQueue,
    topics: Mutex<BTreeSet<String>>,
    recent: Mutex<RecentIds>,
    close_signal: Notify,
    counters: Arc<HubCounters>,
    connected_at: u64,
}

impl ConnectionHandle {
    fn new(identity: Identity, config: &HubConfig, counters: Arc<HubCounters>) -> Self {
        Self {
            id: ConnectionId::generate(),
            identity,
            state: AtomicU8::new(STATE_REGISTERED),
            outbound: OutboundQueue::new(config.outbound_capacity),
            topics: Mutex::new(BTreeSet::new()),
            recent: Mutex::new(RecentIds::new(config.dedup_memory)),
            close_signal: Notify::new(),
            counters,
            connected_at: now_millis(),
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the authenticated identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    /// Registration time, milliseconds since the Unix epoch.
    #[must_use]
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_REGISTERED => ConnectionState::Registered,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether the connection still accepts frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Registered
    }

    /// Subscribed topic patterns.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        lock(&self.topics).iter().cloned().collect()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.topics).len()
    }

    /// Frames waiting to be written.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Frames dropped because this device fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.outbound.dropped()
    }

    /// Queue a frame for the device without waiting.
    ///
    /// Returns `false` if the connection is closed.
    pub fn enqueue(&self, frame: ServerFrame) -> bool {
        match self.outbound.push(frame) {
            PushOutcome::Queued => true,
            PushOutcome::Evicted => {
                self.counters.slow_consumer_drops.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection = %self.id,
                    user_id = %self.identity.user_id,
                    device_id = %self.identity.device_id,
                    "Slow consumer, dropped oldest outbound frame"
                );
                true
            }
            PushOutcome::Closed => false,
        }
    }

    /// Wait for the next outbound frame; `None` once closed and drained.
    pub async fn next_frame(&self) -> Option<ServerFrame> {
        self.outbound.pop().await
    }

    /// Resolve once the connection starts closing.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            if !self.is_open() {
                return;
            }
            notified.await;
        }
    }

    /// Push a bus message to the device, skipping duplicates and the
    /// device's own typing echoes.
    fn deliver(&self, message: &BusMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        let envelope = &message.envelope;
        if envelope.kind == events::TYPING
            && envelope.user_id.as_deref() == Some(self.user_id())
            && envelope.device_id.as_deref() == Some(self.device_id())
        {
            return false;
        }
        if !lock(&self.recent).remember(envelope.id) {
            trace!(connection = %self.id, envelope = %envelope.id, "Duplicate delivery suppressed");
            return false;
        }
        self.enqueue(envelope.to_push(&message.subject).into())
    }

    fn add_topic(&self, pattern: &TopicPattern) -> bool {
        lock(&self.topics).insert(pattern.as_str().to_string())
    }

    fn remove_topic(&self, pattern: &TopicPattern) -> bool {
        lock(&self.topics).remove(pattern.as_str())
    }

    fn has_topic(&self, pattern: &TopicPattern) -> bool {
        lock(&self.topics).contains(pattern.as_str())
    }

    /// Registered → Closing. Returns `false` if already closing or closed.
    fn begin_close(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                STATE_REGISTERED,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.outbound.close();
            self.close_signal.notify_waiters();
        }
        won
    }

    fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Live connections.
    pub connections: usize,
    /// Users with at least one live connection.
    pub users: usize,
    /// Connections registered since start.
    pub total_connections: u64,
    pub slow_consumer_drops: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
}

/// The authoritative table of live connections.
pub struct ConnectionHub {
    connections: DashMap<String, HashMap<String, Arc<ConnectionHandle>>>,
    bridge: MessagingBridge,
    presence: Arc<PresenceTracker>,
    sync: Arc<SyncHandler>,
    config: HubConfig,
    counters: Arc<HubCounters>,
}

impl ConnectionHub {
    /// Create a new hub.
    #[must_use]
    pub fn new(
        bridge: MessagingBridge,
        presence: Arc<PresenceTracker>,
        sync: Arc<SyncHandler>,
        config: HubConfig,
    ) -> Self {
        info!("Creating connection hub with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            bridge,
            presence,
            sync,
            config,
            counters: Arc::new(HubCounters::default()),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the messaging bridge.
    #[must_use]
    pub fn bridge(&self) -> &MessagingBridge {
        &self.bridge
    }

    /// Register an authenticated device.
    ///
    /// An existing connection for the same user and device is closed first.
    /// The new connection is greeted with a `connected` frame and subscribed
    /// to `user.<id>.*`, `chat.<id>.>` and, for admins, `admin.*`. The device
    /// then counts as online until its heartbeats stop.
    pub async fn register(&self, identity: Identity) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new(
            identity,
            &self.config,
            Arc::clone(&self.counters),
        ));

        let previous = self
            .connections
            .entry(handle.user_id().to_string())
            .or_default()
            .insert(handle.device_id().to_string(), Arc::clone(&handle));

        if let Some(previous) = previous {
            info!(
                user_id = %handle.user_id(),
                device_id = %handle.device_id(),
                old = %previous.id(),
                new = %handle.id(),
                "Replacing existing device connection"
            );
            self.unregister(&previous).await;
        }

        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        handle.enqueue(
            Reply::Connected {
                connection_id: handle.id().to_string(),
                user_id: handle.user_id().to_string(),
                device_id: handle.device_id().to_string(),
                version: PROTOCOL_VERSION.to_string(),
                heartbeat_interval_ms: self.presence.config().heartbeat_interval.as_millis()
                    as u64,
                server_time: now_millis(),
            }
            .into(),
        );

        for pattern in Self::default_patterns(handle.identity()) {
            self.subscribe_pattern(&handle, &pattern).await;
        }

        // An unregister that raced the subscriptions above may have missed some.
        if !handle.is_open() {
            self.bridge.unsubscribe_owner(handle.id().as_str()).await;
        }

        // Device type and client version arrive with the first real heartbeat.
        self.presence
            .heartbeat(handle.user_id(), handle.device_id(), "", "");

        info!(
            connection = %handle.id(),
            user_id = %handle.user_id(),
            device_id = %handle.device_id(),
            admin = handle.identity().is_admin,
            "Connection registered"
        );
        handle
    }

    fn default_patterns(identity: &Identity) -> Vec<TopicPattern> {
        let mut patterns = Vec::with_capacity(3);
        match (
            TopicPattern::user_all(&identity.user_id),
            TopicPattern::chat_all(&identity.user_id),
        ) {
            (Ok(user), Ok(chat)) => {
                patterns.push(user);
                patterns.push(chat);
            }
            _ => warn!(user_id = %identity.user_id, "User id is not a valid topic segment"),
        }
        if identity.is_admin {
            patterns.push(TopicPattern::admin_all());
        }
        patterns
    }

    /// Register a device and drive its socket.
    ///
    /// Spawns the writer task (outbound queue → socket, with a write deadline)
    /// and the reader task (socket → control frames). Either side failing
    /// unregisters the connection.
    pub async fn attach<S, R>(
        self: &Arc<Self>,
        identity: Identity,
        sink: S,
        source: R,
    ) -> Arc<ConnectionHandle>
    where
        S: FrameSink + 'static,
        R: FrameSource + 'static,
    {
        let handle = self.register(identity).await;
        self.spawn_writer(Arc::clone(&handle), sink);
        self.spawn_reader(Arc::clone(&handle), source);
        handle
    }

    fn spawn_writer<S: FrameSink + 'static>(
        self: &Arc<Self>,
        handle: Arc<ConnectionHandle>,
        mut sink: S,
    ) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = handle.next_frame().await {
                match tokio::time::timeout(hub.config.write_timeout, sink.send(&frame)).await {
                    Ok(Ok(())) => {
                        hub.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        debug!(connection = %handle.id(), error = %e, "Socket write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(connection = %handle.id(), "Socket write deadline exceeded");
                        break;
                    }
                }
            }
            let _ = sink.close().await;
            hub.unregister(&handle).await;
        });
    }

    fn spawn_reader<R: FrameSource + 'static>(
        self: &Arc<Self>,
        handle: Arc<ConnectionHandle>,
        mut source: R,
    ) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handle.closed() => break,
                    result = source.recv() => match result {
                        Ok(Some(frame)) => {
                            hub.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                            hub.handle_frame(&handle, frame).await;
                        }
                        Ok(None) => {
                            debug!(connection = %handle.id(), "Socket closed by peer");
                            break;
                        }
                        Err(e) if !e.is_fatal() => {
                            debug!(connection = %handle.id(), error = %e, "Invalid frame");
                            handle.enqueue(Reply::error(codes::INVALID_FRAME, e.to_string(), false).into());
                        }
                        Err(e) => {
                            debug!(connection = %handle.id(), error = %e, "Socket read failed");
                            break;
                        }
                    }
                }
            }
            hub.unregister(&handle).await;
        });
    }

    /// Remove a connection, close its queue and drop its bus subscriptions.
    ///
    /// Idempotent. Returns `true` only for the call that performed the close.
    /// The table entry is removed only if it still points at this handle.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        if !handle.begin_close() {
            return false;
        }

        let user_id = handle.user_id();
        let now_empty = match self.connections.get_mut(user_id) {
            Some(mut devices) => {
                if devices
                    .get(handle.device_id())
                    .is_some_and(|current| current.id() == handle.id())
                {
                    devices.remove(handle.device_id());
                }
                devices.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.connections.remove_if(user_id, |_, devices| devices.is_empty());
        }

        self.bridge.unsubscribe_owner(handle.id().as_str()).await;
        handle.mark_closed();

        info!(
            connection = %handle.id(),
            user_id = %handle.user_id(),
            device_id = %handle.device_id(),
            dropped = handle.dropped(),
            "Connection unregistered"
        );
        true
    }

    /// Close every connection.
    pub async fn close_all(&self) -> usize {
        let handles: Vec<Arc<ConnectionHandle>> = self
            .connections
            .iter()
            .flat_map(|devices| devices.values().cloned().collect::<Vec<_>>())
            .collect();
        let mut closed = 0;
        for handle in handles {
            if self.unregister(&handle).await {
                closed += 1;
            }
        }
        closed
    }

    /// Look up the connection of one device.
    #[must_use]
    pub fn lookup(&self, user_id: &str, device_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(user_id)
            .and_then(|devices| devices.get(device_id).cloned())
    }

    /// All live connections of a user.
    #[must_use]
    pub fn connections_for(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .get(user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue a frame on every device of a user.
    ///
    /// Returns the number of devices the frame was queued for. Slow devices
    /// lose their oldest frame instead of blocking the others.
    pub fn send_to_user(&self, user_id: &str, frame: ServerFrame) -> usize {
        let handles = self.connections_for(user_id);
        let sent = handles
            .iter()
            .filter(|handle| handle.enqueue(frame.clone()))
            .count();
        trace!(user_id, sent, "Sent to user");
        sent
    }

    /// Push a domain event to every device of a user.
    pub fn notify_user(&self, user_id: &str, kind: &str, data: serde_json::Value) -> usize {
        let topic = Subject::user(user_id, UserKind::Notification)
            .map(|subject| subject.to_string())
            .unwrap_or_default();
        let push = PushFrame {
            kind: kind.to_string(),
            topic,
            user_id: Some(user_id.to_string()),
            timestamp: now_millis(),
            data,
        };
        self.send_to_user(user_id, push.into())
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.iter().map(|devices| devices.len()).sum(),
            users: self.connections.len(),
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            slow_consumer_drops: self.counters.slow_consumer_drops.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
        }
    }

    fn delivery_handler(handle: &Arc<ConnectionHandle>) -> Handler {
        let handle = Arc::downgrade(handle);
        Arc::new(move |message: BusMessage| {
            if let Some(handle) = handle.upgrade() {
                handle.deliver(&message);
            }
        })
    }

    async fn subscribe_pattern(&self, handle: &Arc<ConnectionHandle>, pattern: &TopicPattern) {
        self.bridge
            .subscribe(handle.id().as_str(), pattern, Self::delivery_handler(handle))
            .await;
        handle.add_topic(pattern);
    }

    fn authorize(identity: &Identity, pattern: &TopicPattern) -> Result<(), HubError> {
        match pattern.scope() {
            PatternScope::User(owner) if owner == identity.user_id => Ok(()),
            PatternScope::Admin if identity.is_admin => Ok(()),
            _ => Err(HubError::Forbidden(pattern.to_string())),
        }
    }

    /// Add a topic to a connection's subscription set.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed topics, topics outside the caller's
    /// scope, or when the subscription limit is reached.
    pub async fn subscribe(
        &self,
        handle: &Arc<ConnectionHandle>,
        topic: &str,
    ) -> Result<(), HubError> {
        let pattern = TopicPattern::parse(topic)?;
        Self::authorize(handle.identity(), &pattern)?;
        if !handle.is_open() {
            return Err(HubError::Closed);
        }
        if handle.has_topic(&pattern) {
            return Ok(());
        }
        if handle.subscription_count() >= self.config.max_subscriptions {
            return Err(HubError::TooManySubscriptions(self.config.max_subscriptions));
        }

        self.subscribe_pattern(handle, &pattern).await;
        if !handle.is_open() {
            self.bridge.unsubscribe(handle.id().as_str(), &pattern).await;
            return Err(HubError::Closed);
        }
        debug!(connection = %handle.id(), topic = %pattern, "Subscribed");
        Ok(())
    }

    /// Remove a topic from a connection's subscription set.
    ///
    /// Returns `false` if the connection was not subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed topics.
    pub async fn unsubscribe(
        &self,
        handle: &Arc<ConnectionHandle>,
        topic: &str,
    ) -> Result<bool, HubError> {
        let pattern = TopicPattern::parse(topic)?;
        if !handle.remove_topic(&pattern) {
            return Ok(false);
        }
        self.bridge.unsubscribe(handle.id().as_str(), &pattern).await;
        debug!(connection = %handle.id(), topic = %pattern, "Unsubscribed");
        Ok(true)
    }

    /// Dispatch one control frame from a device.
    pub async fn handle_frame(&self, handle: &Arc<ConnectionHandle>, frame: ClientFrame) {
        trace!(connection = %handle.id(), frame = frame.frame_type().as_str(), "Control frame");

        let reply = match frame {
            ClientFrame::Ping { timestamp } => Some(Reply::Pong {
                timestamp,
                server_time: now_millis(),
            }),

            ClientFrame::Subscribe { topic } => Some(match self.subscribe(handle, &topic).await {
                Ok(()) => Reply::Subscribed { topic },
                Err(e) => e.reply(),
            }),

            ClientFrame::Unsubscribe { topic } => {
                Some(match self.unsubscribe(handle, &topic).await {
                    Ok(_) => Reply::Unsubscribed { topic },
                    Err(e) => e.reply(),
                })
            }

            ClientFrame::SyncRequest(cursor) => {
                let request = SyncRequest::new(handle.user_id(), handle.device_id(), &cursor);
                Some(match self.sync.handle(&request).await {
                    Ok(response) => Reply::SyncResponse(response),
                    Err(e) => {
                        warn!(connection = %handle.id(), error = %e, "Sync failed");
                        Reply::error(codes::SYNC_FAILED, e.to_string(), e.kind().is_retryable())
                    }
                })
            }

            ClientFrame::Typing {
                session_id,
                is_typing,
            } => match Subject::chat(handle.user_id(), session_id.as_str(), ChatKind::Typing) {
                Ok(subject) => {
                    let envelope = Envelope::new(
                        events::TYPING,
                        json!({ "session_id": session_id, "is_typing": is_typing }),
                    )
                    .with_user(handle.user_id())
                    .with_device(handle.device_id());
                    self.bridge.publish(&subject, &envelope).await;
                    None
                }
                Err(e) => Some(HubError::InvalidTopic(e).reply()),
            },

            ClientFrame::Heartbeat {
                device_type,
                client_version,
            } => {
                self.presence.heartbeat(
                    handle.user_id(),
                    handle.device_id(),
                    &device_type,
                    &client_version,
                );
                Some(Reply::HeartbeatAck {
                    server_time: now_millis(),
                })
            }

            ClientFrame::Unknown => {
                warn!(connection = %handle.id(), "Ignoring unknown frame type");
                None
            }
        };

        if let Some(reply) = reply {
            handle.enqueue(reply.into());
        }
    }
}
