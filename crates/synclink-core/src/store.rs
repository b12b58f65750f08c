//! Session/message store seam.
//!
//! Storage is owned by another service; [`SessionStore`] is the slice of its
//! API that catch-up sync and message creation need. [`MemoryStore`] is an
//! in-process implementation for single-node use and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use synclink_protocol::{ChatMessage, MessageId, Session};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::ErrorKind;
use crate::time::now_millis;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied to {0}")]
    Forbidden(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Taxonomy kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::InvalidRequest,
            StoreError::Forbidden(_) => ErrorKind::Forbidden,
            StoreError::Unavailable(_) => ErrorKind::Store,
        }
    }
}

/// Where a message listing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCursor {
    /// From the first message.
    Start,
    /// Messages created strictly after this time (ms).
    Since(u64),
    /// Messages with an id strictly greater than this one.
    AfterId(MessageId),
}

/// Where a tombstone listing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionAnchor {
    /// Deletions at or after this time (ms).
    Time(u64),
    /// Deletions made once this message existed.
    AfterMessage(MessageId),
}

/// A message to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    #[serde(default = "default_role")]
    pub role: String,
    pub content: String,
}

fn default_role() -> String {
    "user".to_string()
}

/// Session and message storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Every session owned by the user.
    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError>;

    /// Up to `limit` messages of a session after `cursor`, in id order.
    async fn messages_after(
        &self,
        session_id: &str,
        cursor: MessageCursor,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Ids of the user's sessions and messages deleted after `anchor`.
    async fn deleted_since(
        &self,
        user_id: &str,
        anchor: DeletionAnchor,
    ) -> Result<Vec<String>, StoreError>;

    /// Persist a message, assigning its id.
    async fn create_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;
}

/// How long [`MemoryStore`] keeps tombstones by default.
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

struct Tombstone {
    user_id: String,
    id: String,
    deleted_at: u64,
    /// Newest message id at deletion time.
    newest_message: MessageId,
}

#[derive(Default)]
struct StoreState {
    next_message_id: MessageId,
    next_session_id: u64,
    sessions: HashMap<String, Session>,
    messages: BTreeMap<MessageId, ChatMessage>,
    /// Oldest first.
    tombstones: VecDeque<Tombstone>,
}

impl StoreState {
    fn bury(&mut self, user_id: &str, id: String, now: u64, retention: Duration) {
        let cutoff = now.saturating_sub(retention.as_millis() as u64);
        while self
            .tombstones
            .front()
            .is_some_and(|tombstone| tombstone.deleted_at < cutoff)
        {
            self.tombstones.pop_front();
        }
        self.tombstones.push_back(Tombstone {
            user_id: user_id.to_string(),
            id,
            deleted_at: now,
            newest_message: self.next_message_id,
        });
    }
}

/// In-process store. Message ids increase across the whole store.
///
/// Tombstones older than the retention window are dropped, so a device whose
/// cursor is older than that misses those deletions.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    failing: AtomicBool,
    tombstone_retention: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_tombstone_retention(DEFAULT_TOMBSTONE_RETENTION)
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that keeps tombstones for `retention`.
    #[must_use]
    pub fn with_tombstone_retention(retention: Duration) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            failing: AtomicBool::new(false),
            tombstone_retention: retention,
        }
    }

    /// Drop tombstones that fell out of the retention window as of `now_ms`.
    /// Returns how many were dropped.
    pub async fn prune_tombstones_at(&self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.tombstone_retention.as_millis() as u64);
        let mut state = self.state.write().await;
        let before = state.tombstones.len();
        state.tombstones.retain(|tombstone| tombstone.deleted_at >= cutoff);
        before - state.tombstones.len()
    }

    /// Make every call fail with [`StoreError::Unavailable`] while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Create a session for a user.
    pub async fn create_session(&self, user_id: &str, title: &str) -> Session {
        let mut state = self.state.write().await;
        state.next_session_id += 1;
        let now = now_millis();
        let session = Session {
            id: format!("s{}", state.next_session_id),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        state.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Delete one of the user's messages, leaving a tombstone.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not exist or belongs to someone else.
    pub async fn delete_message(&self, user_id: &str, id: MessageId) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state.messages.get(&id) {
            None => return Err(StoreError::NotFound(format!("message {id}"))),
            Some(message) if message.user_id != user_id => {
                return Err(StoreError::Forbidden(format!("message {id}")))
            }
            Some(_) => {}
        }
        state.messages.remove(&id);
        state.bury(user_id, id.to_string(), now_millis(), self.tombstone_retention);
        Ok(())
    }

    /// Delete one of the user's sessions and its messages, leaving a tombstone
    /// for the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist or belongs to someone else.
    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state.sessions.get(session_id) {
            None => return Err(StoreError::NotFound(format!("session {session_id}"))),
            Some(session) if session.user_id != user_id => {
                return Err(StoreError::Forbidden(format!("session {session_id}")))
            }
            Some(_) => {}
        }
        state.sessions.remove(session_id);
        state
            .messages
            .retain(|_, message| message.session_id != session_id);
        state.bury(user_id, session_id.to_string(), now_millis(), self.tombstone_retention);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect();
        // Creation order; ids are "s<n>", so a shorter id is an older one.
        sessions.sort_by(|a, b| {
            (a.created_at, a.id.len(), &a.id).cmp(&(b.created_at, b.id.len(), &b.id))
        });
        Ok(sessions)
    }

    async fn messages_after(
        &self,
        session_id: &str,
        cursor: MessageCursor,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .messages
            .values()
            .filter(|message| message.session_id == session_id)
            .filter(|message| match cursor {
                MessageCursor::Start => true,
                MessageCursor::Since(time) => message.created_at > time,
                MessageCursor::AfterId(id) => message.id > id,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn deleted_since(
        &self,
        user_id: &str,
        anchor: DeletionAnchor,
    ) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .tombstones
            .iter()
            .filter(|tombstone| tombstone.user_id == user_id)
            .filter(|tombstone| match anchor {
                DeletionAnchor::Time(since) => tombstone.deleted_at >= since,
                DeletionAnchor::AfterMessage(id) => tombstone.newest_message >= id,
            })
            .map(|tombstone| tombstone.id.clone())
            .collect())
    }

    async fn create_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let now = now_millis();

        let session = state
            .sessions
            .get_mut(&message.session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", message.session_id)))?;
        if session.user_id != message.user_id {
            return Err(StoreError::Forbidden(format!("session {}", message.session_id)));
        }
        session.updated_at = session.updated_at.max(now);

        state.next_message_id += 1;
        let created = ChatMessage {
            id: state.next_message_id,
            session_id: message.session_id,
            user_id: message.user_id,
            parent_id: message.parent_id,
            role: message.role,
            content: message.content,
            created_at: now,
        };
        state.messages.insert(created.id, created.clone());
        Ok(created)
    }
}
