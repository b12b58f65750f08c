//! Cursor-based catch-up.
//!
//! A reconnecting device sends the cursor it last saw and receives one page
//! of what changed since. The handler is read-only: all data comes from the
//! [`SessionStore`], so repeating a request is always safe.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use synclink_protocol::{MessageId, SyncCursor, SyncResponse};
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;
use crate::store::{DeletionAnchor, MessageCursor, SessionStore, StoreError};
use crate::time::now_millis;

/// Sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum messages per response.
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

/// Sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error during sync: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Taxonomy kind for this error. Always retryable.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Store
    }
}

/// A catch-up request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub user_id: String,
    pub device_id: String,
    #[serde(default)]
    pub last_sync_time: Option<u64>,
    #[serde(default, alias = "last_msg_id")]
    pub last_message_id: Option<MessageId>,
}

impl SyncRequest {
    /// Build a request for an identity from a client cursor.
    #[must_use]
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>, cursor: &SyncCursor) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            last_sync_time: cursor.last_sync_time,
            last_message_id: cursor.last_message_id,
        }
    }

    /// Tombstones are only relevant to a device that already holds data.
    fn deletion_anchor(&self) -> Option<DeletionAnchor> {
        match (self.last_sync_time, self.last_message_id) {
            (Some(time), _) => Some(DeletionAnchor::Time(time)),
            (None, Some(id)) => Some(DeletionAnchor::AfterMessage(id)),
            (None, None) => None,
        }
    }

    fn message_cursor(&self) -> MessageCursor {
        match (self.last_message_id, self.last_sync_time) {
            (Some(id), _) => MessageCursor::AfterId(id),
            (None, Some(time)) => MessageCursor::Since(time),
            (None, None) => MessageCursor::Start,
        }
    }
}

/// Serves catch-up requests.
pub struct SyncHandler {
    store: Arc<dyn SessionStore>,
    config: SyncConfig,
}

impl SyncHandler {
    /// Create a handler over a store.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Produce one page of changes after the request's cursor.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] if the store fails; the request can be
    /// repeated unchanged.
    pub async fn handle(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let server_time = now_millis();
        let page_size = self.config.page_size.max(1);
        let cursor = request.message_cursor();

        let all_sessions = self.store.sessions_for_user(&request.user_id).await?;

        let mut messages = Vec::new();
        for session in &all_sessions {
            let page = self
                .store
                .messages_after(&session.id, cursor, page_size + 1)
                .await?;
            messages.extend(page);
        }
        messages.sort_by_key(|message| message.id);
        messages.dedup_by_key(|message| message.id);

        let has_more = messages.len() > page_size;
        messages.truncate(page_size);

        let sessions = match request.last_sync_time {
            Some(since) => all_sessions
                .into_iter()
                .filter(|session| session.updated_at > since)
                .collect(),
            None => all_sessions,
        };

        let deleted_ids = match request.deletion_anchor() {
            Some(anchor) => self.store.deleted_since(&request.user_id, anchor).await?,
            None => Vec::new(),
        };

        let next_cursor = messages.last().map(|message| SyncCursor {
            last_sync_time: Some(server_time),
            last_message_id: Some(message.id),
        });

        debug!(
            user_id = %request.user_id,
            device_id = %request.device_id,
            ?cursor,
            sessions = sessions.len(),
            messages = messages.len(),
            deleted = deleted_ids.len(),
            has_more,
            "Sync page served"
        );

        Ok(SyncResponse {
            sessions,
            messages,
            deleted_ids,
            server_time,
            has_more,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewMessage};

    async fn seeded(count: usize) -> (Arc<MemoryStore>, Vec<MessageId>) {
        let store = Arc::new(MemoryStore::new());
        let a = store.create_session("u1", "a").await;
        let b = store.create_session("u1", "b").await;
        let other = store.create_session("u2", "other").await;

        let mut ids = Vec::new();
        for i in 0..count {
            let session = if i % 2 == 0 { &a } else { &b };
            let message = store
                .create_message(NewMessage {
                    session_id: session.id.clone(),
                    user_id: "u1".into(),
                    parent_id: None,
                    role: "user".into(),
                    content: format!("m{i}"),
                })
                .await
                .unwrap();
            ids.push(message.id);
        }
        store
            .create_message(NewMessage {
                session_id: other.id.clone(),
                user_id: "u2".into(),
                parent_id: None,
                role: "user".into(),
                content: "not yours".into(),
            })
            .await
            .unwrap();
        (store, ids)
    }

    fn handler(store: Arc<MemoryStore>, page_size: usize) -> SyncHandler {
        SyncHandler::new(store, SyncConfig { page_size })
    }

    fn request(cursor: SyncCursor) -> SyncRequest {
        SyncRequest::new("u1", "d1", &cursor)
    }

    #[tokio::test]
    async fn test_first_sync_returns_everything() {
        let (store, ids) = seeded(3).await;
        let response = handler(store, 10)
            .handle(&request(SyncCursor::start()))
            .await
            .unwrap();

        assert_eq!(response.sessions.len(), 2);
        let got: Vec<MessageId> = response.messages.iter().map(|m| m.id).collect();
        assert_eq!(got, ids);
        assert!(!response.has_more);
        assert!(response.deleted_ids.is_empty());
        assert_eq!(
            response.next_cursor.and_then(|c| c.last_message_id),
            ids.last().copied()
        );
    }

    #[tokio::test]
    async fn test_pages_across_sessions_in_id_order() {
        let (store, ids) = seeded(5).await;
        let sync = handler(store, 2);

        let mut cursor = SyncCursor::start();
        let mut seen = Vec::new();
        loop {
            let response = sync.handle(&request(cursor.clone())).await.unwrap();
            seen.extend(response.messages.iter().map(|m| m.id));
            if !response.has_more {
                break;
            }
            cursor = response.next_cursor.unwrap();
        }
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn test_after_id_is_strict() {
        let (store, ids) = seeded(4).await;
        let response = handler(store, 10)
            .handle(&request(SyncCursor::after_message(ids[2])))
            .await
            .unwrap();
        let got: Vec<MessageId> = response.messages.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![ids[3]]);
    }

    #[tokio::test]
    async fn test_repeat_request_is_idempotent() {
        let (store, ids) = seeded(4).await;
        store.delete_message("u1", ids[0]).await.unwrap();
        let sync = handler(store, 10);
        let cursor = SyncCursor {
            last_sync_time: Some(0),
            last_message_id: Some(ids[1]),
        };

        let first = sync.handle(&request(cursor.clone())).await.unwrap();
        let second = sync.handle(&request(cursor)).await.unwrap();
        assert_eq!(first.messages, second.messages);
        assert_eq!(first.deleted_ids, second.deleted_ids);
        assert_eq!(first.deleted_ids, vec![ids[0].to_string()]);
    }

    #[tokio::test]
    async fn test_id_only_cursor_still_gets_tombstones() {
        let (store, ids) = seeded(4).await;
        store.delete_message("u1", ids[3]).await.unwrap();
        let response = handler(store, 10)
            .handle(&request(SyncCursor::after_message(ids[1])))
            .await
            .unwrap();

        let got: Vec<MessageId> = response.messages.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![ids[2]]);
        assert_eq!(response.deleted_ids, vec![ids[3].to_string()]);
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable() {
        let (store, _) = seeded(1).await;
        store.set_failing(true);
        let err = handler(store, 10)
            .handle(&request(SyncCursor::start()))
            .await
            .unwrap_err();
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn test_request_accepts_short_alias() {
        let request: SyncRequest = serde_json::from_str(
            r#"{"user_id":"u1","device_id":"d1","last_sync_time":5,"last_msg_id":9}"#,
        )
        .unwrap();
        assert_eq!(request.message_cursor(), MessageCursor::AfterId(9));
    }
}
