//! Shared server state and its background tasks.

use crate::config::Config;
use crate::metrics;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use synclink_core::time::now_millis;
use synclink_core::topic::UserKind;
use synclink_core::{
    events, BusTransport, ConnectionHub, Envelope, IdentityValidator, MessagingBridge,
    PresenceChange, PresenceTracker, SessionStore, Subject, SyncHandler,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Live device connections.
    pub hub: Arc<ConnectionHub>,
    /// Heartbeat-derived presence.
    pub presence: Arc<PresenceTracker>,
    /// Catch-up over HTTP and the live socket.
    pub sync: Arc<SyncHandler>,
    /// Session and message storage.
    pub store: Arc<dyn SessionStore>,
    /// Resolves bearer tokens to identities.
    pub validator: Arc<dyn IdentityValidator>,
}

impl AppState {
    /// Wire every component together. Starts the bridge supervisor, so it
    /// must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(
        config: Config,
        transport: Arc<dyn BusTransport>,
        store: Arc<dyn SessionStore>,
        validator: Arc<dyn IdentityValidator>,
    ) -> Self {
        info!("Creating server state with config: {:?}", config);

        let bridge = MessagingBridge::start(transport, config.bridge_config());
        let presence = Arc::new(PresenceTracker::new(config.presence_config()));
        let sync = Arc::new(SyncHandler::new(Arc::clone(&store), config.sync_config()));
        let hub = Arc::new(ConnectionHub::new(
            bridge,
            Arc::clone(&presence),
            Arc::clone(&sync),
            config.hub_config(),
        ));

        Self {
            config,
            hub,
            presence,
            sync,
            store,
            validator,
        }
    }

    /// The bus bridge the hub publishes through.
    #[must_use]
    pub fn bridge(&self) -> &MessagingBridge {
        self.hub.bridge()
    }

    /// Start the presence sweeper, the presence forwarder and, when enabled,
    /// the metrics reporter.
    #[must_use]
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            self.presence.spawn_sweeper(),
            tokio::spawn(forward_presence(
                self.bridge().clone(),
                self.presence.subscribe_changes(),
            )),
        ];
        if self.config.metrics.enabled {
            tasks.push(tokio::spawn(report_stats(
                Arc::clone(&self.hub),
                Arc::clone(&self.presence),
                Duration::from_millis(self.config.metrics.report_interval_ms.max(1)),
            )));
        }
        tasks
    }
}

/// The envelope announcing a presence transition on `user.<id>.presence`.
fn presence_envelope(change: &PresenceChange) -> Envelope {
    Envelope::new(
        events::PRESENCE_CHANGED,
        json!({
            "user_id": change.user_id,
            "device_id": change.device_id,
            "from": change.from,
            "to": change.to,
            "at": change.at,
        }),
    )
    .with_user(&change.user_id)
    .with_device(&change.device_id)
}

async fn forward_presence(bridge: MessagingBridge, mut changes: broadcast::Receiver<PresenceChange>) {
    loop {
        match changes.recv().await {
            Ok(change) => match Subject::user(change.user_id.as_str(), UserKind::Presence) {
                Ok(subject) => bridge.publish(&subject, &presence_envelope(&change)).await,
                Err(e) => debug!(user_id = %change.user_id, error = %e, "Presence not forwarded"),
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Presence forwarder lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn report_stats(hub: Arc<ConnectionHub>, presence: Arc<PresenceTracker>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        metrics::record_hub(&hub.stats());
        metrics::record_presence(presence.online_count(), presence.active_today_count(now_millis()));
        let bridge = hub.bridge().stats().await;
        metrics::record_bridge(hub.bridge().is_connected(), bridge.reconnects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synclink_core::{MemoryBus, MemoryStore, PresenceStatus, StaticTokenValidator};
    use synclink_core::{DeliverFrom, TopicPattern};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_presence_envelope_shape() {
        let change = PresenceChange {
            user_id: "alice".into(),
            device_id: "phone".into(),
            from: PresenceStatus::Online,
            to: PresenceStatus::Away,
            at: 42,
        };
        let envelope = presence_envelope(&change);
        assert_eq!(envelope.kind, events::PRESENCE_CHANGED);
        assert_eq!(envelope.payload["to"], "away");
        assert_eq!(envelope.device_id.as_deref(), Some("phone"));
    }

    #[tokio::test]
    async fn test_presence_changes_reach_the_bus() {
        let bus = MemoryBus::new();
        let observer = bus.client();
        observer.connect().await.unwrap();
        let mut observed = observer
            .subscribe(
                TopicPattern::user_all("alice").unwrap().as_str(),
                None,
                DeliverFrom::New,
            )
            .await
            .unwrap();

        let state = AppState::new(
            Config::default(),
            Arc::new(bus.client()),
            Arc::new(MemoryStore::new()),
            Arc::new(StaticTokenValidator::new()),
        );
        timeout(WAIT, state.bridge().wait_connected()).await.unwrap();
        let tasks = state.spawn_background();

        state.presence.heartbeat("alice", "phone", "ios", "3.2.0");

        let raw = timeout(WAIT, observed.receiver.recv()).await.unwrap().unwrap();
        assert_eq!(raw.subject, "user.alice.presence");
        let envelope = Envelope::from_slice(&raw.payload).unwrap();
        assert_eq!(envelope.payload["to"], "online");

        for task in tasks {
            task.abort();
        }
    }
}
