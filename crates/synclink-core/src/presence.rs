//! Presence tracking.
//!
//! Presence is derived from heartbeats, not from socket lifecycle, so a device
//! that reconnects quickly never flickers offline. A periodic sweep moves
//! silent devices `online → away → offline` using fixed thresholds.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::time::{now_millis, start_of_day};

/// Derived presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    /// Status label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Presence configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Expected heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Silence after which a device is offline.
    pub timeout: Duration,
    /// Silence after which a device is away.
    pub away_after: Duration,
}

impl PresenceConfig {
    /// Derive thresholds from the heartbeat interval: timeout is three
    /// intervals, away starts at half the timeout.
    #[must_use]
    pub fn from_interval(heartbeat_interval: Duration) -> Self {
        let timeout = heartbeat_interval * 3;
        Self {
            heartbeat_interval,
            timeout,
            away_after: timeout / 2,
        }
    }

    /// How often the sweep runs.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        (self.heartbeat_interval / 2).max(Duration::from_millis(1))
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self::from_interval(Duration::from_secs(30))
    }
}

/// Presence of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub device_id: String,
    pub device_type: String,
    pub client_version: String,
    pub status: PresenceStatus,
    /// Last heartbeat, milliseconds since the Unix epoch.
    pub last_seen_at: u64,
}

/// A status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChange {
    pub user_id: String,
    pub device_id: String,
    pub from: PresenceStatus,
    pub to: PresenceStatus,
    pub at: u64,
}

/// Presence of a user across devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub online: bool,
    pub devices: Vec<PresenceRecord>,
}

/// Heartbeat-driven presence tracker.
pub struct PresenceTracker {
    records: DashMap<(String, String), PresenceRecord>,
    config: PresenceConfig,
    changes: broadcast::Sender<PresenceChange>,
}

impl PresenceTracker {
    /// Create a new tracker.
    #[must_use]
    pub fn new(config: PresenceConfig) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            records: DashMap::new(),
            config,
            changes,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Receive every status transition from now on.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    /// Record a heartbeat now.
    pub fn heartbeat(
        &self,
        user_id: &str,
        device_id: &str,
        device_type: &str,
        client_version: &str,
    ) -> Option<PresenceChange> {
        self.heartbeat_at(user_id, device_id, device_type, client_version, now_millis())
    }

    /// Record a heartbeat at `now_ms`, returning the transition if the device
    /// was not already online.
    pub fn heartbeat_at(
        &self,
        user_id: &str,
        device_id: &str,
        device_type: &str,
        client_version: &str,
        now_ms: u64,
    ) -> Option<PresenceChange> {
        let key = (user_id.to_string(), device_id.to_string());
        let previous = {
            let mut record = self.records.entry(key).or_insert_with(|| PresenceRecord {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                device_type: String::new(),
                client_version: String::new(),
                status: PresenceStatus::Offline,
                last_seen_at: now_ms,
            });
            let previous = record.status;
            record.status = PresenceStatus::Online;
            record.last_seen_at = record.last_seen_at.max(now_ms);
            if !device_type.is_empty() {
                record.device_type = device_type.to_string();
            }
            if !client_version.is_empty() {
                record.client_version = client_version.to_string();
            }
            previous
        };

        trace!(user_id, device_id, "Heartbeat");
        if previous == PresenceStatus::Online {
            return None;
        }

        let change = PresenceChange {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            from: previous,
            to: PresenceStatus::Online,
            at: now_ms,
        };
        debug!(user_id, device_id, from = previous.as_str(), "Device online");
        let _ = self.changes.send(change.clone());
        Some(change)
    }

    fn status_for_silence(&self, silent_ms: u64) -> PresenceStatus {
        if silent_ms >= self.config.timeout.as_millis() as u64 {
            PresenceStatus::Offline
        } else if silent_ms >= self.config.away_after.as_millis() as u64 {
            PresenceStatus::Away
        } else {
            PresenceStatus::Online
        }
    }

    /// Apply timeout thresholds as of `now_ms`.
    ///
    /// A device going offline always passes through away, so both transitions
    /// are returned in order. Offline records last seen before today are
    /// forgotten.
    pub fn sweep_at(&self, now_ms: u64) -> Vec<PresenceChange> {
        let mut changes = Vec::new();

        for mut record in self.records.iter_mut() {
            let target = self.status_for_silence(now_ms.saturating_sub(record.last_seen_at));
            while record.status < target {
                let from = record.status;
                let to = match from {
                    PresenceStatus::Online => PresenceStatus::Away,
                    PresenceStatus::Away | PresenceStatus::Offline => PresenceStatus::Offline,
                };
                record.status = to;
                changes.push(PresenceChange {
                    user_id: record.user_id.clone(),
                    device_id: record.device_id.clone(),
                    from,
                    to,
                    at: now_ms,
                });
            }
        }

        let today = start_of_day(now_ms);
        self.records.retain(|_, record| {
            record.status != PresenceStatus::Offline || record.last_seen_at >= today
        });

        for change in &changes {
            debug!(
                user_id = %change.user_id,
                device_id = %change.device_id,
                to = change.to.as_str(),
                "Presence changed"
            );
            let _ = self.changes.send(change.clone());
        }
        changes
    }

    /// Apply timeout thresholds now.
    pub fn sweep(&self) -> Vec<PresenceChange> {
        self.sweep_at(now_millis())
    }

    /// Run [`sweep`](Self::sweep) every half heartbeat interval until aborted.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tracker.config.sweep_interval());
            loop {
                interval.tick().await;
                tracker.sweep();
            }
        })
    }

    /// Presence of one device.
    #[must_use]
    pub fn device(&self, user_id: &str, device_id: &str) -> Option<PresenceRecord> {
        self.records
            .get(&(user_id.to_string(), device_id.to_string()))
            .map(|record| record.clone())
    }

    /// All known devices of a user, ordered by device id.
    #[must_use]
    pub fn devices(&self, user_id: &str) -> Vec<PresenceRecord> {
        let mut devices: Vec<PresenceRecord> = self
            .records
            .iter()
            .filter(|record| record.user_id == user_id)
            .map(|record| record.clone())
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// Presence summary for a user.
    #[must_use]
    pub fn user_presence(&self, user_id: &str) -> UserPresence {
        let devices = self.devices(user_id);
        UserPresence {
            user_id: user_id.to_string(),
            online: devices
                .iter()
                .any(|device| device.status == PresenceStatus::Online),
            devices,
        }
    }

    /// Devices online right now.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == PresenceStatus::Online)
            .count()
    }

    /// Devices seen during the UTC day containing `now_ms`, whatever their
    /// current status.
    #[must_use]
    pub fn active_today_count(&self, now_ms: u64) -> usize {
        let today = start_of_day(now_ms);
        self.records
            .iter()
            .filter(|record| record.last_seen_at >= today)
            .count()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}
