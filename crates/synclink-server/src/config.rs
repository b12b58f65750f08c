//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - A TOML file (`synclink.toml`, `/etc/synclink/synclink.toml` or
//!   `~/.config/synclink/synclink.toml`)
//! - Environment variables (`SYNCLINK__HUB__OUTBOUND_CAPACITY=512`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use synclink_core::{
    BridgeConfig, HubConfig, Identity, PresenceConfig, StaticTokenValidator, SyncConfig,
};
use synclink_transport::WebSocketConfig;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Socket configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Connection hub limits.
    #[serde(default)]
    pub hub: HubSection,

    /// Heartbeat and presence thresholds.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Bus reconnect behaviour.
    #[serde(default)]
    pub bridge: BridgeSection,

    /// Catch-up paging.
    #[serde(default)]
    pub sync: SyncSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Credentials accepted by the bundled validator.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Deadline for a single socket write in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Connection hub limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Frames buffered per device before the oldest is dropped.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,

    /// Envelope ids remembered per connection for duplicate suppression.
    #[serde(default = "default_dedup_memory")]
    pub dedup_memory: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Silence before a device is offline. Three intervals when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Silence before a device is away. Half the timeout when unset.
    #[serde(default)]
    pub away_after_ms: Option<u64>,
}

/// Bus reconnect behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// First reconnect delay in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnect delay ceiling in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

/// Catch-up paging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Maximum messages per sync response.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often hub and presence gauges are refreshed, in milliseconds.
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
}

/// Credentials accepted by the bundled validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    pub device_id: String,
    #[serde(default)]
    pub admin: bool,
    /// Expiry in milliseconds since the epoch.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_write_timeout() -> u64 {
    5_000
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_dedup_memory() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_page_size() -> usize {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_report_interval() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            hub: HubSection::default(),
            heartbeat: HeartbeatConfig::default(),
            bridge: BridgeSection::default(),
            sync: SyncSection::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            max_subscriptions: default_max_subscriptions(),
            dedup_memory: default_dedup_memory(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: None,
            away_after_ms: None,
        }
    }
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            report_interval_ms: default_report_interval(),
        }
    }
}

const CONFIG_PATHS: [&str; 3] = [
    "synclink.toml",
    "/etc/synclink/synclink.toml",
    "~/.config/synclink/synclink.toml",
];

/// Environment variable naming the config file to load instead of searching.
pub const CONFIG_ENV: &str = "SYNCLINK_CONFIG";

impl Config {
    /// Load configuration from `$SYNCLINK_CONFIG` or the first config file
    /// found, overlaid with `SYNCLINK__`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file or environment override cannot be
    /// parsed.
    pub fn load() -> Result<Self> {
        Self::load_with(std::env::var(CONFIG_ENV).ok().as_deref())
    }

    /// Like [`Config::load`], with an explicit file that replaces the search
    /// path and must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if `explicit` does not exist, or if a config file or
    /// environment override cannot be parsed.
    pub fn load_with(explicit: Option<&str>) -> Result<Self> {
        let file = match explicit {
            Some(path) => {
                let path = shellexpand::tilde(path).into_owned();
                if !Path::new(&path).exists() {
                    anyhow::bail!("Config file not found: {path}");
                }
                Some(path)
            }
            None => CONFIG_PATHS
                .iter()
                .map(|path| shellexpand::tilde(path).into_owned())
                .find(|path| Path::new(path).exists()),
        };

        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Toml));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SYNCLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .with_context(|| match &file {
                Some(path) => format!("Failed to parse configuration from {path}"),
                None => "Failed to parse configuration from environment".to_string(),
            })
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.hub.outbound_capacity,
            max_subscriptions: self.hub.max_subscriptions,
            write_timeout: Duration::from_millis(self.transport.write_timeout_ms),
            dedup_memory: self.hub.dedup_memory,
        }
    }

    #[must_use]
    pub fn presence_config(&self) -> PresenceConfig {
        let mut presence =
            PresenceConfig::from_interval(Duration::from_millis(self.heartbeat.interval_ms));
        if let Some(timeout) = self.heartbeat.timeout_ms {
            presence.timeout = Duration::from_millis(timeout);
            presence.away_after = presence.timeout / 2;
        }
        if let Some(away) = self.heartbeat.away_after_ms {
            presence.away_after = Duration::from_millis(away);
        }
        presence
    }

    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            initial_backoff: Duration::from_millis(self.bridge.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.bridge.max_backoff_ms),
        }
    }

    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            page_size: self.sync.page_size,
        }
    }

    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: self.transport.max_message_size,
        }
    }

    /// Build the bundled token validator from `[auth]`.
    #[must_use]
    pub fn token_validator(&self) -> StaticTokenValidator {
        let mut validator = StaticTokenValidator::new();
        for entry in &self.auth.tokens {
            let mut identity = Identity::new(&entry.user_id, &entry.device_id);
            if entry.admin {
                identity = identity.admin();
            }
            validator.insert(&entry.token, identity, entry.expires_at);
        }
        validator
    }
}
