//! # Relay Configuration
//!
//! Typed configuration for a relay node. Every section has serde defaults so
//! a node starts with no file at all; a TOML file and `RELAY__*` environment
//! variables override individual keys (see [`loader`]).
//!
//! ```rust,no_run
//! use push_relay::config::RelayConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::load(None)?;
//! let staleness = config.router.staleness_threshold();
//! # Ok(())
//! # }
//! ```

pub mod loader;

use crate::constants::{defaults, MAX_TTL_SECONDS};
use crate::error::{RelayError, RelayResult};
use crate::models::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub node: NodeConfig,
    pub session: SessionConfig,
    pub router: RouterConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub bridge: BridgeConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity written into router claims. Must be unique across the fleet.
    pub node_id: String,
    pub listen_address: String,
    /// Prefix for subscription endpoints handed out on register.
    pub endpoint_base_url: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_address: defaults::LISTEN_ADDRESS.to_string(),
            endpoint_base_url: defaults::ENDPOINT_BASE_URL.to_string(),
        }
    }
}

impl NodeConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub hello_timeout_ms: u64,
    pub keepalive_timeout_ms: u64,
    pub min_ping_interval_ms: u64,
    pub claim_refresh_interval_ms: u64,
    pub storage_poll_interval_ms: u64,
    pub backlog_batch_size: usize,
    pub max_in_flight: usize,
    pub signal_queue_capacity: usize,
    /// Stored notifications a session may replay in one catch-up before the
    /// UAID is reset and the client has to register again.
    pub msg_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hello_timeout_ms: defaults::HELLO_TIMEOUT_MS,
            keepalive_timeout_ms: defaults::KEEPALIVE_TIMEOUT_MS,
            min_ping_interval_ms: defaults::MIN_PING_INTERVAL_MS,
            claim_refresh_interval_ms: defaults::CLAIM_REFRESH_INTERVAL_MS,
            storage_poll_interval_ms: defaults::STORAGE_POLL_INTERVAL_MS,
            backlog_batch_size: defaults::BACKLOG_BATCH_SIZE,
            max_in_flight: defaults::MAX_IN_FLIGHT,
            signal_queue_capacity: defaults::SIGNAL_QUEUE_CAPACITY,
            msg_limit: defaults::MSG_LIMIT,
        }
    }
}

impl SessionConfig {
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn min_ping_interval(&self) -> Duration {
        Duration::from_millis(self.min_ping_interval_ms)
    }

    pub fn claim_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.claim_refresh_interval_ms)
    }

    pub fn storage_poll_interval(&self) -> Duration {
        Duration::from_millis(self.storage_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long a claim survives without a refresh before another node may
    /// take it over.
    pub staleness_threshold_ms: u64,
    pub max_claim_attempts: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_ms: defaults::STALENESS_THRESHOLD_MS,
            max_claim_attempts: defaults::MAX_CLAIM_ATTEMPTS,
        }
    }
}

impl RouterConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub max_ttl_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: None,
            max_connections: 10,
            acquire_timeout_ms: 5_000,
            max_ttl_seconds: MAX_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the computed delay added as random jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    /// Gateway calls allowed in flight at once.
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::BRIDGE_QUEUE_CAPACITY,
            concurrency: 16,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl BridgeConfig {
    /// Backoff schedule for bridge wake-ups, expressed as a retry policy.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub idle_uaid_expiry_days: u64,
    /// Upper bound on UAIDs deleted per cycle.
    pub idle_batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: defaults::SWEEP_INTERVAL_SECONDS,
            idle_uaid_expiry_days: defaults::IDLE_UAID_EXPIRY_DAYS,
            idle_batch_size: 500,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn idle_expiry(&self) -> Duration {
        Duration::from_secs(self.idle_uaid_expiry_days * 24 * 60 * 60)
    }
}

impl RelayConfig {
    /// Reject combinations that would break claim hand-off or stall sessions.
    pub fn validate(&self) -> RelayResult<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(RelayError::Configuration(
                "node.node_id must not be empty".to_string(),
            ));
        }
        if self.router.staleness_threshold_ms <= self.session.claim_refresh_interval_ms {
            return Err(RelayError::Configuration(format!(
                "router.staleness_threshold_ms ({}) must exceed the claim refresh interval ({})",
                self.router.staleness_threshold_ms, self.session.claim_refresh_interval_ms
            )));
        }
        if self.session.claim_refresh_interval_ms == 0
            || self.session.storage_poll_interval_ms == 0
            || self.sweeper.interval_seconds == 0
        {
            return Err(RelayError::Configuration(
                "refresh, poll and sweep intervals must be non-zero".to_string(),
            ));
        }
        if self.session.backlog_batch_size == 0
            || self.session.max_in_flight == 0
            || self.session.signal_queue_capacity == 0
            || self.session.msg_limit == 0
        {
            return Err(RelayError::Configuration(
                "session batch, in-flight, queue and message limits must be non-zero".to_string(),
            ));
        }
        if self.router.max_claim_attempts == 0 || self.retry.max_attempts == 0 {
            return Err(RelayError::Configuration(
                "attempt limits must be at least 1".to_string(),
            ));
        }
        if self.bridge.queue_capacity == 0 || self.bridge.concurrency == 0 {
            return Err(RelayError::Configuration(
                "bridge.queue_capacity and bridge.concurrency must be non-zero".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.database_url.is_none()
        {
            return Err(RelayError::Configuration(
                "storage.database_url is required for the postgres backend".to_string(),
            ));
        }
        if self.storage.max_ttl_seconds == 0 {
            return Err(RelayError::Configuration(
                "storage.max_ttl_seconds must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Clamp a sender-supplied TTL to the configured maximum.
    pub fn clamp_ttl(&self, ttl_seconds: u64) -> u64 {
        ttl_seconds.min(self.storage.max_ttl_seconds)
    }
}
