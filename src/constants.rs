//! # Relay Constants
//!
//! Protocol limits and defaults shared by the configuration layer and the
//! session machinery.

/// Longest TTL a notification may carry; larger requests are clamped.
pub const MAX_TTL_SECONDS: u64 = 60 * 60 * 24 * 60;

/// Close code sent (as a log field) when a client pings too often.
pub const PING_ABUSE_CLOSE_CODE: u16 = 4774;

/// Register replies for well-formed requests.
pub const STATUS_OK: u16 = 200;
/// Register/unregister replies for an invalid channel id.
pub const STATUS_INVALID_CHANNEL: u16 = 401;
/// Register replies when the channel could not be stored.
pub const STATUS_SERVER_ERROR: u16 = 500;

/// Wire message type names.
pub mod message_types {
    pub const HELLO: &str = "hello";
    pub const REGISTER: &str = "register";
    pub const UNREGISTER: &str = "unregister";
    pub const ACK: &str = "ack";
    pub const NACK: &str = "nack";
    /// Log label for `{}` frames, which carry no type.
    pub const PING: &str = "ping";
}

/// Default timing and sizing values.
pub mod defaults {
    pub const HELLO_TIMEOUT_MS: u64 = 10_000;
    pub const KEEPALIVE_TIMEOUT_MS: u64 = 300_000;
    pub const MIN_PING_INTERVAL_MS: u64 = 55_000;
    pub const CLAIM_REFRESH_INTERVAL_MS: u64 = 60_000;
    pub const STORAGE_POLL_INTERVAL_MS: u64 = 30_000;
    pub const STALENESS_THRESHOLD_MS: u64 = 180_000;
    pub const BACKLOG_BATCH_SIZE: usize = 10;
    pub const MAX_IN_FLIGHT: usize = 100;
    pub const MSG_LIMIT: usize = 100;
    pub const SIGNAL_QUEUE_CAPACITY: usize = 64;
    pub const MAX_CLAIM_ATTEMPTS: u32 = 5;
    pub const BRIDGE_QUEUE_CAPACITY: usize = 1_024;
    pub const SWEEP_INTERVAL_SECONDS: u64 = 300;
    pub const IDLE_UAID_EXPIRY_DAYS: u64 = 60;
    pub const LISTEN_ADDRESS: &str = "0.0.0.0:8080";
    pub const ENDPOINT_BASE_URL: &str = "http://localhost:8082/wpush";
}
