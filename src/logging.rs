//! # Structured Logging
//!
//! Environment-aware `tracing` setup plus a few domain helpers that emit
//! the relay's recurring events with consistent field names.

use crate::models::Uaid;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global subscriber once per process.
///
/// `RUST_LOG` takes precedence; otherwise the level follows `RELAY_ENV`.
/// `RELAY_LOG_FORMAT=json` switches to JSON lines.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var("RELAY_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_ansi(std::io::stdout().is_terminal())
                .with_filter(filter)
                .boxed()
        };

        // Embedding hosts may already have installed a subscriber.
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("RELAY_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Short, stable digest of a UAID for log lines.
pub fn uaid_hash(uaid: &Uaid) -> String {
    let mut hasher = DefaultHasher::new();
    uaid.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Counters collected over one session's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub direct_acked: u64,
    pub direct_storage: u64,
    pub stored_retrieved: u64,
    pub stored_acked: u64,
    pub nacks: u64,
    pub registers: u64,
    pub unregisters: u64,
}

/// One event per closed session.
pub fn log_session_summary(
    uaid: Option<&Uaid>,
    close_reason: &str,
    duration_ms: u64,
    summary: &SessionSummary,
) {
    tracing::info!(
        uaid_hash = uaid.map(uaid_hash).as_deref(),
        close_reason,
        duration_ms,
        direct_acked = summary.direct_acked,
        direct_storage = summary.direct_storage,
        stored_retrieved = summary.stored_retrieved,
        stored_acked = summary.stored_acked,
        nacks = summary.nacks,
        registers = summary.registers,
        unregisters = summary.unregisters,
        "SESSION_SUMMARY"
    );
}

/// Claim decisions are the most useful trail when debugging hand-off.
pub fn log_claim_outcome(uaid: &Uaid, node_id: &str, outcome: &str, version: Option<u64>) {
    tracing::debug!(
        uaid_hash = %uaid_hash(uaid),
        node_id,
        outcome,
        version,
        "CLAIM"
    );
}
