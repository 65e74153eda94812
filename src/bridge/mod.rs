//! # Bridge Adapters
//!
//! Contract for waking a client through an external push gateway when it
//! has no live session. Adapters only trigger a wake-up; the client then
//! reconnects and reads its backlog from the notification store like any
//! other client.

pub mod dispatcher;

pub use dispatcher::{BridgeDispatcher, BridgeJob, BridgeStats, BridgeWorker};

use crate::models::{BridgeTarget, ChannelId, SortKey, Uaid};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque hint handed to gateways alongside the wake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeHint {
    pub channel_id: ChannelId,
    pub sort_key: SortKey,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    Delivered,
    /// Temporary gateway trouble; try again later.
    Retry { reason: String },
    /// The target is gone for good; its registration should be invalidated.
    PermanentFailure { reason: String },
}

#[async_trait]
pub trait BridgeAdapter: Send + Sync + 'static {
    /// Gateway kind this adapter serves, matched against
    /// [`BridgeTarget::gateway`].
    fn gateway(&self) -> &str;

    async fn notify_bridge(&self, uaid: &Uaid, target: &BridgeTarget, hint: &WakeHint)
        -> BridgeOutcome;
}

/// Adapters keyed by gateway kind.
#[derive(Default, Clone)]
pub struct BridgeRegistry {
    adapters: HashMap<String, Arc<dyn BridgeAdapter>>,
}

impl std::fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRegistry")
            .field("gateways", &self.gateways())
            .finish()
    }
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn BridgeAdapter>) {
        self.adapters.insert(adapter.gateway().to_string(), adapter);
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn BridgeAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, gateway: &str) -> Option<Arc<dyn BridgeAdapter>> {
        self.adapters.get(gateway).cloned()
    }

    pub fn gateways(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
