use super::{ClaimVersion, NodeId, Uaid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Address of a client on an external push gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BridgeTarget {
    /// Gateway kind, used to pick the adapter (e.g. `"fcm"`, `"apns"`).
    pub gateway: String,
    /// Gateway-specific device address.
    pub token: String,
}

impl BridgeTarget {
    pub fn new(gateway: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRegistration {
    pub target: BridgeTarget,
    /// Cleared when the gateway reports the target as permanently gone.
    pub valid: bool,
}

/// Where a notification for a UAID should go right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A node holds a fresh claim.
    Node(NodeId),
    /// No live owner, but the client can be woken through a gateway.
    Bridged(BridgeTarget),
    /// Nothing to do beyond storing.
    Unrouted,
}

/// Durable ownership record, one per UAID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterRecord {
    pub uaid: Uaid,
    /// Node holding the claim. `None` once released.
    pub owner: Option<NodeId>,
    pub version: ClaimVersion,
    pub last_seen: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub bridge: Option<BridgeRegistration>,
}

impl RouterRecord {
    pub fn new(uaid: Uaid, now: DateTime<Utc>) -> Self {
        Self {
            uaid,
            owner: None,
            version: ClaimVersion::UNCLAIMED,
            last_seen: now,
            connected_at: None,
            created_at: now,
            bridge: None,
        }
    }

    /// Whether the owner (if any) refreshed within the staleness window.
    pub fn has_fresh_owner(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        self.owner.is_some() && !is_stale(self.last_seen, now, staleness)
    }

    pub fn route(&self, now: DateTime<Utc>, staleness: Duration) -> Route {
        if self.has_fresh_owner(now, staleness) {
            if let Some(owner) = &self.owner {
                return Route::Node(owner.clone());
            }
        }
        match &self.bridge {
            Some(reg) if reg.valid => Route::Bridged(reg.target.clone()),
            _ => Route::Unrouted,
        }
    }

    pub fn is_owned_by(&self, node_id: &NodeId, version: ClaimVersion) -> bool {
        self.owner.as_ref() == Some(node_id) && self.version == version
    }
}

/// `last_seen` older than `staleness` at `now`.
pub fn is_stale(last_seen: DateTime<Utc>, now: DateTime<Utc>, staleness: Duration) -> bool {
    let window = chrono::Duration::from_std(staleness).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(last_seen) >= window
}
