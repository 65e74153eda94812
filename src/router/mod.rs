//! # Router Directory
//!
//! Durable `UAID -> owner` mapping with versioned, optimistic claims. A
//! claim that is not refreshed within the staleness threshold becomes
//! eligible for takeover, which is how crashed nodes are recovered from.

pub mod claim;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use claim::{evaluate_claim, ClaimDecision};
pub use memory::InMemoryRouterDirectory;

use crate::error::{RelayResult, StorageResult};
use crate::models::{BridgeTarget, ClaimVersion, NodeId, RouterRecord, Uaid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[async_trait]
pub trait RouterDirectory: Send + Sync + 'static {
    async fn lookup(&self, uaid: &Uaid) -> StorageResult<Option<RouterRecord>>;

    /// Take ownership of `uaid` for `node_id`.
    ///
    /// Fails with [`RelayError::OwnershipConflict`](crate::error::RelayError)
    /// when another node holds a fresh claim, or when a newer claim exists
    /// than `expected_version`.
    async fn claim(
        &self,
        uaid: &Uaid,
        node_id: &NodeId,
        expected_version: ClaimVersion,
    ) -> RelayResult<ClaimVersion>;

    /// Give up the claim identified by `version`. Returns `false` when that
    /// claim is no longer current, in which case nothing changes.
    async fn release(&self, uaid: &Uaid, version: ClaimVersion) -> StorageResult<bool>;

    /// Bump `last_seen` on a claim this node still holds.
    async fn refresh(&self, uaid: &Uaid, node_id: &NodeId, version: ClaimVersion)
        -> RelayResult<()>;

    /// Record (or replace) the gateway address used to wake this client.
    async fn register_bridge(&self, uaid: &Uaid, target: BridgeTarget) -> StorageResult<()>;

    /// Mark the bridge registration invalid if it still points at `target`.
    async fn invalidate_bridge(&self, uaid: &Uaid, target: &BridgeTarget) -> StorageResult<bool>;

    /// Unowned UAIDs whose `last_seen` is older than `cutoff`.
    async fn idle_uaids(&self, cutoff: DateTime<Utc>, limit: usize) -> StorageResult<Vec<Uaid>>;

    /// Delete the record only if it is still unowned and idle since before
    /// `cutoff`. Returns `false` when a client came back in the meantime.
    async fn drop_idle_uaid(&self, uaid: &Uaid, cutoff: DateTime<Utc>) -> StorageResult<bool>;

    async fn drop_uaid(&self, uaid: &Uaid) -> StorageResult<()>;

    /// Window after which an unrefreshed claim may be taken over.
    fn staleness_threshold(&self) -> Duration;
}
