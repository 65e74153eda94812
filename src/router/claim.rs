//! Claim evaluation
//!
//! The durable router record is the only authority on ownership. Backends
//! read the record, evaluate the claim here, and then write conditionally on
//! the version they read, so two nodes racing from the same starting version
//! cannot both win.

use crate::models::{ClaimVersion, NodeId, RouterRecord};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    /// Write the claim with this version, conditional on the read version.
    Proceed {
        new_version: ClaimVersion,
        read_version: ClaimVersion,
    },
    /// A fresh claim held elsewhere (or a newer one) wins.
    Conflict { holder: Option<NodeId> },
}

/// Decide whether `node_id` may claim the record it read as `current`.
///
/// The claim is rejected when the current holder refreshed within the
/// staleness window and either is a different node or holds a newer version
/// than the claimant expected. Otherwise the claim proceeds one version past
/// the stored one; a missing record counts as version zero.
pub fn evaluate_claim(
    current: Option<&RouterRecord>,
    node_id: &NodeId,
    expected_version: ClaimVersion,
    now: DateTime<Utc>,
    staleness: Duration,
) -> ClaimDecision {
    let Some(record) = current else {
        return ClaimDecision::Proceed {
            new_version: ClaimVersion::UNCLAIMED.next(),
            read_version: ClaimVersion::UNCLAIMED,
        };
    };

    if record.has_fresh_owner(now, staleness) {
        let same_holder = record.owner.as_ref() == Some(node_id);
        if !same_holder || expected_version < record.version {
            return ClaimDecision::Conflict {
                holder: record.owner.clone(),
            };
        }
    }

    ClaimDecision::Proceed {
        new_version: record.version.next(),
        read_version: record.version,
    }
}

/// Apply a successful claim decision to an in-memory copy of the record.
pub fn apply_claim(
    record: &mut RouterRecord,
    node_id: &NodeId,
    version: ClaimVersion,
    now: DateTime<Utc>,
) {
    record.owner = Some(node_id.clone());
    record.version = version;
    record.last_seen = now;
    record.connected_at = Some(now);
}
