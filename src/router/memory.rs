//! In-memory router directory. The `DashMap` entry lock makes read,
//! evaluate and write one atomic step per UAID.

use super::claim::{apply_claim, evaluate_claim, ClaimDecision};
use super::RouterDirectory;
use crate::error::{RelayError, RelayResult, StorageError, StorageResult};
use crate::logging::log_claim_outcome;
use crate::models::{BridgeRegistration, BridgeTarget, ClaimVersion, NodeId, RouterRecord, Uaid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct InMemoryRouterDirectory {
    records: DashMap<Uaid, RouterRecord>,
    staleness: Duration,
    failing_claims: AtomicU32,
    failing_refreshes: AtomicU32,
}

impl InMemoryRouterDirectory {
    pub fn new(staleness: Duration) -> Self {
        Self {
            records: DashMap::new(),
            staleness,
            failing_claims: AtomicU32::new(0),
            failing_refreshes: AtomicU32::new(0),
        }
    }

    /// Make the next `count` claims fail with a transient storage error.
    pub fn fail_next_claims(&self, count: u32) {
        self.failing_claims.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` refreshes fail with a transient storage error.
    pub fn fail_next_refreshes(&self, count: u32) {
        self.failing_refreshes.store(count, Ordering::SeqCst);
    }

    /// Move `last_seen` into the past, simulating an owner that stopped
    /// refreshing.
    pub fn backdate_last_seen(&self, uaid: &Uaid, by: Duration) {
        if let Some(mut record) = self.records.get_mut(uaid) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
            record.last_seen -= by;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RouterDirectory for InMemoryRouterDirectory {
    async fn lookup(&self, uaid: &Uaid) -> StorageResult<Option<RouterRecord>> {
        Ok(self.records.get(uaid).map(|r| r.clone()))
    }

    async fn claim(
        &self,
        uaid: &Uaid,
        node_id: &NodeId,
        expected_version: ClaimVersion,
    ) -> RelayResult<ClaimVersion> {
        if take_one(&self.failing_claims) {
            return Err(StorageError::transient("claim", "injected transient failure").into());
        }

        let now = Utc::now();
        let result = match self.records.entry(*uaid) {
            Entry::Occupied(mut occupied) => match evaluate_claim(
                Some(occupied.get()),
                node_id,
                expected_version,
                now,
                self.staleness,
            ) {
                ClaimDecision::Proceed { new_version, .. } => {
                    apply_claim(occupied.get_mut(), node_id, new_version, now);
                    Ok(new_version)
                }
                ClaimDecision::Conflict { holder } => {
                    Err(RelayError::ownership_conflict(*uaid, holder))
                }
            },
            Entry::Vacant(vacant) => {
                match evaluate_claim(None, node_id, expected_version, now, self.staleness) {
                    ClaimDecision::Proceed { new_version, .. } => {
                        let mut record = RouterRecord::new(*uaid, now);
                        apply_claim(&mut record, node_id, new_version, now);
                        vacant.insert(record);
                        Ok(new_version)
                    }
                    ClaimDecision::Conflict { holder } => {
                        Err(RelayError::ownership_conflict(*uaid, holder))
                    }
                }
            }
        };

        match &result {
            Ok(version) => {
                log_claim_outcome(uaid, node_id.as_str(), "claimed", Some(version.value()))
            }
            Err(_) => log_claim_outcome(uaid, node_id.as_str(), "conflict", None),
        }
        result
    }

    async fn release(&self, uaid: &Uaid, version: ClaimVersion) -> StorageResult<bool> {
        let Some(mut record) = self.records.get_mut(uaid) else {
            return Ok(false);
        };
        if record.owner.is_none() || record.version != version {
            return Ok(false);
        }
        record.owner = None;
        record.version = version.next();
        record.last_seen = Utc::now();
        Ok(true)
    }

    async fn refresh(
        &self,
        uaid: &Uaid,
        node_id: &NodeId,
        version: ClaimVersion,
    ) -> RelayResult<()> {
        if take_one(&self.failing_refreshes) {
            return Err(StorageError::transient("refresh", "injected transient failure").into());
        }
        match self.records.get_mut(uaid) {
            Some(mut record) if record.is_owned_by(node_id, version) => {
                record.last_seen = Utc::now();
                Ok(())
            }
            Some(record) => Err(RelayError::ownership_conflict(*uaid, record.owner.clone())),
            None => Err(RelayError::ownership_conflict(*uaid, None)),
        }
    }

    async fn register_bridge(&self, uaid: &Uaid, target: BridgeTarget) -> StorageResult<()> {
        let now = Utc::now();
        self.records
            .entry(*uaid)
            .or_insert_with(|| RouterRecord::new(*uaid, now))
            .bridge = Some(BridgeRegistration {
            target,
            valid: true,
        });
        Ok(())
    }

    async fn invalidate_bridge(&self, uaid: &Uaid, target: &BridgeTarget) -> StorageResult<bool> {
        let Some(mut record) = self.records.get_mut(uaid) else {
            return Ok(false);
        };
        match record.bridge.as_mut() {
            Some(reg) if reg.target == *target && reg.valid => {
                reg.valid = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn idle_uaids(&self, cutoff: DateTime<Utc>, limit: usize) -> StorageResult<Vec<Uaid>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.owner.is_none() && r.last_seen < cutoff)
            .map(|r| r.uaid)
            .take(limit)
            .collect())
    }

    async fn drop_idle_uaid(&self, uaid: &Uaid, cutoff: DateTime<Utc>) -> StorageResult<bool> {
        Ok(self
            .records
            .remove_if(uaid, |_, r| r.owner.is_none() && r.last_seen < cutoff)
            .is_some())
    }

    async fn drop_uaid(&self, uaid: &Uaid) -> StorageResult<()> {
        self.records.remove(uaid);
        Ok(())
    }

    fn staleness_threshold(&self) -> Duration {
        self.staleness
    }
}
