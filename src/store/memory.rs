//! # In-Memory Notification Store
//!
//! Each UAID owns a partition behind its own lock. Key assignment and the
//! entry insert happen under that lock, which plays the role of the
//! conditional increment-and-write primitive of a durable store.

use super::NotificationStore;
use crate::error::{StorageError, StorageResult};
use crate::models::{ChannelId, NewNotification, Notification, SortKey, Uaid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const APPEND_SIGNAL_CAPACITY: usize = 1_024;

#[derive(Debug, Default)]
struct Partition {
    last_sort_key: u64,
    entries: BTreeMap<SortKey, Notification>,
    channels: BTreeSet<ChannelId>,
}

/// Failures to inject into the next operations, for exercising error paths.
#[derive(Debug, Default)]
struct FailurePlan {
    transient_appends: AtomicU32,
    permanent_appends: AtomicU32,
    transient_reads: AtomicU32,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug)]
pub struct InMemoryNotificationStore {
    partitions: DashMap<Uaid, Arc<Mutex<Partition>>>,
    appends: broadcast::Sender<Uaid>,
    failures: FailurePlan,
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        let (appends, _) = broadcast::channel(APPEND_SIGNAL_CAPACITY);
        Self {
            partitions: DashMap::new(),
            appends,
            failures: FailurePlan::default(),
        }
    }

    /// Make the next `count` appends fail with a transient error.
    pub fn fail_next_appends(&self, count: u32) {
        self.failures.transient_appends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` appends fail with a permanent error.
    pub fn fail_next_appends_permanently(&self, count: u32) {
        self.failures.permanent_appends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` fetches fail with a transient error.
    pub fn fail_next_reads(&self, count: u32) {
        self.failures.transient_reads.store(count, Ordering::SeqCst);
    }

    /// Total stored entries, expired ones included.
    pub fn stored_count(&self, uaid: &Uaid) -> usize {
        self.partitions
            .get(uaid)
            .map(|p| p.lock().entries.len())
            .unwrap_or(0)
    }

    fn partition(&self, uaid: &Uaid) -> Arc<Mutex<Partition>> {
        self.partitions.entry(*uaid).or_default().clone()
    }

    fn existing_partition(&self, uaid: &Uaid) -> Option<Arc<Mutex<Partition>>> {
        self.partitions.get(uaid).map(|p| p.clone())
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn append(&self, notification: NewNotification) -> StorageResult<Notification> {
        if take_one(&self.failures.transient_appends) {
            return Err(StorageError::transient("append", "injected transient failure"));
        }
        if take_one(&self.failures.permanent_appends) {
            return Err(StorageError::permanent("append", "injected permanent failure"));
        }

        let uaid = notification.uaid;
        let partition = self.partition(&uaid);
        let stored = {
            let mut guard = partition.lock();
            guard.last_sort_key += 1;
            let stored = notification.into_stored(SortKey(guard.last_sort_key), Utc::now());
            guard.entries.insert(stored.sort_key, stored.clone());
            stored
        };

        trace!(sort_key = %stored.sort_key, "Notification appended");
        // No receivers is fine; sessions also poll.
        let _ = self.appends.send(uaid);
        Ok(stored)
    }

    async fn fetch_after(
        &self,
        uaid: &Uaid,
        after: Option<SortKey>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Notification>> {
        if take_one(&self.failures.transient_reads) {
            return Err(StorageError::transient("fetch", "injected transient failure"));
        }
        let Some(partition) = self.existing_partition(uaid) else {
            return Ok(Vec::new());
        };

        let now = Utc::now();
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let guard = partition.lock();
        Ok(guard
            .entries
            .range((lower, Bound::Unbounded))
            .map(|(_, n)| n)
            .filter(|n| !n.is_expired(now))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn ack(&self, uaid: &Uaid, sort_key: SortKey) -> StorageResult<()> {
        if let Some(partition) = self.existing_partition(uaid) {
            partition.lock().entries.remove(&sort_key);
        }
        Ok(())
    }

    async fn expire_sweep(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let partitions: Vec<_> = self.partitions.iter().map(|e| e.value().clone()).collect();
        let mut removed = 0;
        for partition in partitions {
            let mut guard = partition.lock();
            let before = guard.entries.len();
            guard.entries.retain(|_, n| !n.is_expired(now));
            removed += before - guard.entries.len();
        }
        Ok(removed)
    }

    async fn add_channel(&self, uaid: &Uaid, channel_id: &ChannelId) -> StorageResult<bool> {
        Ok(self.partition(uaid).lock().channels.insert(*channel_id))
    }

    async fn remove_channel(&self, uaid: &Uaid, channel_id: &ChannelId) -> StorageResult<bool> {
        let Some(partition) = self.existing_partition(uaid) else {
            return Ok(false);
        };
        let mut guard = partition.lock();
        let existed = guard.channels.remove(channel_id);
        guard.entries.retain(|_, n| n.channel_id != *channel_id);
        Ok(existed)
    }

    async fn channels(&self, uaid: &Uaid) -> StorageResult<Vec<ChannelId>> {
        Ok(self
            .existing_partition(uaid)
            .map(|p| p.lock().channels.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn has_channel(&self, uaid: &Uaid, channel_id: &ChannelId) -> StorageResult<bool> {
        Ok(self
            .existing_partition(uaid)
            .is_some_and(|p| p.lock().channels.contains(channel_id)))
    }

    async fn drop_uaid(&self, uaid: &Uaid) -> StorageResult<()> {
        self.partitions.remove(uaid);
        Ok(())
    }

    fn watch_appends(&self) -> broadcast::Receiver<Uaid> {
        self.appends.subscribe()
    }
}
