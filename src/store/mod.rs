//! # Notification Store
//!
//! Durable, per-UAID partitioned storage for queued notifications and the
//! channel set of each UAID.
//!
//! ## Ordering contract
//!
//! `append` assigns a sort key strictly greater than any key previously
//! assigned for the same UAID, and commits the entry in the same atomic unit
//! as the key assignment. Readers therefore never observe key `n + 1` without
//! key `n` (unless `n` was acknowledged or expired), which lets sessions read
//! forward from a cursor without gaps.
//!
//! ## Backends
//!
//! - [`InMemoryNotificationStore`]: process-local, shared by every simulated
//!   node in the same process.
//! - [`postgres::PgNotificationStore`]: PostgreSQL via `sqlx` (feature
//!   `postgres`).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryNotificationStore;

use crate::error::StorageResult;
use crate::models::{ChannelId, NewNotification, Notification, SortKey, Uaid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

#[async_trait]
pub trait NotificationStore: Send + Sync + 'static {
    /// Persist a notification and return it with its assigned sort key.
    async fn append(&self, notification: NewNotification) -> StorageResult<Notification>;

    /// Live, unacknowledged entries with a key greater than `after`, in
    /// ascending key order, at most `limit` of them.
    async fn fetch_after(
        &self,
        uaid: &Uaid,
        after: Option<SortKey>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Notification>>;

    /// Entire live backlog in key order.
    async fn fetch_backlog(&self, uaid: &Uaid) -> StorageResult<Vec<Notification>> {
        self.fetch_after(uaid, None, None).await
    }

    /// Remove an entry. Acknowledging an absent entry is a no-op.
    async fn ack(&self, uaid: &Uaid, sort_key: SortKey) -> StorageResult<()>;

    /// Delete every entry expired at `now`; returns how many were removed.
    async fn expire_sweep(&self, now: DateTime<Utc>) -> StorageResult<usize>;

    /// Record a channel subscription. Returns `false` if it already existed.
    async fn add_channel(&self, uaid: &Uaid, channel_id: &ChannelId) -> StorageResult<bool>;

    /// Delete a channel and its queued notifications. Returns `false` if the
    /// channel was unknown.
    async fn remove_channel(&self, uaid: &Uaid, channel_id: &ChannelId) -> StorageResult<bool>;

    async fn channels(&self, uaid: &Uaid) -> StorageResult<Vec<ChannelId>>;

    async fn has_channel(&self, uaid: &Uaid, channel_id: &ChannelId) -> StorageResult<bool>;

    /// Delete every channel and notification of a UAID.
    async fn drop_uaid(&self, uaid: &Uaid) -> StorageResult<()>;

    /// Best-effort stream of UAIDs that just received an append, from any
    /// node sharing this store.
    fn watch_appends(&self) -> broadcast::Receiver<Uaid>;
}
