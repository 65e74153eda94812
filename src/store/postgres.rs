//! # PostgreSQL Notification Store
//!
//! Sort keys come from a per-UAID counter row bumped with an upsert inside
//! the same transaction as the entry insert. The counter row lock serializes
//! concurrent appends for one UAID across every node, so commit order matches
//! key order. Each append also raises `pg_notify` on [`APPEND_CHANNEL`]; a
//! `PgListener` task turns those into the store's append watch stream.

use super::NotificationStore;
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::models::{ChannelId, NewNotification, Notification, SortKey, Uaid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// `LISTEN`/`NOTIFY` channel for append signals.
pub const APPEND_CHANNEL: &str = "relay_appends";

const SCHEMA: &str = include_str!("../../migrations/0001_relay_schema.sql");
const APPEND_SIGNAL_CAPACITY: usize = 4_096;
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Open a pool using the storage section of the relay config.
pub async fn connect_pool(config: &StorageConfig) -> StorageResult<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| StorageError::permanent("connect", "database_url is not set"))?;
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
        .connect(url)
        .await
        .map_err(|e| StorageError::from_sqlx("connect", e))
}

/// Create the relay tables if they are missing.
pub async fn run_migrations(pool: &PgPool) -> StorageResult<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| StorageError::from_sqlx("migrate", e))?;
    info!("Relay schema ready");
    Ok(())
}

pub(crate) fn key_to_db(key: SortKey) -> i64 {
    i64::try_from(key.value()).unwrap_or(i64::MAX)
}

fn key_from_db(raw: i64) -> SortKey {
    SortKey(u64::try_from(raw).unwrap_or(0))
}

fn row_to_notification(row: &PgRow) -> Result<Notification, sqlx::Error> {
    let ttl: i64 = row.try_get("ttl_seconds")?;
    Ok(Notification {
        uaid: Uaid::from_uuid(row.try_get("uaid")?),
        channel_id: ChannelId::from_uuid(row.try_get("channel_id")?),
        sort_key: key_from_db(row.try_get("sort_key")?),
        payload: row.try_get("payload")?,
        ttl_seconds: u64::try_from(ttl).unwrap_or(0),
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
    appends: broadcast::Sender<Uaid>,
}

impl PgNotificationStore {
    /// Wrap a pool and start forwarding append notifications.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(pool: PgPool) -> Self {
        let (appends, _) = broadcast::channel(APPEND_SIGNAL_CAPACITY);
        tokio::spawn(forward_append_signals(pool.clone(), appends.clone()));
        Self { pool, appends }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Relay `NOTIFY` payloads into the broadcast channel, reconnecting on
/// connection loss.
async fn forward_append_signals(pool: PgPool, sender: broadcast::Sender<Uaid>) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "Append listener connect failed, retrying");
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                continue;
            }
        };
        if let Err(e) = listener.listen(APPEND_CHANNEL).await {
            warn!(error = %e, "LISTEN {APPEND_CHANNEL} failed, retrying");
            tokio::time::sleep(LISTENER_RETRY_DELAY).await;
            continue;
        }
        debug!("Listening for append notifications");

        loop {
            match listener.recv().await {
                Ok(notification) => match Uuid::parse_str(notification.payload()) {
                    Ok(uuid) => {
                        let _ = sender.send(Uaid::from_uuid(uuid));
                    }
                    Err(_) => {
                        warn!(payload = notification.payload(), "Ignoring bad append payload")
                    }
                },
                Err(e) => {
                    error!(error = %e, "Append listener lost its connection");
                    break;
                }
            }
        }
        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn append(&self, notification: NewNotification) -> StorageResult<Notification> {
        let op = "append";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::from_sqlx(op, e))?;

        let next: i64 = sqlx::query_scalar(
            "INSERT INTO relay_uaid_counters (uaid, last_sort_key) VALUES ($1, 1)
             ON CONFLICT (uaid) DO UPDATE
                SET last_sort_key = relay_uaid_counters.last_sort_key + 1
             RETURNING last_sort_key",
        )
        .bind(notification.uaid.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StorageError::from_sqlx(op, e))?;

        let stored = notification.into_stored(key_from_db(next), Utc::now());
        sqlx::query(
            "INSERT INTO relay_notifications
                (uaid, sort_key, channel_id, payload, ttl_seconds, created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(stored.uaid.as_uuid())
        .bind(next)
        .bind(stored.channel_id.as_uuid())
        .bind(&stored.payload)
        .bind(i64::try_from(stored.ttl_seconds).unwrap_or(i64::MAX))
        .bind(stored.created_at)
        .bind(stored.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::from_sqlx(op, e))?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(APPEND_CHANNEL)
            .bind(stored.uaid.as_uuid().to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::from_sqlx(op, e))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::from_sqlx(op, e))?;
        Ok(stored)
    }

    async fn fetch_after(
        &self,
        uaid: &Uaid,
        after: Option<SortKey>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Notification>> {
        let limit = limit.map_or(i64::MAX, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            "SELECT uaid, sort_key, channel_id, payload, ttl_seconds, created_at, expires_at
               FROM relay_notifications
              WHERE uaid = $1 AND sort_key > $2 AND expires_at > NOW()
              ORDER BY sort_key ASC
              LIMIT $3",
        )
        .bind(uaid.as_uuid())
        .bind(after.map_or(0, key_to_db))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("fetch", e))?;

        rows.iter()
            .map(row_to_notification)
            .collect::<Result<_, _>>()
            .map_err(|e| StorageError::from_sqlx("fetch", e))
    }

    async fn ack(&self, uaid: &Uaid, sort_key: SortKey) -> StorageResult<()> {
        sqlx::query("DELETE FROM relay_notifications WHERE uaid = $1 AND sort_key = $2")
            .bind(uaid.as_uuid())
            .bind(key_to_db(sort_key))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx("ack", e))?;
        Ok(())
    }

    async fn expire_sweep(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM relay_notifications WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx("expire_sweep", e))?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn add_channel(&self, uaid: &Uaid, channel_id: &ChannelId) -> StorageResult<bool> {
        let result = sqlx::query(
            "INSERT INTO relay_channels (uaid, channel_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(uaid.as_uuid())
        .bind(channel_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("add_channel", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_channel(&self, uaid: &Uaid, channel_id: &ChannelId) -> StorageResult<bool> {
        let op = "remove_channel";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::from_sqlx(op, e))?;
        let removed = sqlx::query("DELETE FROM relay_channels WHERE uaid = $1 AND channel_id = $2")
            .bind(uaid.as_uuid())
            .bind(channel_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::from_sqlx(op, e))?;
        sqlx::query("DELETE FROM relay_notifications WHERE uaid = $1 AND channel_id = $2")
            .bind(uaid.as_uuid())
            .bind(channel_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::from_sqlx(op, e))?;
        tx.commit()
            .await
            .map_err(|e| StorageError::from_sqlx(op, e))?;
        Ok(removed.rows_affected() == 1)
    }

    async fn channels(&self, uaid: &Uaid) -> StorageResult<Vec<ChannelId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT channel_id FROM relay_channels WHERE uaid = $1 ORDER BY channel_id",
        )
        .bind(uaid.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("channels", e))?;
        Ok(ids.into_iter().map(ChannelId::from_uuid).collect())
    }

    async fn has_channel(&self, uaid: &Uaid, channel_id: &ChannelId) -> StorageResult<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM relay_channels WHERE uaid = $1 AND channel_id = $2)",
        )
        .bind(uaid.as_uuid())
        .bind(channel_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("has_channel", e))
    }

    async fn drop_uaid(&self, uaid: &Uaid) -> StorageResult<()> {
        let op = "drop_uaid";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::from_sqlx(op, e))?;
        for table in ["relay_notifications", "relay_channels", "relay_uaid_counters"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE uaid = $1"))
                .bind(uaid.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::from_sqlx(op, e))?;
        }
        tx.commit()
            .await
            .map_err(|e| StorageError::from_sqlx(op, e))
    }

    fn watch_appends(&self) -> broadcast::Receiver<Uaid> {
        self.appends.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;

    async fn test_store() -> PgNotificationStore {
        let config = StorageConfig {
            backend: StorageBackend::Postgres,
            database_url: std::env::var("DATABASE_URL").ok(),
            ..StorageConfig::default()
        };
        let pool = connect_pool(&config).await.expect("DATABASE_URL must point at postgres");
        run_migrations(&pool).await.expect("schema");
        PgNotificationStore::new(pool)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_appends_get_distinct_increasing_keys() {
        let store = test_store().await;
        let uaid = Uaid::new();
        let ch = ChannelId::new();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append(NewNotification::new(uaid, ch, vec![i], 60))
                        .await
                        .unwrap()
                        .sort_key
                })
            })
            .collect();
        let mut keys: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|k| k.unwrap())
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 16);

        let backlog = store.fetch_backlog(&uaid).await.unwrap();
        assert_eq!(backlog.iter().map(|n| n.sort_key).collect::<Vec<_>>(), keys);
        store.drop_uaid(&uaid).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn ack_twice_and_zero_ttl() {
        let store = test_store().await;
        let uaid = Uaid::new();
        let ch = ChannelId::new();
        let live = store
            .append(NewNotification::new(uaid, ch, b"a".to_vec(), 60))
            .await
            .unwrap();
        store
            .append(NewNotification::new(uaid, ch, b"b".to_vec(), 0))
            .await
            .unwrap();

        assert_eq!(store.fetch_backlog(&uaid).await.unwrap().len(), 1);
        store.ack(&uaid, live.sort_key).await.unwrap();
        store.ack(&uaid, live.sort_key).await.unwrap();
        assert!(store.fetch_backlog(&uaid).await.unwrap().is_empty());
        store.drop_uaid(&uaid).await.unwrap();
    }
}
