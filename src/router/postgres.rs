//! PostgreSQL router directory.
//!
//! Claims use read, evaluate, then `UPDATE ... WHERE version = <read>`. Zero
//! affected rows means another node wrote first; the loop re-reads and
//! re-evaluates, up to `max_claim_attempts` times.

use super::claim::{evaluate_claim, ClaimDecision};
use super::RouterDirectory;
use crate::error::{RelayError, RelayResult, StorageError, StorageResult};
use crate::logging::log_claim_outcome;
use crate::models::{BridgeRegistration, BridgeTarget, ClaimVersion, NodeId, RouterRecord, Uaid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const SELECT_RECORD: &str = "SELECT uaid, owner, version, last_seen, connected_at, created_at,
        bridge_gateway, bridge_token, bridge_valid
   FROM relay_router WHERE uaid = $1";

fn version_to_db(version: ClaimVersion) -> i64 {
    i64::try_from(version.value()).unwrap_or(i64::MAX)
}

fn row_to_record(row: &PgRow) -> Result<RouterRecord, sqlx::Error> {
    let version: i64 = row.try_get("version")?;
    let owner: Option<String> = row.try_get("owner")?;
    let gateway: Option<String> = row.try_get("bridge_gateway")?;
    let token: Option<String> = row.try_get("bridge_token")?;
    let bridge = match (gateway, token) {
        (Some(gateway), Some(token)) => Some(BridgeRegistration {
            target: BridgeTarget::new(gateway, token),
            valid: row.try_get("bridge_valid")?,
        }),
        _ => None,
    };
    Ok(RouterRecord {
        uaid: Uaid::from_uuid(row.try_get("uaid")?),
        owner: owner.map(NodeId::new),
        version: ClaimVersion(u64::try_from(version).unwrap_or(0)),
        last_seen: row.try_get("last_seen")?,
        connected_at: row.try_get("connected_at")?,
        created_at: row.try_get("created_at")?,
        bridge,
    })
}

#[derive(Debug, Clone)]
pub struct PgRouterDirectory {
    pool: PgPool,
    staleness: Duration,
    max_claim_attempts: u32,
}

impl PgRouterDirectory {
    pub fn new(pool: PgPool, staleness: Duration, max_claim_attempts: u32) -> Self {
        Self {
            pool,
            staleness,
            max_claim_attempts: max_claim_attempts.max(1),
        }
    }

    async fn write_claim(
        &self,
        uaid: &Uaid,
        node_id: &NodeId,
        new_version: ClaimVersion,
        read_version: ClaimVersion,
        record_exists: bool,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let result = if record_exists {
            sqlx::query(
                "UPDATE relay_router
                    SET owner = $2, version = $3, last_seen = $4, connected_at = $4
                  WHERE uaid = $1 AND version = $5",
            )
            .bind(uaid.as_uuid())
            .bind(node_id.as_str())
            .bind(version_to_db(new_version))
            .bind(now)
            .bind(version_to_db(read_version))
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "INSERT INTO relay_router
                    (uaid, owner, version, last_seen, connected_at, created_at)
                 VALUES ($1, $2, $3, $4, $4, $4)
                 ON CONFLICT (uaid) DO NOTHING",
            )
            .bind(uaid.as_uuid())
            .bind(node_id.as_str())
            .bind(version_to_db(new_version))
            .bind(now)
            .execute(&self.pool)
            .await
        };
        let result = result.map_err(|e| StorageError::from_sqlx("claim", e))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RouterDirectory for PgRouterDirectory {
    async fn lookup(&self, uaid: &Uaid) -> StorageResult<Option<RouterRecord>> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(uaid.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx("lookup", e))?;
        row.as_ref()
            .map(row_to_record)
            .transpose()
            .map_err(|e| StorageError::from_sqlx("lookup", e))
    }

    async fn claim(
        &self,
        uaid: &Uaid,
        node_id: &NodeId,
        expected_version: ClaimVersion,
    ) -> RelayResult<ClaimVersion> {
        for attempt in 1..=self.max_claim_attempts {
            let current = self.lookup(uaid).await?;
            let now = Utc::now();
            match evaluate_claim(current.as_ref(), node_id, expected_version, now, self.staleness) {
                ClaimDecision::Conflict { holder } => {
                    log_claim_outcome(uaid, node_id.as_str(), "conflict", None);
                    return Err(RelayError::ownership_conflict(*uaid, holder));
                }
                ClaimDecision::Proceed {
                    new_version,
                    read_version,
                } => {
                    let written = self
                        .write_claim(
                            uaid,
                            node_id,
                            new_version,
                            read_version,
                            current.is_some(),
                            now,
                        )
                        .await?;
                    if written {
                        log_claim_outcome(
                            uaid,
                            node_id.as_str(),
                            "claimed",
                            Some(new_version.value()),
                        );
                        return Ok(new_version);
                    }
                    debug!(attempt, "Claim write lost a race, re-reading router record");
                }
            }
        }
        Err(StorageError::transient("claim", "router record kept changing under contention").into())
    }

    async fn release(&self, uaid: &Uaid, version: ClaimVersion) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE relay_router
                SET owner = NULL, version = version + 1, last_seen = NOW()
              WHERE uaid = $1 AND version = $2 AND owner IS NOT NULL",
        )
        .bind(uaid.as_uuid())
        .bind(version_to_db(version))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("release", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn refresh(
        &self,
        uaid: &Uaid,
        node_id: &NodeId,
        version: ClaimVersion,
    ) -> RelayResult<()> {
        let result = sqlx::query(
            "UPDATE relay_router SET last_seen = NOW()
              WHERE uaid = $1 AND owner = $2 AND version = $3",
        )
        .bind(uaid.as_uuid())
        .bind(node_id.as_str())
        .bind(version_to_db(version))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("refresh", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let holder = self.lookup(uaid).await?.and_then(|r| r.owner);
        Err(RelayError::ownership_conflict(*uaid, holder))
    }

    async fn register_bridge(&self, uaid: &Uaid, target: BridgeTarget) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO relay_router
                (uaid, owner, version, last_seen, created_at,
                 bridge_gateway, bridge_token, bridge_valid)
             VALUES ($1, NULL, 0, NOW(), NOW(), $2, $3, TRUE)
             ON CONFLICT (uaid) DO UPDATE
                SET bridge_gateway = EXCLUDED.bridge_gateway,
                    bridge_token = EXCLUDED.bridge_token,
                    bridge_valid = TRUE",
        )
        .bind(uaid.as_uuid())
        .bind(&target.gateway)
        .bind(&target.token)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("register_bridge", e))?;
        Ok(())
    }

    async fn invalidate_bridge(&self, uaid: &Uaid, target: &BridgeTarget) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE relay_router SET bridge_valid = FALSE
              WHERE uaid = $1 AND bridge_gateway = $2 AND bridge_token = $3 AND bridge_valid",
        )
        .bind(uaid.as_uuid())
        .bind(&target.gateway)
        .bind(&target.token)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("invalidate_bridge", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn idle_uaids(&self, cutoff: DateTime<Utc>, limit: usize) -> StorageResult<Vec<Uaid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT uaid FROM relay_router
              WHERE owner IS NULL AND last_seen < $1
              ORDER BY last_seen ASC
              LIMIT $2",
        )
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("idle_uaids", e))?;
        Ok(ids.into_iter().map(Uaid::from_uuid).collect())
    }

    async fn drop_idle_uaid(&self, uaid: &Uaid, cutoff: DateTime<Utc>) -> StorageResult<bool> {
        let result = sqlx::query(
            "DELETE FROM relay_router
              WHERE uaid = $1 AND owner IS NULL AND last_seen < $2",
        )
        .bind(uaid.as_uuid())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx("drop_idle_uaid", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn drop_uaid(&self, uaid: &Uaid) -> StorageResult<()> {
        sqlx::query("DELETE FROM relay_router WHERE uaid = $1")
            .bind(uaid.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx("drop_uaid", e))?;
        Ok(())
    }

    fn staleness_threshold(&self) -> Duration {
        self.staleness
    }
}
