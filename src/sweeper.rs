//! # Expiry Sweeper
//!
//! Background service that deletes expired notifications and retires UAIDs
//! nobody has connected with for a long time. Fetching already hides
//! expired entries, so the sweep reclaims space and is not needed for
//! correctness.
//!
//! ```toml
//! [sweeper]
//! enabled = true
//! interval_seconds = 300
//! idle_uaid_expiry_days = 60
//! idle_batch_size = 500
//! ```

use crate::config::SweeperConfig;
use crate::error::StorageResult;
use crate::logging::uaid_hash;
use crate::router::RouterDirectory;
use crate::store::NotificationStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one cycle removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_notifications: usize,
    pub idle_uaids_dropped: usize,
}

pub struct ExpirySweeper {
    store: Arc<dyn NotificationStore>,
    router: Arc<dyn RouterDirectory>,
    config: SweeperConfig,
}

impl std::fmt::Debug for ExpirySweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirySweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExpirySweeper {
    #[must_use]
    pub fn new(
        store: Arc<dyn NotificationStore>,
        router: Arc<dyn RouterDirectory>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            router,
            config,
        }
    }

    /// Sweep on every interval tick until shutdown. A failed cycle is logged
    /// and the next tick tries again.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut timer = interval(self.config.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_seconds = self.config.interval_seconds,
            idle_uaid_expiry_days = self.config.idle_uaid_expiry_days,
            "Starting expiry sweeper"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = timer.tick() => {
                    let started = std::time::Instant::now();
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if report == SweepReport::default() => {
                            debug!("Nothing to sweep this cycle");
                        }
                        Ok(report) => info!(
                            expired_notifications = report.expired_notifications,
                            idle_uaids_dropped = report.idle_uaids_dropped,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "Sweep completed"
                        ),
                        Err(e) => error!(error = %e, "Sweep cycle failed"),
                    }
                }
            }
        }
        info!("Expiry sweeper stopped");
    }

    /// One cycle as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> StorageResult<SweepReport> {
        let expired_notifications = self.store.expire_sweep(now).await?;

        let cutoff = chrono::Duration::from_std(self.config.idle_expiry())
            .ok()
            .and_then(|expiry| now.checked_sub_signed(expiry))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let idle = self
            .router
            .idle_uaids(cutoff, self.config.idle_batch_size)
            .await?;

        let mut idle_uaids_dropped = 0;
        for uaid in idle {
            // Router first: a client arriving mid-drop is treated as unknown.
            match self.router.drop_idle_uaid(&uaid, cutoff).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(uaid_hash = %uaid_hash(&uaid), "UAID became active before drop");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to drop idle router record");
                    continue;
                }
            }
            if let Err(e) = self.store.drop_uaid(&uaid).await {
                warn!(error = %e, "Failed to drop idle notification partition");
                continue;
            }
            idle_uaids_dropped += 1;
        }

        Ok(SweepReport {
            expired_notifications,
            idle_uaids_dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayResult;
    use crate::models::{
        BridgeTarget, ChannelId, ClaimVersion, NewNotification, NodeId, RouterRecord, Uaid,
    };
    use crate::router::InMemoryRouterDirectory;
    use async_trait::async_trait;
    use crate::store::InMemoryNotificationStore;
    use std::time::Duration;

    fn sweeper() -> (
        ExpirySweeper,
        Arc<InMemoryNotificationStore>,
        Arc<InMemoryRouterDirectory>,
    ) {
        let store = Arc::new(InMemoryNotificationStore::new());
        let router = Arc::new(InMemoryRouterDirectory::new(Duration::from_secs(60)));
        let config = SweeperConfig {
            idle_uaid_expiry_days: 1,
            ..SweeperConfig::default()
        };
        (
            ExpirySweeper::new(store.clone(), router.clone(), config),
            store,
            router,
        )
    }

    #[tokio::test]
    async fn expired_notifications_are_removed() {
        let (sweeper, store, _) = sweeper();
        let uaid = Uaid::new();
        let channel = ChannelId::new();
        store
            .append(NewNotification::new(uaid, channel, b"gone".to_vec(), 0))
            .await
            .unwrap();
        store
            .append(NewNotification::new(uaid, channel, b"kept".to_vec(), 3_600))
            .await
            .unwrap();

        let report = sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.expired_notifications, 1);
        assert_eq!(store.stored_count(&uaid), 1);
    }

    #[tokio::test]
    async fn only_released_long_idle_uaids_are_dropped() {
        let (sweeper, store, router) = sweeper();
        let node = NodeId::from("node-a");
        let (idle, connected, recent) = (Uaid::new(), Uaid::new(), Uaid::new());

        for uaid in [idle, connected, recent] {
            let version = router.claim(&uaid, &node, Default::default()).await.unwrap();
            if uaid != connected {
                router.release(&uaid, version).await.unwrap();
            }
            store
                .append(NewNotification::new(uaid, ChannelId::new(), Vec::new(), 3_600))
                .await
                .unwrap();
        }
        router.backdate_last_seen(&idle, Duration::from_secs(3 * 86_400));
        router.backdate_last_seen(&connected, Duration::from_secs(3 * 86_400));

        let report = sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.idle_uaids_dropped, 1);
        assert!(router.lookup(&idle).await.unwrap().is_none());
        assert_eq!(store.stored_count(&idle), 0);
        assert!(router.lookup(&connected).await.unwrap().is_some());
        assert!(router.lookup(&recent).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (sweeper, _, _) = sweeper();
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(sweeper.run(rx));
        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    /// Router whose idle scan is immediately followed by a client reconnect.
    struct ReconnectAfterScan {
        inner: Arc<InMemoryRouterDirectory>,
        node: NodeId,
    }

    #[async_trait]
    impl RouterDirectory for ReconnectAfterScan {
        async fn lookup(&self, uaid: &Uaid) -> StorageResult<Option<RouterRecord>> {
            self.inner.lookup(uaid).await
        }

        async fn claim(
            &self,
            uaid: &Uaid,
            node_id: &NodeId,
            expected_version: ClaimVersion,
        ) -> RelayResult<ClaimVersion> {
            self.inner.claim(uaid, node_id, expected_version).await
        }

        async fn release(&self, uaid: &Uaid, version: ClaimVersion) -> StorageResult<bool> {
            self.inner.release(uaid, version).await
        }

        async fn refresh(
            &self,
            uaid: &Uaid,
            node_id: &NodeId,
            version: ClaimVersion,
        ) -> RelayResult<()> {
            self.inner.refresh(uaid, node_id, version).await
        }

        async fn register_bridge(&self, uaid: &Uaid, target: BridgeTarget) -> StorageResult<()> {
            self.inner.register_bridge(uaid, target).await
        }

        async fn invalidate_bridge(
            &self,
            uaid: &Uaid,
            target: &BridgeTarget,
        ) -> StorageResult<bool> {
            self.inner.invalidate_bridge(uaid, target).await
        }

        async fn idle_uaids(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> StorageResult<Vec<Uaid>> {
            let idle = self.inner.idle_uaids(cutoff, limit).await?;
            for uaid in &idle {
                let version = self.inner.lookup(uaid).await?.map(|r| r.version);
                self.inner
                    .claim(uaid, &self.node, version.unwrap_or_default())
                    .await
                    .unwrap();
            }
            Ok(idle)
        }

        async fn drop_idle_uaid(&self, uaid: &Uaid, cutoff: DateTime<Utc>) -> StorageResult<bool> {
            self.inner.drop_idle_uaid(uaid, cutoff).await
        }

        async fn drop_uaid(&self, uaid: &Uaid) -> StorageResult<()> {
            self.inner.drop_uaid(uaid).await
        }

        fn staleness_threshold(&self) -> Duration {
            self.inner.staleness_threshold()
        }
    }

    #[tokio::test]
    async fn uaid_reclaimed_after_scan_is_kept() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let inner = Arc::new(InMemoryRouterDirectory::new(Duration::from_secs(60)));
        let uaid = Uaid::new();
        let channel = ChannelId::new();

        let version = inner.claim(&uaid, &NodeId::from("node-a"), ClaimVersion(0)).await.unwrap();
        inner.release(&uaid, version).await.unwrap();
        inner.backdate_last_seen(&uaid, Duration::from_secs(3 * 86_400));
        store.add_channel(&uaid, &channel).await.unwrap();

        let router = Arc::new(ReconnectAfterScan {
            inner: inner.clone(),
            node: NodeId::from("late"),
        });
        let config = SweeperConfig {
            idle_uaid_expiry_days: 1,
            ..SweeperConfig::default()
        };
        let sweeper = ExpirySweeper::new(store.clone(), router, config);

        let report = sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.idle_uaids_dropped, 0);

        let record = inner.lookup(&uaid).await.unwrap().unwrap();
        assert_eq!(record.owner, Some(NodeId::from("late")));
        assert_eq!(store.channels(&uaid).await.unwrap(), vec![channel]);
    }
}
