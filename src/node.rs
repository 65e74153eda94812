//! # Relay Node
//!
//! Wires one node together: backends, session registry, delivery pipeline,
//! bridge dispatcher, append watcher and sweeper. The node does not own a
//! listener; transports hand it accepted connections through
//! [`RelayNode::accept`].

use crate::bridge::{BridgeDispatcher, BridgeRegistry, BridgeStats, BridgeWorker};
use crate::config::{RelayConfig, StorageBackend};
use crate::delivery::{AcceptanceResult, AppendWatcher, DeliveryPipeline, SessionRegistry};
use crate::error::RelayResult;
use crate::models::{ChannelId, NodeId, Uaid};
use crate::retry::RetryPolicy;
use crate::router::{InMemoryRouterDirectory, RouterDirectory};
use crate::session::{Session, SessionContext, SessionOutcome, TemplateEndpointFactory};
use crate::store::{InMemoryNotificationStore, NotificationStore};
use crate::sweeper::ExpirySweeper;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Counts live session tasks so shutdown can wait for them to drain.
#[derive(Debug, Default)]
struct LiveSessions {
    count: AtomicUsize,
    drained: Notify,
}

struct LiveGuard(Arc<LiveSessions>);

impl LiveGuard {
    fn enter(live: &Arc<LiveSessions>) -> Self {
        live.count.fetch_add(1, Ordering::SeqCst);
        Self(live.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

pub struct RelayNode {
    config: RelayConfig,
    node_id: NodeId,
    store: Arc<dyn NotificationStore>,
    router: Arc<dyn RouterDirectory>,
    sessions: Arc<SessionRegistry>,
    pipeline: Arc<DeliveryPipeline>,
    bridge: BridgeDispatcher,
    session_ctx: Arc<SessionContext>,
    bridge_worker: Mutex<Option<BridgeWorker>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    live: Arc<LiveSessions>,
    shutdown: broadcast::Sender<()>,
}

impl std::fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNode")
            .field("node_id", &self.node_id)
            .field("live_sessions", &self.live_sessions())
            .finish_non_exhaustive()
    }
}

impl RelayNode {
    /// Build a node over the given backends.
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn NotificationStore>,
        router: Arc<dyn RouterDirectory>,
        bridges: BridgeRegistry,
    ) -> RelayResult<Self> {
        config.validate()?;

        let node_id = config.node.node_id();
        let retry = RetryPolicy::from_config(&config.retry);
        let sessions = Arc::new(SessionRegistry::new());
        let (bridge, bridge_worker) =
            BridgeDispatcher::new(&config.bridge, bridges, router.clone());

        let pipeline = Arc::new(DeliveryPipeline::new(
            node_id.clone(),
            store.clone(),
            router.clone(),
            sessions.clone(),
            bridge.clone(),
            retry.clone(),
            config.storage.max_ttl_seconds,
        ));

        let session_ctx = Arc::new(SessionContext {
            node_id: node_id.clone(),
            config: config.session.clone(),
            store: store.clone(),
            router: router.clone(),
            registry: sessions.clone(),
            retry,
            endpoints: Arc::new(TemplateEndpointFactory::new(
                config.node.endpoint_base_url.clone(),
            )),
        });

        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            config,
            node_id,
            store,
            router,
            sessions,
            pipeline,
            bridge,
            session_ctx,
            bridge_worker: Mutex::new(Some(bridge_worker)),
            background: Mutex::new(Vec::new()),
            live: Arc::new(LiveSessions::default()),
            shutdown,
        })
    }

    /// Build a node with the backends named in `config.storage`.
    pub async fn from_config(config: RelayConfig, bridges: BridgeRegistry) -> RelayResult<Self> {
        config.validate()?;
        match config.storage.backend {
            StorageBackend::Memory => {
                info!("Using in-memory storage backends");
                let store = Arc::new(InMemoryNotificationStore::new());
                let router = Arc::new(InMemoryRouterDirectory::new(
                    config.router.staleness_threshold(),
                ));
                Self::new(config, store, router, bridges)
            }
            #[cfg(feature = "postgres")]
            StorageBackend::Postgres => {
                use crate::router::postgres::PgRouterDirectory;
                use crate::store::postgres::{connect_pool, run_migrations, PgNotificationStore};

                let pool = connect_pool(&config.storage).await?;
                run_migrations(&pool).await?;
                info!(
                    max_connections = config.storage.max_connections,
                    "Using PostgreSQL storage backends"
                );
                let store = Arc::new(PgNotificationStore::new(pool.clone()));
                let router = Arc::new(PgRouterDirectory::new(
                    pool,
                    config.router.staleness_threshold(),
                    config.router.max_claim_attempts,
                ));
                Self::new(config, store, router, bridges)
            }
            #[cfg(not(feature = "postgres"))]
            StorageBackend::Postgres => Err(crate::error::RelayError::Configuration(
                "postgres backend requires the `postgres` feature".to_string(),
            )),
        }
    }

    /// Spawn the bridge dispatcher, append watcher and (if enabled) sweeper.
    /// Calling this twice is a no-op.
    pub fn start_background(&self) {
        let Some(worker) = self.bridge_worker.lock().take() else {
            warn!(node_id = %self.node_id, "Background services already started");
            return;
        };

        let mut background = self.background.lock();
        background.push(tokio::spawn(worker.run(self.shutdown.subscribe())));

        let watcher = AppendWatcher::new(self.store.watch_appends(), self.sessions.clone());
        background.push(tokio::spawn(watcher.run(self.shutdown.subscribe())));

        if self.config.sweeper.enabled {
            let sweeper = ExpirySweeper::new(
                self.store.clone(),
                self.router.clone(),
                self.config.sweeper.clone(),
            );
            background.push(tokio::spawn(sweeper.run(self.shutdown.subscribe())));
        }

        info!(node_id = %self.node_id, services = background.len(), "Background services started");
    }

    /// Run a session over an accepted connection.
    pub fn accept<R, W>(&self, reader: R, writer: W) -> JoinHandle<SessionOutcome>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session::new(self.session_ctx.clone(), writer);
        let shutdown = self.shutdown.subscribe();
        let guard = LiveGuard::enter(&self.live);
        tokio::spawn(async move {
            let _guard = guard;
            session.run(reader, shutdown).await
        })
    }

    /// Accept a notification from an upstream sender.
    pub async fn submit(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
        payload: Vec<u8>,
        ttl_seconds: u64,
    ) -> RelayResult<AcceptanceResult> {
        self.pipeline
            .submit(uaid, channel_id, payload, ttl_seconds)
            .await
    }

    /// Signal every session and service to stop, then wait up to `grace`
    /// for sessions to drain. Returns how many were still running.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        info!(
            node_id = %self.node_id,
            live_sessions = self.live_sessions(),
            "Shutting down relay node"
        );
        let _ = self.shutdown.send(());

        let drained = async {
            loop {
                let notified = self.live.drained.notified();
                if self.live_sessions() == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(grace, drained).await.is_err() {
            warn!(remaining = self.live_sessions(), "Sessions still draining after grace period");
        }

        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background service ended abnormally");
            }
        }

        let remaining = self.live_sessions();
        info!(node_id = %self.node_id, remaining, "Relay node stopped");
        remaining
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn NotificationStore> {
        self.store.clone()
    }

    pub fn router(&self) -> Arc<dyn RouterDirectory> {
        self.router.clone()
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.live.count.load(Ordering::SeqCst)
    }

    pub fn bridge_stats(&self) -> BridgeStats {
        self.bridge.stats()
    }
}
