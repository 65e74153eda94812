//! # Delivery Pipeline
//!
//! Accepts a notification for `(uaid, channel)` and decides where it goes.
//! The store append is the durability boundary: nothing is reported as
//! accepted until it succeeds, and everything after it is best effort.

use super::registry::SessionRegistry;
use crate::bridge::{BridgeDispatcher, BridgeJob, WakeHint};
use crate::error::{RelayError, RelayResult};
use crate::logging::uaid_hash;
use crate::models::{ChannelId, NewNotification, NodeId, Route, SortKey, Uaid};
use crate::retry::RetryPolicy;
use crate::router::RouterDirectory;
use crate::store::NotificationStore;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No router record exists for the UAID.
    UnknownClient,
    /// The UAID has no such subscription.
    UnknownChannel,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownClient => write!(f, "unknown_client"),
            Self::UnknownChannel => write!(f, "unknown_channel"),
        }
    }
}

/// What happened after the durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryRoute {
    /// Owned here; `pushed` tells whether the live session took it directly.
    Local { pushed: bool },
    /// Owned by another node, which reads it from storage.
    Remote(NodeId),
    /// No live owner; a gateway wake-up was (or could not be) queued.
    Bridged { queued: bool },
    /// Stored for the next connection.
    Stored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptanceResult {
    Accepted { sort_key: SortKey, route: DeliveryRoute },
    Rejected(RejectReason),
}

impl AcceptanceResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn sort_key(&self) -> Option<SortKey> {
        match self {
            Self::Accepted { sort_key, .. } => Some(*sort_key),
            Self::Rejected(_) => None,
        }
    }
}

pub struct DeliveryPipeline {
    node_id: NodeId,
    store: Arc<dyn NotificationStore>,
    router: Arc<dyn RouterDirectory>,
    sessions: Arc<SessionRegistry>,
    bridge: BridgeDispatcher,
    retry: RetryPolicy,
    max_ttl_seconds: u64,
}

impl DeliveryPipeline {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn NotificationStore>,
        router: Arc<dyn RouterDirectory>,
        sessions: Arc<SessionRegistry>,
        bridge: BridgeDispatcher,
        retry: RetryPolicy,
        max_ttl_seconds: u64,
    ) -> Self {
        Self {
            node_id,
            store,
            router,
            sessions,
            bridge,
            retry,
            max_ttl_seconds,
        }
    }

    /// Accept a notification from an upstream sender.
    ///
    /// Returns [`RelayError::AcceptanceFailed`] when the durable write (or
    /// the validation reads preceding it) could not be completed; the sender
    /// should retry.
    pub async fn submit(
        &self,
        uaid: Uaid,
        channel_id: ChannelId,
        payload: Vec<u8>,
        ttl_seconds: u64,
    ) -> RelayResult<AcceptanceResult> {
        let record = self
            .retry
            .execute("lookup", || self.router.lookup(&uaid))
            .await
            .map_err(acceptance_failed)?;
        if record.is_none() {
            return Ok(AcceptanceResult::Rejected(RejectReason::UnknownClient));
        }
        let subscribed = self
            .retry
            .execute("has_channel", || self.store.has_channel(&uaid, &channel_id))
            .await
            .map_err(acceptance_failed)?;
        if !subscribed {
            return Ok(AcceptanceResult::Rejected(RejectReason::UnknownChannel));
        }

        let ttl_seconds = ttl_seconds.min(self.max_ttl_seconds);
        let pending = NewNotification::new(uaid, channel_id, payload, ttl_seconds);
        let stored = self
            .retry
            .execute("append", || self.store.append(pending.clone()))
            .await
            .map_err(acceptance_failed)?;
        let sort_key = stored.sort_key;

        // Durable from here on. Route from a fresh read of the router record.
        let record = match self.retry.execute("lookup", || self.router.lookup(&uaid)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Ok(AcceptanceResult::Accepted {
                    sort_key,
                    route: DeliveryRoute::Stored,
                })
            }
            Err(e) => {
                warn!(error = %e, "Router lookup failed after append; leaving notification stored");
                return Ok(AcceptanceResult::Accepted {
                    sort_key,
                    route: DeliveryRoute::Stored,
                });
            }
        };

        let route = match record.route(Utc::now(), self.router.staleness_threshold()) {
            Route::Node(owner) if owner == self.node_id => {
                let pushed = self.sessions.push(&uaid, record.version, stored);
                DeliveryRoute::Local { pushed }
            }
            Route::Node(owner) => DeliveryRoute::Remote(owner),
            Route::Bridged(target) => {
                let hint = WakeHint {
                    channel_id,
                    sort_key,
                    ttl_seconds,
                };
                let queued = self.bridge.dispatch(BridgeJob::new(uaid, target, hint));
                DeliveryRoute::Bridged { queued }
            }
            Route::Unrouted => DeliveryRoute::Stored,
        };

        debug!(
            uaid_hash = %uaid_hash(&uaid),
            sort_key = %sort_key,
            route = ?route,
            "Notification accepted"
        );
        Ok(AcceptanceResult::Accepted { sort_key, route })
    }
}

fn acceptance_failed(err: impl Into<RelayError>) -> RelayError {
    let err = err.into();
    error!(error = %err, "Notification not accepted");
    RelayError::AcceptanceFailed {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeRegistry, BridgeWorker};
    use crate::config::BridgeConfig;
    use crate::delivery::registry::{SessionHandle, SessionSignal};
    use crate::models::{BridgeTarget, ClaimVersion};
    use crate::router::InMemoryRouterDirectory;
    use crate::store::InMemoryNotificationStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<InMemoryNotificationStore>,
        router: Arc<InMemoryRouterDirectory>,
        sessions: Arc<SessionRegistry>,
        pipeline: DeliveryPipeline,
        bridge: BridgeDispatcher,
        _bridge_worker: BridgeWorker,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryNotificationStore::new());
        let router = Arc::new(InMemoryRouterDirectory::new(Duration::from_secs(60)));
        let sessions = Arc::new(SessionRegistry::new());
        let (bridge, bridge_worker) =
            BridgeDispatcher::new(&BridgeConfig::default(), BridgeRegistry::new(), router.clone());
        let pipeline = DeliveryPipeline::new(
            NodeId::from("local"),
            store.clone(),
            router.clone(),
            sessions.clone(),
            bridge.clone(),
            RetryPolicy::no_retry(),
            3_600,
        );
        Fixture {
            store,
            router,
            sessions,
            pipeline,
            bridge,
            _bridge_worker: bridge_worker,
        }
    }

    async fn known_client(f: &Fixture, owner: Option<&str>) -> (Uaid, ChannelId, ClaimVersion) {
        let uaid = Uaid::new();
        let channel = ChannelId::new();
        f.store.add_channel(&uaid, &channel).await.unwrap();
        let node = NodeId::from(owner.unwrap_or("someone"));
        let version = f.router.claim(&uaid, &node, ClaimVersion(0)).await.unwrap();
        if owner.is_none() {
            f.router.release(&uaid, version).await.unwrap();
        }
        (uaid, channel, version)
    }

    #[tokio::test]
    async fn unknown_client_and_channel_are_rejected_without_storing() {
        let f = fixture();
        let stranger = Uaid::new();
        let result = f.pipeline.submit(stranger, ChannelId::new(), vec![1], 60).await.unwrap();
        assert_eq!(result, AcceptanceResult::Rejected(RejectReason::UnknownClient));

        let (uaid, _, _) = known_client(&f, None).await;
        let result = f.pipeline.submit(uaid, ChannelId::new(), vec![1], 60).await.unwrap();
        assert_eq!(result, AcceptanceResult::Rejected(RejectReason::UnknownChannel));
        assert_eq!(f.store.stored_count(&uaid), 0);
    }

    #[tokio::test]
    async fn local_owner_with_live_session_gets_direct_push() {
        let f = fixture();
        let (uaid, channel, version) = known_client(&f, Some("local")).await;
        let (tx, mut rx) = mpsc::channel(4);
        f.sessions
            .register(uaid, SessionHandle::new(uuid::Uuid::new_v4(), version, tx));

        let result = f.pipeline.submit(uaid, channel, b"hi".to_vec(), 60).await.unwrap();

        assert!(matches!(
            result,
            AcceptanceResult::Accepted { route: DeliveryRoute::Local { pushed: true }, .. }
        ));
        match rx.recv().await {
            Some(SessionSignal::Notification(n)) => assert_eq!(n.payload, b"hi"),
            other => panic!("unexpected signal {other:?}"),
        }
        // Durable copy exists regardless of the push.
        assert_eq!(f.store.fetch_backlog(&uaid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remote_owner_is_left_to_its_node() {
        let f = fixture();
        let (uaid, channel, _) = known_client(&f, Some("other-node")).await;

        let result = f.pipeline.submit(uaid, channel, vec![], 60).await.unwrap();
        assert!(matches!(
            result,
            AcceptanceResult::Accepted {
                route: DeliveryRoute::Remote(ref n),
                ..
            } if n.as_str() == "other-node"
        ));
    }

    #[tokio::test]
    async fn offline_bridged_client_gets_wake_up() {
        let f = fixture();
        let (uaid, channel, _) = known_client(&f, None).await;
        f.router
            .register_bridge(&uaid, BridgeTarget::new("fcm", "tok"))
            .await
            .unwrap();

        let result = f.pipeline.submit(uaid, channel, vec![], 60).await.unwrap();
        assert!(matches!(
            result,
            AcceptanceResult::Accepted { route: DeliveryRoute::Bridged { queued: true }, .. }
        ));
        assert_eq!(f.bridge.stats().enqueued, 1);
    }

    #[tokio::test]
    async fn append_failure_is_acceptance_failed() {
        let f = fixture();
        let (uaid, channel, _) = known_client(&f, None).await;
        f.store.fail_next_appends(1);

        let err = f.pipeline.submit(uaid, channel, vec![], 60).await.unwrap_err();
        assert!(matches!(err, RelayError::AcceptanceFailed { .. }));
        assert!(f.store.fetch_backlog(&uaid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ttl_is_clamped() {
        let f = fixture();
        let (uaid, channel, _) = known_client(&f, None).await;

        f.pipeline.submit(uaid, channel, vec![], u64::MAX).await.unwrap();
        let stored = f.store.fetch_backlog(&uaid).await.unwrap();
        assert_eq!(stored[0].ttl_seconds, 3_600);
    }
}
