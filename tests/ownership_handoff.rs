//! Claim hand-off and cross-node delivery between nodes sharing storage.

mod common;

use common::{subscribed_client, test_config, TestClient, TestCluster};
use push_relay::bridge::BridgeRegistry;
use push_relay::models::{ClaimVersion, NodeId, Uaid};
use push_relay::router::InMemoryRouterDirectory;
use push_relay::{AcceptanceResult, CloseReason, DeliveryRoute, RelayError, RouterDirectory};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn racing_claims_with_same_version_have_one_winner() {
    let router = Arc::new(InMemoryRouterDirectory::new(Duration::from_secs(60)));
    let uaid = Uaid::new();

    let handles: Vec<_> = ["node-a", "node-b"]
        .into_iter()
        .map(|node| {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .claim(&uaid, &NodeId::from(node), ClaimVersion::UNCLAIMED)
                    .await
            })
        })
        .collect();

    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(RelayError::OwnershipConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((wins, conflicts), (1, 1));
}

#[tokio::test]
async fn concurrent_reconnects_on_two_nodes_yield_one_session() {
    let cluster = TestCluster::new();
    let (node_a, node_b) = (cluster.node("node-a"), cluster.node("node-b"));
    let (client, uaid, _) = subscribed_client(&node_a).await;
    client.disconnect().await;

    let mut on_a = TestClient::connect(&node_a);
    let mut on_b = TestClient::connect(&node_b);
    let (a, b) = tokio::join!(on_a.hello(Some(uaid)), on_b.hello(Some(uaid)));

    let mut statuses = [a.1, b.1];
    statuses.sort_unstable();
    assert_eq!(statuses, [200, 409]);

    let (winner, loser) = if a.1 == 200 { (on_a, on_b) } else { (on_b, on_a) };
    assert_eq!(loser.outcome().await.close_reason, CloseReason::OwnershipConflict);
    winner.disconnect().await;
}

#[tokio::test]
async fn fresh_claim_blocks_other_node_until_released() {
    let cluster = TestCluster::new();
    let (node_a, node_b) = (cluster.node("node-a"), cluster.node("node-b"));
    let (holder, uaid, _) = subscribed_client(&node_a).await;

    let mut intruder = TestClient::connect(&node_b);
    let (_, status) = intruder.hello(Some(uaid)).await;
    assert_eq!(status, 409);
    assert_eq!(intruder.outcome().await.close_reason, CloseReason::OwnershipConflict);

    holder.disconnect().await;
    let mut successor = TestClient::connect(&node_b);
    assert_eq!(successor.hello_ok(Some(uaid)).await, uaid);
    let record = cluster.router.lookup(&uaid).await.unwrap().unwrap();
    assert_eq!(record.owner, Some(NodeId::from("node-b")));
    successor.disconnect().await;
}

#[tokio::test]
async fn stale_claim_is_taken_over_and_old_session_closes() {
    let cluster = TestCluster::new();
    // Slow refresh so the takeover lands before the holder's first refresh.
    let mut slow = test_config("node-a");
    slow.session.claim_refresh_interval_ms = 1_000;
    let node_a = cluster.node_with(slow, BridgeRegistry::new());
    let node_b = cluster.node("node-b");

    let (holder, uaid, channel) = subscribed_client(&node_a).await;
    cluster
        .router
        .backdate_last_seen(&uaid, common::STALENESS * 2);

    let mut successor = TestClient::connect(&node_b);
    assert_eq!(successor.hello_ok(Some(uaid)).await, uaid);

    let outcome = holder.outcome().await;
    assert_eq!(outcome.close_reason, CloseReason::OwnershipConflict);
    assert!(!node_a.sessions().contains(&uaid));

    // The loser closed without releasing; the successor still owns the UAID.
    let record = cluster.router.lookup(&uaid).await.unwrap().unwrap();
    assert_eq!(record.owner, Some(NodeId::from("node-b")));

    let result = node_a.submit(uaid, channel, b"after".to_vec(), 60).await.unwrap();
    assert!(matches!(
        result,
        AcceptanceResult::Accepted {
            route: DeliveryRoute::Remote(ref owner),
            ..
        } if owner.as_str() == "node-b"
    ));
    let (_, _, payload) = successor.recv_notification().await;
    assert_eq!(payload, b"after");
    successor.disconnect().await;
}

#[tokio::test]
async fn notification_accepted_elsewhere_reaches_owner_node() {
    let cluster = TestCluster::new();
    let (node_a, node_b) = (cluster.node("node-a"), cluster.node("node-b"));
    let (mut client, uaid, channel) = subscribed_client(&node_a).await;

    let result = node_b.submit(uaid, channel, b"cross".to_vec(), 60).await.unwrap();
    assert!(matches!(
        result,
        AcceptanceResult::Accepted {
            route: DeliveryRoute::Remote(_),
            ..
        }
    ));

    let (channel_id, version, payload) = client.recv_notification().await;
    assert_eq!(payload, b"cross");
    client.ack(&channel_id, &version).await;
    client.disconnect().await;
}

#[tokio::test]
async fn storage_poll_covers_missed_cross_node_signals() {
    let cluster = TestCluster::new();
    let mut polling = test_config("node-a");
    polling.session.storage_poll_interval_ms = 100;
    // No background services: the append watcher never runs on this node.
    let node_a = push_relay::RelayNode::new(
        polling,
        cluster.store.clone(),
        cluster.router.clone(),
        BridgeRegistry::new(),
    )
    .unwrap();
    let node_b = cluster.node("node-b");
    let (mut client, uaid, channel) = subscribed_client(&node_a).await;

    node_b.submit(uaid, channel, b"polled".to_vec(), 60).await.unwrap();
    let (_, _, payload) = client.recv_notification().await;
    assert_eq!(payload, b"polled");
    client.disconnect().await;
}

#[tokio::test]
async fn reconnect_on_same_node_supersedes_previous_session() {
    let cluster = TestCluster::new();
    let node = cluster.node("node-a");
    let (first, uaid, channel) = subscribed_client(&node).await;

    let mut second = TestClient::connect(&node);
    assert_eq!(second.hello_ok(Some(uaid)).await, uaid);
    assert_eq!(first.outcome().await.close_reason, CloseReason::Superseded);

    node.submit(uaid, channel, b"to-second".to_vec(), 60).await.unwrap();
    let (_, _, payload) = second.recv_notification().await;
    assert_eq!(payload, b"to-second");

    second.disconnect().await;
    let record = cluster.router.lookup(&uaid).await.unwrap().unwrap();
    assert!(record.owner.is_none());
}

#[tokio::test]
async fn refresh_storage_failure_closes_session() {
    let cluster = TestCluster::new();
    let mut config = test_config("node-a");
    config.session.claim_refresh_interval_ms = 50;
    config.retry.max_attempts = 1;
    let node = cluster.node_with(config, BridgeRegistry::new());
    let (client, _, _) = subscribed_client(&node).await;

    cluster.router.fail_next_refreshes(1);
    assert_eq!(client.outcome().await.close_reason, CloseReason::StorageFailure);
}
