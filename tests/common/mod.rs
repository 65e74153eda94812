//! Shared harness: in-memory clusters and a line-protocol test client.

#![allow(dead_code)]

pub mod strategies;

use push_relay::bridge::BridgeRegistry;
use push_relay::models::{ChannelId, Uaid};
use push_relay::router::InMemoryRouterDirectory;
use push_relay::session::{AckUpdate, ClientMessage, ServerMessage};
use push_relay::store::InMemoryNotificationStore;
use push_relay::{RelayConfig, RelayNode, SessionOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
    WriteHalf,
};
use tokio::task::JoinHandle;

pub const STALENESS: Duration = Duration::from_millis(1_500);
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Fast timings suitable for tests.
pub fn test_config(node_id: &str) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.node.node_id = node_id.to_string();
    config.node.endpoint_base_url = "https://push.test".to_string();
    config.session.hello_timeout_ms = 300;
    config.session.keepalive_timeout_ms = 10_000;
    config.session.min_ping_interval_ms = 0;
    config.session.claim_refresh_interval_ms = 200;
    config.session.storage_poll_interval_ms = 5_000;
    config.router.staleness_threshold_ms = STALENESS.as_millis() as u64;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.bridge.base_delay_ms = 5;
    config.bridge.max_delay_ms = 20;
    config.sweeper.enabled = false;
    config
}

/// Nodes sharing one in-memory store and router.
pub struct TestCluster {
    pub store: Arc<InMemoryNotificationStore>,
    pub router: Arc<InMemoryRouterDirectory>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryNotificationStore::new()),
            router: Arc::new(InMemoryRouterDirectory::new(STALENESS)),
        }
    }

    pub fn node(&self, node_id: &str) -> RelayNode {
        self.node_with(test_config(node_id), BridgeRegistry::new())
    }

    pub fn node_with(&self, config: RelayConfig, bridges: BridgeRegistry) -> RelayNode {
        let node = RelayNode::new(config, self.store.clone(), self.router.clone(), bridges)
            .expect("valid test config");
        node.start_background();
        node
    }
}

/// One device connection driven through the line protocol.
pub struct TestClient {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
    handle: JoinHandle<SessionOutcome>,
}

impl TestClient {
    pub fn connect(node: &RelayNode) -> Self {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let handle = node.accept(BufReader::new(server_read), server_write);
        let (client_read, writer) = split(client);
        Self {
            lines: BufReader::new(client_read).lines(),
            writer,
            handle,
        }
    }

    pub async fn send(&mut self, message: &ClientMessage) {
        self.send_raw(&message.to_frame()).await;
    }

    pub async fn send_raw(&mut self, frame: &str) {
        self.send_bytes(format!("{frame}\n").as_bytes()).await;
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write frame");
    }

    pub async fn recv(&mut self) -> ServerMessage {
        self.try_recv(RECV_TIMEOUT)
            .await
            .expect("expected a server message")
    }

    /// Next message, or `None` on timeout or close.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<ServerMessage> {
        match tokio::time::timeout(wait, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => Some(ServerMessage::parse(&line).expect("valid server frame")),
            _ => None,
        }
    }

    /// Handshake; returns the UAID and status the server replied with.
    pub async fn hello(&mut self, uaid: Option<Uaid>) -> (String, u16) {
        self.send(&ClientMessage::Hello {
            uaid: uaid.map(|u| u.to_string()),
            use_webpush: true,
        })
        .await;
        match self.recv().await {
            ServerMessage::Hello { uaid, status, .. } => (uaid, status),
            other => panic!("expected hello reply, got {other:?}"),
        }
    }

    /// Handshake expecting success; returns the UAID.
    pub async fn hello_ok(&mut self, uaid: Option<Uaid>) -> Uaid {
        let (raw, status) = self.hello(uaid).await;
        assert_eq!(status, 200, "hello rejected");
        Uaid::parse_lenient(&raw).expect("server issued a valid UAID")
    }

    pub async fn register(&mut self, channel_id: ChannelId) -> String {
        self.send(&ClientMessage::Register {
            channel_id: channel_id.to_string(),
            key: None,
        })
        .await;
        match self.recv().await {
            ServerMessage::Register {
                status: 200,
                push_endpoint,
                ..
            } => push_endpoint,
            other => panic!("expected successful register reply, got {other:?}"),
        }
    }

    /// Receive one notification frame: (channel, version, payload).
    pub async fn recv_notification(&mut self) -> (String, String, Vec<u8>) {
        let message = self.recv().await;
        let data = message.decoded_data().expect("notification payload");
        match message {
            ServerMessage::Notification {
                channel_id, version, ..
            } => (channel_id, version, data),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    pub async fn ack(&mut self, channel_id: &str, version: &str) {
        self.send(&ClientMessage::Ack {
            updates: vec![AckUpdate {
                channel_id: channel_id.to_string(),
                version: version.to_string(),
                code: None,
            }],
        })
        .await;
    }

    /// Close the client side and wait for the session to finish.
    pub async fn disconnect(self) -> SessionOutcome {
        let Self {
            lines,
            mut writer,
            handle,
        } = self;
        let _ = writer.shutdown().await;
        drop(writer);
        drop(lines);
        wait_outcome(handle).await
    }

    /// Wait for the server to end the session on its own.
    pub async fn outcome(self) -> SessionOutcome {
        let Self { handle, lines, writer } = self;
        let outcome = wait_outcome(handle).await;
        drop((lines, writer));
        outcome
    }
}

async fn wait_outcome(handle: JoinHandle<SessionOutcome>) -> SessionOutcome {
    tokio::time::timeout(RECV_TIMEOUT, handle)
        .await
        .expect("session finished")
        .expect("session task")
}

/// Connect, handshake and register one channel; returns the open client.
pub async fn subscribed_client(node: &RelayNode) -> (TestClient, Uaid, ChannelId) {
    let mut client = TestClient::connect(node);
    let uaid = client.hello_ok(None).await;
    let channel = ChannelId::new();
    client.register(channel).await;
    (client, uaid, channel)
}
