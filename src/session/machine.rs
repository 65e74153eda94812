//! # Session Task
//!
//! One [`Session`] drives one client connection from handshake to close as
//! a single tokio task. Every suspension point (client I/O, storage, router)
//! is an `.await` on this task. Inbound frames arrive from a reader task that
//! is aborted when the session ends, and pushes from the delivery pipeline
//! arrive through the session's registry channel.

use super::endpoint::EndpointFactory;
use super::events::{CloseReason, SessionEvent};
use super::protocol::{spawn_reader, ClientMessage, InboundFrame, MessageWriter, ServerMessage};
use super::queue::{Admission, DeliveryQueue, Source};
use super::states::SessionState;
use crate::config::SessionConfig;
use crate::constants::{
    PING_ABUSE_CLOSE_CODE, STATUS_INVALID_CHANNEL, STATUS_OK, STATUS_SERVER_ERROR,
};
use crate::delivery::{SessionHandle, SessionRegistry, SessionSignal};
use crate::error::RelayError;
use crate::logging::{log_session_summary, uaid_hash, SessionSummary};
use crate::models::{ChannelId, ClaimVersion, NodeId, SortKey, Uaid};
use crate::retry::RetryPolicy;
use crate::router::RouterDirectory;
use crate::store::NotificationStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const INBOUND_CAPACITY: usize = 16;
/// Hello status when another node holds a fresh claim.
const STATUS_CONFLICT: u16 = 409;
/// Hello status when the claim could not be written.
const STATUS_UNAVAILABLE: u16 = 503;

/// Node-wide collaborators shared by every session.
pub struct SessionContext {
    pub node_id: NodeId,
    pub config: SessionConfig,
    pub store: Arc<dyn NotificationStore>,
    pub router: Arc<dyn RouterDirectory>,
    pub registry: Arc<SessionRegistry>,
    pub retry: RetryPolicy,
    pub endpoints: Arc<dyn EndpointFactory>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub uaid: Option<Uaid>,
    pub close_reason: CloseReason,
    pub final_state: SessionState,
    pub summary: SessionSummary,
}

/// Why the active loop stopped.
enum Exit {
    /// Leave through `Draining`, releasing the claim.
    Disconnect(CloseReason),
    /// The claim is gone (taken over or reset); close without touching the
    /// router record.
    Lost(CloseReason),
}

pub struct Session<W> {
    ctx: Arc<SessionContext>,
    session_id: Uuid,
    state: SessionState,
    uaid: Option<Uaid>,
    version: ClaimVersion,
    registered: bool,
    queue: DeliveryQueue,
    writer: MessageWriter<W>,
    summary: SessionSummary,
    last_ping: Option<Instant>,
    /// Stored entries replayed since storage was last caught up.
    catch_up_sent: usize,
}

impl<W> Session<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ctx: Arc<SessionContext>, writer: W) -> Self {
        let max_in_flight = ctx.config.max_in_flight;
        Self {
            ctx,
            session_id: Uuid::new_v4(),
            state: SessionState::Unauthenticated,
            uaid: None,
            version: ClaimVersion::UNCLAIMED,
            registered: false,
            queue: DeliveryQueue::new(max_in_flight),
            writer: MessageWriter::new(writer),
            summary: SessionSummary::default(),
            last_ping: None,
            catch_up_sent: 0,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the connection to completion.
    pub async fn run<R>(
        mut self,
        reader: R,
        mut shutdown: broadcast::Receiver<()>,
    ) -> SessionOutcome
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let started = Instant::now();
        let (mut inbound, reader_task) = spawn_reader(reader, INBOUND_CAPACITY);

        let close_reason = self.drive(&mut inbound, &mut shutdown).await;
        reader_task.abort();

        if self.state == SessionState::Draining {
            self.drain().await;
        } else {
            self.deregister();
            self.writer.close().await;
        }

        log_session_summary(
            self.uaid.as_ref(),
            close_reason.as_str(),
            started.elapsed().as_millis() as u64,
            &self.summary,
        );

        SessionOutcome {
            session_id: self.session_id,
            uaid: self.uaid,
            close_reason,
            final_state: self.state,
            summary: self.summary,
        }
    }

    async fn drive(
        &mut self,
        inbound: &mut mpsc::Receiver<InboundFrame>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> CloseReason {
        let hello_timeout = self.ctx.config.hello_timeout();
        let first = tokio::select! {
            biased;
            _ = shutdown.recv() => return self.close_before_claim(CloseReason::Shutdown),
            frame = timeout(hello_timeout, inbound.recv()) => frame,
        };

        let requested = match first {
            Err(_) => return self.close_before_claim(CloseReason::HandshakeTimeout),
            Ok(None) => return self.close_before_claim(CloseReason::ClientClosed),
            Ok(Some(Err(e))) => return self.close_before_claim(reason_for_read_error(&e)),
            Ok(Some(Ok(ClientMessage::Hello { uaid, .. }))) => uaid,
            Ok(Some(Ok(other))) => {
                warn!(
                    session_id = %self.session_id,
                    kind = other.kind(),
                    "Expected hello as first message"
                );
                return self.close_before_claim(CloseReason::ProtocolViolation);
            }
        };

        let parsed = requested.as_deref().and_then(Uaid::parse_lenient);
        self.apply(SessionEvent::HelloReceived {
            minted: parsed.is_none(),
        });

        if let Err(reason) = self.claim(parsed).await {
            return reason;
        }

        match self.active(inbound, shutdown).await {
            Exit::Disconnect(reason) => {
                self.apply(SessionEvent::Disconnect(reason));
                reason
            }
            Exit::Lost(reason) => {
                self.apply(SessionEvent::OwnershipLost);
                reason
            }
        }
    }

    fn close_before_claim(&mut self, reason: CloseReason) -> CloseReason {
        debug!(session_id = %self.session_id, reason = %reason, "Closing before claim");
        self.apply(SessionEvent::Disconnect(reason));
        reason
    }

    /// Claiming: resolve the UAID, then write the claim.
    async fn claim(&mut self, requested: Option<Uaid>) -> Result<(), CloseReason> {
        let ctx = self.ctx.clone();
        let mut expected = ClaimVersion::UNCLAIMED;

        let uaid = match requested {
            Some(uaid) => match ctx.retry.execute("lookup", || ctx.router.lookup(&uaid)).await {
                Ok(Some(record)) => {
                    expected = record.version;
                    uaid
                }
                Ok(None) => {
                    let minted = Uaid::new();
                    info!(
                        uaid_hash = %uaid_hash(&minted),
                        "Unknown UAID presented, issuing a new one"
                    );
                    minted
                }
                Err(e) => {
                    self.uaid = Some(uaid);
                    return Err(self.claim_failed(e.into()).await);
                }
            },
            None => Uaid::new(),
        };
        self.uaid = Some(uaid);

        let node_id = ctx.node_id.clone();
        match ctx
            .retry
            .execute("claim", || ctx.router.claim(&uaid, &node_id, expected))
            .await
        {
            Ok(version) => {
                self.version = version;
                self.apply(SessionEvent::Claimed { version });
                Ok(())
            }
            Err(RelayError::OwnershipConflict { holder, .. }) => {
                info!(
                    uaid_hash = %uaid_hash(&uaid),
                    holder = ?holder.as_ref().map(NodeId::as_str),
                    "Claim rejected; client must reconnect"
                );
                let _ = self.send_hello(STATUS_CONFLICT).await;
                self.apply(SessionEvent::ClaimRejected);
                Err(CloseReason::OwnershipConflict)
            }
            Err(e) => Err(self.claim_failed(e).await),
        }
    }

    async fn claim_failed(&mut self, err: RelayError) -> CloseReason {
        error!(session_id = %self.session_id, error = %err, "Claim aborted by storage failure");
        let _ = self.send_hello(STATUS_UNAVAILABLE).await;
        self.apply(SessionEvent::ClaimFailed {
            reason: err.to_string(),
        });
        CloseReason::StorageFailure
    }

    /// Active: register locally, replay backlog, then serve until exit.
    async fn active(
        &mut self,
        inbound: &mut mpsc::Receiver<InboundFrame>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Exit {
        let Some(uaid) = self.uaid else {
            return Exit::Disconnect(CloseReason::ProtocolViolation);
        };
        let config = self.ctx.config.clone();

        // Register before reading the backlog so nothing accepted meanwhile
        // slips between the read and the first push.
        let (signal_tx, mut signals) = mpsc::channel(config.signal_queue_capacity);
        self.ctx
            .registry
            .register(uaid, SessionHandle::new(self.session_id, self.version, signal_tx));
        self.registered = true;

        if let Err(exit) = self.send_hello(STATUS_OK).await {
            return exit;
        }
        if let Err(exit) = self.fill().await {
            return exit;
        }

        let keepalive = config.keepalive_timeout();
        let mut keepalive_deadline = Instant::now() + keepalive;
        let refresh_period = config.claim_refresh_interval();
        let mut refresh = interval_at(Instant::now() + refresh_period, refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poll_period = config.storage_poll_interval();
        let mut poll = interval_at(Instant::now() + poll_period, poll_period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                frame = inbound.recv() => {
                    keepalive_deadline = Instant::now() + keepalive;
                    self.on_frame(frame).await
                }
                signal = signals.recv() => self.on_signal(signal).await,
                _ = sleep_until(keepalive_deadline) => {
                    info!(session_id = %self.session_id, "Keepalive timeout");
                    Err(Exit::Disconnect(CloseReason::KeepaliveTimeout))
                }
                _ = refresh.tick() => self.refresh_claim().await,
                _ = poll.tick() => {
                    self.queue.mark_storage_dirty();
                    self.fill().await
                }
                _ = shutdown.recv() => Err(Exit::Disconnect(CloseReason::Shutdown)),
            };
            if let Err(exit) = step {
                return exit;
            }
        }
    }

    async fn on_frame(&mut self, frame: Option<InboundFrame>) -> Result<(), Exit> {
        match frame {
            None => Err(Exit::Disconnect(CloseReason::ClientClosed)),
            Some(Err(e)) => {
                let reason = reason_for_read_error(&e);
                if reason == CloseReason::ProtocolViolation {
                    warn!(session_id = %self.session_id, error = %e, "Malformed client message");
                }
                Err(Exit::Disconnect(reason))
            }
            Some(Ok(message)) => self.on_client_message(message).await,
        }
    }

    async fn on_client_message(&mut self, message: ClientMessage) -> Result<(), Exit> {
        match message {
            ClientMessage::Hello { .. } => {
                warn!(session_id = %self.session_id, "Duplicate hello");
                Err(Exit::Disconnect(CloseReason::ProtocolViolation))
            }
            ClientMessage::Register { channel_id, key } => {
                self.register_channel(channel_id, key).await
            }
            ClientMessage::Unregister { channel_id, code } => {
                self.unregister_channel(channel_id, code).await
            }
            ClientMessage::Ack { updates } => {
                for update in updates {
                    self.ack(&update.channel_id, &update.version).await?;
                }
                self.fill().await
            }
            ClientMessage::Nack { version, code } => {
                self.summary.nacks += 1;
                info!(
                    session_id = %self.session_id,
                    version = %version,
                    code = ?code,
                    "Client nack"
                );
                Ok(())
            }
            ClientMessage::Ping => self.ping().await,
        }
    }

    async fn on_signal(&mut self, signal: Option<SessionSignal>) -> Result<(), Exit> {
        match signal {
            Some(SessionSignal::Notification(notification)) => {
                match self.queue.offer_direct(notification) {
                    Admission::Admitted => self.fill().await,
                    Admission::NeedsFetch => {
                        self.summary.direct_storage += 1;
                        self.fill().await
                    }
                    Admission::Duplicate => Ok(()),
                }
            }
            Some(SessionSignal::CheckStorage) => {
                self.queue.mark_storage_dirty();
                self.fill().await
            }
            Some(SessionSignal::Superseded) | None => {
                info!(session_id = %self.session_id, "Superseded by a newer session on this node");
                Err(Exit::Lost(CloseReason::Superseded))
            }
        }
    }

    /// Send what the queue allows, reading further pages from storage while
    /// there is room.
    async fn fill(&mut self) -> Result<(), Exit> {
        let Some(uaid) = self.uaid else {
            return Ok(());
        };
        let ctx = self.ctx.clone();
        let batch_size = ctx.config.backlog_batch_size;

        loop {
            let now = Utc::now();
            for queued in self.queue.next_to_send(now) {
                let message = ServerMessage::notification(&queued.notification, now);
                self.send(&message).await?;
            }
            if !self.queue.wants_fetch() {
                return Ok(());
            }

            let cursor = self.queue.cursor();
            let page = ctx
                .retry
                .execute("fetch", || ctx.store.fetch_after(&uaid, cursor, Some(batch_size)))
                .await
                .map_err(|e| self.storage_exit("fetch", e.into()))?;
            let full = page.len() >= batch_size;
            let admitted = self.queue.load_page(page, full);
            self.summary.stored_retrieved += admitted as u64;

            self.catch_up_sent += admitted;
            if self.catch_up_sent > ctx.config.msg_limit {
                return Err(self.reset_overloaded(uaid).await);
            }
            if !full {
                self.catch_up_sent = 0;
            }
        }
    }

    /// Drop a UAID whose backlog outgrew `msg_limit`. The client gets an
    /// unknown UAID on its next hello and registers again.
    async fn reset_overloaded(&mut self, uaid: Uaid) -> Exit {
        warn!(
            session_id = %self.session_id,
            uaid_hash = %uaid_hash(&uaid),
            limit = self.ctx.config.msg_limit,
            "Backlog over limit, resetting UAID"
        );
        let ctx = self.ctx.clone();
        let dropped = ctx
            .retry
            .execute("drop_uaid", || ctx.router.drop_uaid(&uaid))
            .await;
        match dropped {
            Ok(()) => {
                if let Err(e) = ctx
                    .retry
                    .execute("drop_uaid", || ctx.store.drop_uaid(&uaid))
                    .await
                {
                    error!(
                        session_id = %self.session_id,
                        error = %e,
                        "Failed to drop overloaded backlog"
                    );
                }
            }
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to drop overloaded record"
                );
            }
        }
        Exit::Lost(CloseReason::MessageOverload)
    }

    async fn ack(&mut self, raw_channel: &str, raw_version: &str) -> Result<(), Exit> {
        let (Some(channel_id), Ok(sort_key)) = (
            ChannelId::parse_strict(raw_channel),
            raw_version.parse::<SortKey>(),
        ) else {
            debug!(session_id = %self.session_id, "Ignoring ack with unparseable identifiers");
            return Ok(());
        };
        let Some(queued) = self.queue.ack(&channel_id, sort_key) else {
            debug!(
                session_id = %self.session_id,
                version = %sort_key,
                "Ack for a notification not in flight"
            );
            return Ok(());
        };
        let Some(uaid) = self.uaid else {
            return Ok(());
        };

        let ctx = self.ctx.clone();
        ctx.retry
            .execute("ack", || ctx.store.ack(&uaid, sort_key))
            .await
            .map_err(|e| self.storage_exit("ack", e.into()))?;
        match queued.source {
            Source::Direct => self.summary.direct_acked += 1,
            Source::Stored => self.summary.stored_acked += 1,
        }
        Ok(())
    }

    async fn register_channel(&mut self, raw: String, key: Option<String>) -> Result<(), Exit> {
        let Some(uaid) = self.uaid else {
            return Ok(());
        };
        let Some(channel_id) = ChannelId::parse_strict(&raw) else {
            return self.send_register(raw, STATUS_INVALID_CHANNEL, String::new()).await;
        };

        let ctx = self.ctx.clone();
        if let Err(e) = ctx
            .retry
            .execute("add_channel", || ctx.store.add_channel(&uaid, &channel_id))
            .await
        {
            let _ = self.send_register(raw, STATUS_SERVER_ERROR, String::new()).await;
            return Err(self.storage_exit("add_channel", e.into()));
        }

        match ctx.endpoints.endpoint(&uaid, &channel_id, key.as_deref()) {
            Ok(endpoint) => {
                self.summary.registers += 1;
                self.send_register(raw, STATUS_OK, endpoint).await
            }
            Err(e) => {
                error!(error = %e, "Endpoint generation failed");
                self.send_register(raw, STATUS_SERVER_ERROR, String::new()).await
            }
        }
    }

    async fn unregister_channel(&mut self, raw: String, code: Option<u32>) -> Result<(), Exit> {
        let Some(uaid) = self.uaid else {
            return Ok(());
        };
        let Some(channel_id) = ChannelId::parse_strict(&raw) else {
            return self
                .send(&ServerMessage::Unregister {
                    channel_id: raw,
                    status: STATUS_INVALID_CHANNEL,
                })
                .await;
        };

        let ctx = self.ctx.clone();
        ctx.retry
            .execute("remove_channel", || ctx.store.remove_channel(&uaid, &channel_id))
            .await
            .map_err(|e| self.storage_exit("remove_channel", e.into()))?;
        self.queue.remove_channel(&channel_id);
        self.summary.unregisters += 1;
        debug!(session_id = %self.session_id, code = ?code, "Channel unregistered");
        self.send(&ServerMessage::Unregister {
            channel_id: raw,
            status: STATUS_OK,
        })
        .await
    }

    async fn ping(&mut self) -> Result<(), Exit> {
        let now = Instant::now();
        if let Some(last) = self.last_ping {
            if now.duration_since(last) < self.ctx.config.min_ping_interval() {
                warn!(
                    session_id = %self.session_id,
                    close_code = PING_ABUSE_CLOSE_CODE,
                    "Client pinging too frequently"
                );
                return Err(Exit::Disconnect(CloseReason::PingTooFrequent));
            }
        }
        self.last_ping = Some(now);
        self.send(&ServerMessage::Ping).await
    }

    async fn refresh_claim(&mut self) -> Result<(), Exit> {
        let Some(uaid) = self.uaid else {
            return Ok(());
        };
        let ctx = self.ctx.clone();
        let version = self.version;
        ctx.retry
            .execute("refresh", || ctx.router.refresh(&uaid, &ctx.node_id, version))
            .await
            .map_err(|e| self.storage_exit("refresh", e))
    }

    /// Draining: drop the local handle, release the claim, close transport.
    async fn drain(&mut self) {
        self.deregister();
        if let Some(uaid) = self.uaid {
            let ctx = self.ctx.clone();
            let version = self.version;
            match ctx
                .retry
                .execute("release", || ctx.router.release(&uaid, version))
                .await
            {
                Ok(true) => {
                    debug!(session_id = %self.session_id, version = %version, "Claim released")
                }
                Ok(false) => debug!(session_id = %self.session_id, "Claim already superseded"),
                Err(e) => warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "Claim release failed; it will lapse after the staleness window"
                ),
            }
        }
        self.writer.close().await;
        self.apply(SessionEvent::Drained);
    }

    fn deregister(&mut self) {
        if let (true, Some(uaid)) = (self.registered, self.uaid) {
            self.ctx.registry.deregister(&uaid, self.session_id);
            self.registered = false;
        }
    }

    fn storage_exit(&self, operation: &str, err: RelayError) -> Exit {
        match err {
            RelayError::OwnershipConflict { holder, .. } => {
                info!(
                    session_id = %self.session_id,
                    holder = ?holder.as_ref().map(NodeId::as_str),
                    "Claim taken over by another session"
                );
                Exit::Lost(CloseReason::OwnershipConflict)
            }
            other => {
                error!(
                    session_id = %self.session_id,
                    operation,
                    error = %other,
                    "Storage failure, closing session"
                );
                Exit::Disconnect(CloseReason::StorageFailure)
            }
        }
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<(), Exit> {
        self.writer.send(message).await.map_err(|e| {
            debug!(session_id = %self.session_id, error = %e, "Client write failed");
            Exit::Disconnect(CloseReason::ClientClosed)
        })
    }

    async fn send_hello(&mut self, status: u16) -> Result<(), Exit> {
        let uaid = self.uaid.map(|u| u.to_string()).unwrap_or_default();
        self.send(&ServerMessage::Hello {
            uaid,
            status,
            use_webpush: true,
        })
        .await
    }

    async fn send_register(
        &mut self,
        channel_id: String,
        status: u16,
        push_endpoint: String,
    ) -> Result<(), Exit> {
        self.send(&ServerMessage::Register {
            channel_id,
            status,
            push_endpoint,
        })
        .await
    }

    fn apply(&mut self, event: SessionEvent) {
        match self.state.transition(&event) {
            Ok(next) => {
                debug!(
                    session_id = %self.session_id,
                    from = %self.state,
                    to = %next,
                    event = event.event_type(),
                    "Session transition"
                );
                self.state = next;
            }
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    error = %e,
                    "Invalid session transition, forcing close"
                );
                self.state = SessionState::Closed;
            }
        }
    }
}

fn reason_for_read_error(err: &RelayError) -> CloseReason {
    match err {
        RelayError::MalformedClientMessage(_) => CloseReason::ProtocolViolation,
        _ => CloseReason::ClientClosed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::InMemoryRouterDirectory;
    use crate::session::endpoint::TemplateEndpointFactory;
    use crate::store::InMemoryNotificationStore;
    use std::time::Duration;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Harness {
        ctx: Arc<SessionContext>,
        store: Arc<InMemoryNotificationStore>,
        router: Arc<InMemoryRouterDirectory>,
        shutdown: broadcast::Sender<()>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryNotificationStore::new());
        let router = Arc::new(InMemoryRouterDirectory::new(Duration::from_secs(60)));
        let ctx = Arc::new(SessionContext {
            node_id: NodeId::from("node-test"),
            config: SessionConfig {
                hello_timeout_ms: 200,
                ..SessionConfig::default()
            },
            store: store.clone(),
            router: router.clone(),
            registry: Arc::new(SessionRegistry::new()),
            retry: RetryPolicy::no_retry(),
            endpoints: Arc::new(TemplateEndpointFactory::new("https://push.test")),
        });
        let (shutdown, _) = broadcast::channel(1);
        Harness {
            ctx,
            store,
            router,
            shutdown,
        }
    }

    #[tokio::test]
    async fn claim_storage_failure_replies_unavailable_and_closes() {
        let h = harness();
        h.router.fail_next_claims(1);
        let (client, server) = duplex(4096);
        let (server_read, server_write) = split(server);
        let session = Session::new(h.ctx.clone(), server_write);
        let task = tokio::spawn(session.run(BufReader::new(server_read), h.shutdown.subscribe()));

        let (client_read, mut client_write) = split(client);
        client_write.write_all(b"{\"messageType\":\"hello\"}\n").await.unwrap();
        let mut lines = BufReader::new(client_read).lines();
        let reply = ServerMessage::parse(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, ServerMessage::Hello { status: STATUS_UNAVAILABLE, .. }));

        let outcome = task.await.unwrap();
        assert_eq!(outcome.close_reason, CloseReason::StorageFailure);
        assert_eq!(outcome.final_state, SessionState::Closed);
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn backlog_follows_hello_reply() {
        let h = harness();
        let uaid = Uaid::new();
        let channel = ChannelId::new();
        let version = h
            .router
            .claim(&uaid, &NodeId::from("elsewhere"), ClaimVersion::UNCLAIMED)
            .await
            .unwrap();
        h.router.release(&uaid, version).await.unwrap();
        h.store.add_channel(&uaid, &channel).await.unwrap();
        h.store
            .append(crate::models::NewNotification::new(uaid, channel, b"queued".to_vec(), 60))
            .await
            .unwrap();

        let (client, server) = duplex(4096);
        let (server_read, server_write) = split(server);
        let session = Session::new(h.ctx.clone(), server_write);
        let task = tokio::spawn(session.run(BufReader::new(server_read), h.shutdown.subscribe()));

        let (client_read, mut client_write) = split(client);
        let hello = ClientMessage::Hello {
            uaid: Some(uaid.to_string()),
            use_webpush: true,
        };
        client_write.write_all(format!("{}\n", hello.to_frame()).as_bytes()).await.unwrap();
        let mut lines = BufReader::new(client_read).lines();

        let first = ServerMessage::parse(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(first, ServerMessage::Hello { status: STATUS_OK, .. }));
        let second = ServerMessage::parse(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.decoded_data().unwrap(), b"queued");

        h.shutdown.send(()).unwrap();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.close_reason, CloseReason::Shutdown);
        let record = h.router.lookup(&uaid).await.unwrap().unwrap();
        assert!(record.owner.is_none());
    }
}
