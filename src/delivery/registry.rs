//! Local session registry
//!
//! Maps each UAID with a live session on this node to the channel feeding
//! that session. Handles carry the claim version they were registered under
//! so a push decided from a router lookup only lands in the session holding
//! exactly that claim.

use crate::models::{ClaimVersion, Notification, Uaid};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Messages delivered to a running session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Newly accepted notification, pushed on the low-latency path.
    Notification(Notification),
    /// Something may have been appended for this UAID; read storage.
    CheckStorage,
    /// A newer session for the same UAID registered on this node.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub version: ClaimVersion,
    sender: mpsc::Sender<SessionSignal>,
}

impl SessionHandle {
    pub fn new(
        session_id: Uuid,
        version: ClaimVersion,
        sender: mpsc::Sender<SessionSignal>,
    ) -> Self {
        Self {
            session_id,
            version,
            sender,
        }
    }

    fn try_signal(&self, signal: SessionSignal) -> bool {
        self.sender.try_send(signal).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uaid, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` for `uaid`, superseding any older session.
    pub fn register(&self, uaid: Uaid, handle: SessionHandle) {
        if let Some(previous) = self.sessions.insert(uaid, handle) {
            debug!(session_id = %previous.session_id, "Superseding older local session");
            previous.try_signal(SessionSignal::Superseded);
        }
    }

    /// Remove the handle only if it still belongs to `session_id`.
    pub fn deregister(&self, uaid: &Uaid, session_id: Uuid) -> bool {
        self.sessions
            .remove_if(uaid, |_, h| h.session_id == session_id)
            .is_some()
    }

    /// Hand a notification to the session holding claim `version`. Never
    /// waits; `false` means the durable copy will be picked up later.
    pub fn push(&self, uaid: &Uaid, version: ClaimVersion, notification: Notification) -> bool {
        match self.sessions.get(uaid) {
            Some(handle) if handle.version == version => {
                handle.try_signal(SessionSignal::Notification(notification))
            }
            _ => false,
        }
    }

    pub fn signal_check(&self, uaid: &Uaid) -> bool {
        self.sessions
            .get(uaid)
            .is_some_and(|h| h.try_signal(SessionSignal::CheckStorage))
    }

    /// Ask every local session to re-read storage.
    pub fn signal_all_check(&self) -> usize {
        self.sessions
            .iter()
            .filter(|h| h.try_signal(SessionSignal::CheckStorage))
            .count()
    }

    pub fn contains(&self, uaid: &Uaid) -> bool {
        self.sessions.contains_key(uaid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
