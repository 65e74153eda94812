//! # Session Events
//!
//! | Event | From | To |
//! |-------|------|----|
//! | `HelloReceived` | Unauthenticated | Claiming |
//! | `Claimed` | Claiming | Active |
//! | `ClaimRejected`, `ClaimFailed` | Claiming | Closed |
//! | `Disconnect` | Active | Draining |
//! | `Disconnect` | Unauthenticated, Claiming | Closed |
//! | `OwnershipLost` | Active | Closed |
//! | `Drained` | Draining | Closed |

use crate::models::ClaimVersion;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake received; `minted` when a new UAID was issued.
    HelloReceived { minted: bool },
    Claimed { version: ClaimVersion },
    /// Another node holds a fresh claim.
    ClaimRejected,
    /// Claim could not be written (permanent or exhausted storage error).
    ClaimFailed { reason: String },
    Disconnect(CloseReason),
    /// Refresh found the claim taken over, or a newer local session
    /// replaced this one.
    OwnershipLost,
    /// Claim released and registry entry removed.
    Drained,
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::HelloReceived { .. } => "hello_received",
            Self::Claimed { .. } => "claimed",
            Self::ClaimRejected => "claim_rejected",
            Self::ClaimFailed { .. } => "claim_failed",
            Self::Disconnect(_) => "disconnect",
            Self::OwnershipLost => "ownership_lost",
            Self::Drained => "drained",
        }
    }
}

/// Why a session is ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    HandshakeTimeout,
    KeepaliveTimeout,
    ProtocolViolation,
    PingTooFrequent,
    StorageFailure,
    OwnershipConflict,
    Superseded,
    /// Backlog exceeded the per-session limit; the UAID was dropped.
    MessageOverload,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::ProtocolViolation => "protocol_violation",
            Self::PingTooFrequent => "ping_too_frequent",
            Self::StorageFailure => "storage_failure",
            Self::OwnershipConflict => "ownership_conflict",
            Self::Superseded => "superseded",
            Self::MessageOverload => "message_overload",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
