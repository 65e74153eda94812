use super::events::SessionEvent;
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connection open, waiting for the hello handshake
    Unauthenticated,
    /// Writing the router claim for the UAID
    Claiming,
    /// Delivering notifications and accepting acks
    Active,
    /// Releasing the claim while the transport closes
    Draining,
    /// Terminal; in-memory state discarded
    Closed,
}

impl SessionState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Resolve the state reached from `self` on `event`.
    pub fn transition(self, event: &SessionEvent) -> RelayResult<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        let target = match (self, event) {
            (Unauthenticated, HelloReceived { .. }) => Claiming,

            (Claiming, Claimed { .. }) => Active,
            (Claiming, ClaimRejected) | (Claiming, ClaimFailed { .. }) => Closed,

            (Active, Disconnect(_)) => Draining,
            (Active, OwnershipLost) => Closed,

            (Draining, Drained) => Closed,

            // Nothing to release before a claim exists.
            (Unauthenticated, Disconnect(_)) | (Claiming, Disconnect(_)) => Closed,

            (from, event) => {
                return Err(RelayError::InvalidTransition {
                    from: from.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };
        Ok(target)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::Claiming => write!(f, "claiming"),
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unauthenticated" => Ok(Self::Unauthenticated),
            "claiming" => Ok(Self::Claiming),
            "active" => Ok(Self::Active),
            "draining" => Ok(Self::Draining),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid session state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClaimVersion;
    use crate::session::events::CloseReason;

    #[test]
    fn happy_path_walks_every_state() {
        let mut state = SessionState::Unauthenticated;
        for event in [
            SessionEvent::HelloReceived { minted: false },
            SessionEvent::Claimed {
                version: ClaimVersion(1),
            },
            SessionEvent::Disconnect(CloseReason::ClientClosed),
            SessionEvent::Drained,
        ] {
            state = state.transition(&event).unwrap();
        }
        assert_eq!(state, SessionState::Closed);
        assert!(state.is_terminal());
    }

    #[test]
    fn conflicts_and_ownership_loss_close_immediately() {
        assert_eq!(
            SessionState::Claiming.transition(&SessionEvent::ClaimRejected).unwrap(),
            SessionState::Closed
        );
        assert_eq!(
            SessionState::Active.transition(&SessionEvent::OwnershipLost).unwrap(),
            SessionState::Closed
        );
    }

    #[test]
    fn disconnect_before_claim_skips_draining() {
        let event = SessionEvent::Disconnect(CloseReason::HandshakeTimeout);
        assert_eq!(
            SessionState::Unauthenticated.transition(&event).unwrap(),
            SessionState::Closed
        );
    }

    #[test]
    fn closed_is_terminal_and_invalid_moves_error() {
        assert!(SessionState::Closed
            .transition(&SessionEvent::HelloReceived { minted: true })
            .is_err());
        assert!(SessionState::Active
            .transition(&SessionEvent::HelloReceived { minted: false })
            .is_err());
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            SessionState::Unauthenticated,
            SessionState::Claiming,
            SessionState::Active,
            SessionState::Draining,
            SessionState::Closed,
        ] {
            assert_eq!(state.to_string().parse::<SessionState>().unwrap(), state);
        }
        assert!("open".parse::<SessionState>().is_err());
    }
}
