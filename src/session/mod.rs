//! # Client Sessions
//!
//! Per-connection state machine, wire protocol and delivery bookkeeping.
//!
//! ```text
//! Unauthenticated --hello--> Claiming --claimed--> Active --disconnect--> Draining --> Closed
//!        |                      |                     |
//!        +------timeout---------+----conflict---------+--ownership lost--> Closed
//! ```

pub mod endpoint;
pub mod events;
pub mod machine;
pub mod protocol;
pub mod queue;
pub mod states;

pub use endpoint::{EndpointFactory, TemplateEndpointFactory};
pub use events::{CloseReason, SessionEvent};
pub use machine::{Session, SessionContext, SessionOutcome};
pub use protocol::{AckUpdate, ClientMessage, MessageWriter, ServerMessage};
pub use queue::{Admission, DeliveryQueue, QueuedNotification, Source};
pub use states::SessionState;
