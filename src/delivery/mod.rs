//! # Delivery
//!
//! The acceptance path for inbound notifications ([`DeliveryPipeline`]),
//! the node-local session registry it pushes into, and the watcher that
//! turns cross-node append signals into storage checks.

pub mod pipeline;
pub mod registry;
pub mod watcher;

pub use pipeline::{AcceptanceResult, DeliveryPipeline, DeliveryRoute, RejectReason};
pub use registry::{SessionHandle, SessionRegistry, SessionSignal};
pub use watcher::AppendWatcher;
