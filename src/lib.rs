#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Push Relay Core
//!
//! Session, storage and delivery core for a push-notification relay.
//!
//! ## Overview
//!
//! Devices hold a long-lived connection to one node of a relay fleet and are
//! identified by a UAID. Upstream senders submit notifications for a
//! `(uaid, channel)` subscription. Every accepted notification is written to a
//! shared store first; the relay then pushes it to the device's live session,
//! leaves it for the node that owns the device, or wakes the device through a
//! vendor bridge.
//!
//! ## Module Organization
//!
//! - [`session`] - Per-connection state machine and wire protocol
//! - [`store`] - Durable per-UAID notification log
//! - [`router`] - Which node owns which UAID, with versioned claims
//! - [`delivery`] - Acceptance pipeline, session registry, append watcher
//! - [`bridge`] - Wake-up adapters for devices without a live session
//! - [`sweeper`] - Expiry and idle-UAID cleanup
//! - [`node`] - Wiring for one relay node
//! - [`config`] - Layered configuration
//! - [`error`] - Error taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use push_relay::bridge::BridgeRegistry;
//! use push_relay::config::RelayConfig;
//! use push_relay::node::RelayNode;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::load(None)?;
//! let node = RelayNode::from_config(config, BridgeRegistry::new()).await?;
//! node.start_background();
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --no-default-features   # in-memory backends only
//! DATABASE_URL=postgres://... cargo test -- --include-ignored
//! ```

pub mod bridge;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod models;
pub mod node;
pub mod retry;
pub mod router;
pub mod session;
pub mod store;
pub mod sweeper;

pub use config::RelayConfig;
pub use delivery::{AcceptanceResult, DeliveryPipeline, DeliveryRoute, RejectReason};
pub use error::{RelayError, RelayResult, StorageError, StorageResult};
pub use models::{
    BridgeTarget, ChannelId, ClaimVersion, NewNotification, NodeId, Notification, RouterRecord,
    SortKey, Uaid,
};
pub use node::RelayNode;
pub use router::RouterDirectory;
pub use session::{CloseReason, SessionOutcome, SessionState};
pub use store::NotificationStore;
