//! # Relay Data Model
//!
//! Identifiers, notifications and router records shared by the storage,
//! session and delivery layers.

pub mod identifiers;
pub mod notification;
pub mod router_record;

pub use identifiers::{ChannelId, ClaimVersion, NodeId, SortKey, Uaid};
pub use notification::{NewNotification, Notification};
pub use router_record::{BridgeRegistration, BridgeTarget, Route, RouterRecord};
