//! Subscription endpoint URLs handed to clients on register.
//!
//! Endpoint encryption belongs to the HTTP front end; this seam only needs
//! to produce a stable URL for `(uaid, channel)`.

use crate::error::RelayResult;
use crate::models::{ChannelId, Uaid};

pub trait EndpointFactory: Send + Sync + 'static {
    fn endpoint(
        &self,
        uaid: &Uaid,
        channel_id: &ChannelId,
        key: Option<&str>,
    ) -> RelayResult<String>;
}

/// `{base}/v1/{uaid}/{channel}`, or `/v2/` when the client supplied an
/// application server key.
#[derive(Debug, Clone)]
pub struct TemplateEndpointFactory {
    base_url: String,
}

impl TemplateEndpointFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl EndpointFactory for TemplateEndpointFactory {
    fn endpoint(
        &self,
        uaid: &Uaid,
        channel_id: &ChannelId,
        key: Option<&str>,
    ) -> RelayResult<String> {
        let version = if key.is_some() { "v2" } else { "v1" };
        Ok(format!("{}/{version}/{uaid}/{channel_id}", self.base_url))
    }
}
