use super::{ChannelId, SortKey, Uaid};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Notification accepted from a sender but not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub uaid: Uaid,
    pub channel_id: ChannelId,
    pub payload: Vec<u8>,
    pub ttl_seconds: u64,
}

impl NewNotification {
    pub fn new(uaid: Uaid, channel_id: ChannelId, payload: Vec<u8>, ttl_seconds: u64) -> Self {
        Self {
            uaid,
            channel_id,
            payload,
            ttl_seconds,
        }
    }

    /// Expiry instant for a notification created at `created_at`.
    pub fn expires_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX);
        created_at
            .checked_add_signed(Duration::seconds(ttl.min(i64::MAX / 1_000)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Materialize the stored form once a sort key has been assigned.
    pub fn into_stored(self, sort_key: SortKey, created_at: DateTime<Utc>) -> Notification {
        let expires_at = self.expires_at(created_at);
        Notification {
            uaid: self.uaid,
            channel_id: self.channel_id,
            sort_key,
            payload: self.payload,
            ttl_seconds: self.ttl_seconds,
            created_at,
            expires_at,
        }
    }
}

/// A durable notification, keyed by `(uaid, sort_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub uaid: Uaid,
    pub channel_id: ChannelId,
    pub sort_key: SortKey,
    pub payload: Vec<u8>,
    pub ttl_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Notification {
    /// Identifier the client echoes back in acknowledgements.
    pub fn version(&self) -> String {
        self.sort_key.to_string()
    }

    /// A notification is dead from the instant its TTL elapses, so a zero TTL
    /// is expired on arrival.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Seconds of TTL left at `now`, floored at zero.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> u64 {
        let remaining = (self.expires_at - now).num_seconds();
        u64::try_from(remaining).unwrap_or(0)
    }
}
