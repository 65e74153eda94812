//! In-memory delivery queue for one session.
//!
//! Mirrors the not-yet-acknowledged notifications of the UAID. Entries are
//! admitted strictly in sort-key order behind a cursor that only moves
//! forward, so delivery attempts follow key order. Anything the queue cannot
//! take contiguously is left for a storage read after the cursor.

use crate::models::{ChannelId, Notification, SortKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Pushed by the delivery pipeline on this node.
    Direct,
    /// Read from the notification store.
    Stored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedNotification {
    pub notification: Notification,
    pub source: Source,
}

/// Result of offering a directly pushed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Already covered by the cursor.
    Duplicate,
    /// Not contiguous with the cursor, or no room; read storage instead.
    NeedsFetch,
}

#[derive(Debug)]
pub struct DeliveryQueue {
    pending: BTreeMap<SortKey, QueuedNotification>,
    in_flight: BTreeMap<SortKey, QueuedNotification>,
    cursor: Option<SortKey>,
    max_in_flight: usize,
    /// Storage may hold entries beyond the cursor.
    more_in_storage: bool,
}

impl DeliveryQueue {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            cursor: None,
            max_in_flight: max_in_flight.max(1),
            more_in_storage: true,
        }
    }

    pub fn cursor(&self) -> Option<SortKey> {
        self.cursor
    }

    pub fn mark_storage_dirty(&mut self) {
        self.more_in_storage = true;
    }

    /// A storage read is due: storage may have more and the queue has room.
    pub fn wants_fetch(&self) -> bool {
        self.more_in_storage && self.pending.is_empty() && self.has_capacity()
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.max_in_flight
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Offer a notification pushed by the pipeline.
    pub fn offer_direct(&mut self, notification: Notification) -> Admission {
        let key = notification.sort_key;
        if self.cursor.is_some_and(|c| key <= c) {
            return Admission::Duplicate;
        }
        let contiguous = match self.cursor {
            Some(c) => key == c.next(),
            // Nothing read yet; only storage knows what precedes this key.
            None => false,
        };
        if !contiguous || self.pending.len() >= self.max_in_flight {
            self.more_in_storage = true;
            return Admission::NeedsFetch;
        }
        self.admit(notification, Source::Direct);
        Admission::Admitted
    }

    /// Take a page read from storage after the cursor. `full_page` tells
    /// whether the read hit its limit, meaning more may follow.
    pub fn load_page(&mut self, page: Vec<Notification>, full_page: bool) -> usize {
        self.more_in_storage = full_page;
        let mut admitted = 0;
        for notification in page {
            if self.cursor.is_some_and(|c| notification.sort_key <= c) {
                continue;
            }
            self.admit(notification, Source::Stored);
            admitted += 1;
        }
        admitted
    }

    fn admit(&mut self, notification: Notification, source: Source) {
        let key = notification.sort_key;
        self.cursor = Some(key);
        self.pending.insert(key, QueuedNotification { notification, source });
    }

    /// Move the next sendable entries to in-flight, lowest key first.
    /// Entries that expired while queued are dropped.
    pub fn next_to_send(&mut self, now: DateTime<Utc>) -> Vec<QueuedNotification> {
        let mut batch = Vec::new();
        while self.has_capacity() {
            let Some((key, queued)) = self.pending.pop_first() else {
                break;
            };
            if queued.notification.is_expired(now) {
                continue;
            }
            self.in_flight.insert(key, queued.clone());
            batch.push(queued);
        }
        batch
    }

    /// Acknowledge exactly `(channel_id, sort_key)`. Nothing else is touched.
    pub fn ack(&mut self, channel_id: &ChannelId, sort_key: SortKey) -> Option<QueuedNotification> {
        match self.in_flight.get(&sort_key) {
            Some(q) if q.notification.channel_id == *channel_id => self.in_flight.remove(&sort_key),
            _ => None,
        }
    }

    /// Forget everything queued for an unsubscribed channel.
    pub fn remove_channel(&mut self, channel_id: &ChannelId) {
        self.pending.retain(|_, q| q.notification.channel_id != *channel_id);
        self.in_flight.retain(|_, q| q.notification.channel_id != *channel_id);
    }
}
