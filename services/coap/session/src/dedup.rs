//! Deduplication of inbound confirmable messages.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct DedupEntry {
    arrived: Instant,
    reply: Option<Bytes>,
}

/// Result of checking an inbound message id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting within the window; the id is now recorded
    Fresh,
    /// Seen before; carries the reply datagram sent for it, if any
    Duplicate(Option<Bytes>),
}

/// Per-connection record of recently seen confirmable message ids
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    entries: DashMap<u16, DedupEntry>,
}

impl DedupCache {
    /// Create a cache retaining ids for `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }

    /// Retention window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check `message_id` and record it when fresh.
    ///
    /// An entry older than the window counts as absent and is replaced.
    pub fn check(&self, message_id: u16, now: Instant) -> DedupOutcome {
        match self.entries.entry(message_id) {
            Entry::Occupied(mut e) => {
                if now.saturating_duration_since(e.get().arrived) >= self.window {
                    e.insert(DedupEntry {
                        arrived: now,
                        reply: None,
                    });
                    DedupOutcome::Fresh
                } else {
                    DedupOutcome::Duplicate(e.get().reply.clone())
                }
            }
            Entry::Vacant(v) => {
                v.insert(DedupEntry {
                    arrived: now,
                    reply: None,
                });
                DedupOutcome::Fresh
            }
        }
    }

    /// Store the reply datagram sent for `message_id`
    pub fn record_reply(&self, message_id: u16, reply: Bytes) {
        if let Some(mut entry) = self.entries.get_mut(&message_id) {
            entry.reply = Some(reply);
        }
    }

    /// Drop entries older than the window
    pub fn purge(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.arrived) < self.window);
        before.saturating_sub(self.entries.len())
    }

    /// Number of retained ids
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
