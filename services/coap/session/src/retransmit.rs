//! Retransmission of confirmable messages with exponential backoff.
//!
//! Entries are not timers: the periodic runner calls [`RetransmitScheduler::tick`]
//! and every due entry is either resent or, once its attempts are exhausted,
//! removed and failed.

use crate::error::SessionError;
use bytes::Bytes;
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound on network latency assumed by the exchange lifetime
pub const MAX_LATENCY: Duration = Duration::from_secs(100);

/// Retransmission parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionParams {
    /// Timeout before the first retransmission
    pub ack_timeout: Duration,
    /// Multiplier applied to the timeout after each retransmission
    pub backoff_factor: u32,
    /// Total transmissions, the first one included
    pub max_attempts: u32,
}

impl Default for TransmissionParams {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            backoff_factor: 2,
            max_attempts: 4,
        }
    }
}

impl TransmissionParams {
    /// Timeout waited after transmission `attempt` (1-based)
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1);
        let mut timeout = self.ack_timeout;
        for _ in 1..attempt {
            timeout = timeout.saturating_mul(factor);
        }
        timeout
    }

    /// Time from the first transmission to the last one
    pub fn max_transmit_span(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|a| self.timeout_for(a)).sum()
    }

    /// Time from the first transmission until the sender gives up
    pub fn max_transmit_wait(&self) -> Duration {
        (1..=self.max_attempts.max(1)).map(|a| self.timeout_for(a)).sum()
    }

    /// How long a message id must be remembered by the receiver
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + MAX_LATENCY * 2 + self.ack_timeout
    }
}

/// How an entry was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Acknowledgement, possibly with a piggybacked response
    Ack,
    /// Reset
    Reset,
}

/// Completion callback of a retransmission entry
pub type Notifier = Box<dyn FnOnce(Result<AckKind, SessionError>) + Send + Sync>;

struct Entry {
    datagram: Bytes,
    attempts: u32,
    timeout: Duration,
    next_due: Instant,
    notifier: Notifier,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("len", &self.datagram.len())
            .field("attempts", &self.attempts)
            .field("timeout", &self.timeout)
            .field("next_due", &self.next_due)
            .finish()
    }
}

/// Per-connection set of unacknowledged confirmable messages
#[derive(Debug)]
pub struct RetransmitScheduler {
    params: TransmissionParams,
    entries: DashMap<u16, Entry>,
}

impl RetransmitScheduler {
    /// Create an empty scheduler
    pub fn new(params: TransmissionParams) -> Self {
        Self {
            params,
            entries: DashMap::new(),
        }
    }

    /// Parameters in use
    pub fn params(&self) -> &TransmissionParams {
        &self.params
    }

    /// Track a confirmable datagram whose first transmission happens at `now`
    pub fn arm(&self, message_id: u16, datagram: Bytes, now: Instant, notifier: Notifier) {
        let entry = self.entry(datagram, now, notifier);
        if let Some(previous) = self.entries.insert(message_id, entry) {
            (previous.notifier)(Err(SessionError::Cancelled));
        }
    }

    /// Like [`arm`](Self::arm), but refuses an id that is still in flight
    /// instead of replacing its entry
    pub fn try_arm(
        &self,
        message_id: u16,
        datagram: Bytes,
        now: Instant,
        notifier: Notifier,
    ) -> Result<(), SessionError> {
        match self.entries.entry(message_id) {
            Slot::Occupied(_) => Err(SessionError::MessageIdInUse(message_id)),
            Slot::Vacant(slot) => {
                slot.insert(self.entry(datagram, now, notifier));
                Ok(())
            }
        }
    }

    fn entry(&self, datagram: Bytes, now: Instant, notifier: Notifier) -> Entry {
        let timeout = self.params.ack_timeout;
        Entry {
            datagram,
            attempts: 1,
            timeout,
            next_due: now + timeout,
            notifier,
        }
    }

    /// Complete the entry for `message_id` after an ACK or RST
    pub fn acknowledge(&self, message_id: u16, kind: AckKind) -> bool {
        match self.entries.remove(&message_id) {
            Some((_, entry)) => {
                debug!(
                    message_id,
                    attempts = entry.attempts,
                    ?kind,
                    "Confirmable message acknowledged"
                );
                (entry.notifier)(Ok(kind));
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `message_id` without notifying
    pub fn cancel(&self, message_id: u16) -> bool {
        self.entries.remove(&message_id).is_some()
    }

    /// Advance every due entry.
    ///
    /// Returns the datagrams to resend; exhausted entries are removed and
    /// their notifiers receive `DeliveryFailed`.
    pub fn tick(&self, now: Instant) -> Vec<Bytes> {
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();

        for mut e in self.entries.iter_mut() {
            if e.next_due > now {
                continue;
            }
            if e.attempts >= self.params.max_attempts {
                exhausted.push(*e.key());
                continue;
            }
            let factor = self.params.backoff_factor.max(1);
            e.attempts += 1;
            e.timeout = e.timeout.saturating_mul(factor);
            e.next_due = now + e.timeout;
            resend.push(e.datagram.clone());
        }

        for message_id in exhausted {
            if let Some((_, entry)) = self.entries.remove(&message_id) {
                debug!(message_id, attempts = entry.attempts, "Retransmission exhausted");
                (entry.notifier)(Err(SessionError::DeliveryFailed {
                    attempts: entry.attempts,
                }));
            }
        }

        resend
    }

    /// Remove every entry; notifiers receive `ConnectionClosed`
    pub fn drain(&self) -> usize {
        let ids: Vec<u16> = self.entries.iter().map(|e| *e.key()).collect();
        let mut drained = 0;
        for message_id in ids {
            if let Some((_, entry)) = self.entries.remove(&message_id) {
                (entry.notifier)(Err(SessionError::ConnectionClosed));
                drained += 1;
            }
        }
        drained
    }

    /// Whether an entry exists for `message_id`
    pub fn contains(&self, message_id: u16) -> bool {
        self.entries.contains_key(&message_id)
    }

    /// Number of unacknowledged messages
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing awaits acknowledgment
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
