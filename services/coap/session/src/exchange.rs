//! Exchange tracking: matches inbound responses to outstanding requests.

use crate::error::SessionError;
use crate::pool::PooledMessage;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome delivered to a waiting request
pub type ExchangeResult = Result<PooledMessage, SessionError>;

/// One outstanding request awaiting its response
#[derive(Debug)]
pub struct Exchange {
    seq: u64,
    tx: Option<oneshot::Sender<ExchangeResult>>,
}

impl Exchange {
    fn new(seq: u64, tx: oneshot::Sender<ExchangeResult>) -> Self {
        Self { seq, tx: Some(tx) }
    }

    /// Deliver the outcome to the waiter.
    ///
    /// # Panics
    ///
    /// Panics if the exchange was already completed.
    pub fn complete(&mut self, result: ExchangeResult) {
        match self.tx.take() {
            // the waiter may have given up; its registration is then dropped with it
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => panic!("exchange completed twice"),
        }
    }
}

/// Per-connection map from token to pending exchange
#[derive(Debug, Default)]
pub struct ExchangeTracker {
    pending: DashMap<Bytes, Exchange>,
    next_seq: AtomicU64,
}

/// Handle to one registration, used to remove it without touching a later
/// exchange that reuses the token
#[derive(Debug, Clone)]
pub struct Registration {
    /// Token the exchange is keyed by
    pub token: Bytes,
    seq: u64,
}

impl ExchangeTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exchange for `token` and return the completion receiver.
    ///
    /// Fails with `TokenInUse` while another exchange is pending under the
    /// same token; the pending one is left untouched.
    pub fn register(
        &self,
        token: Bytes,
    ) -> Result<(Registration, oneshot::Receiver<ExchangeResult>), SessionError> {
        match self.pending.entry(token.clone()) {
            Entry::Occupied(_) => Err(SessionError::TokenInUse),
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                slot.insert(Exchange::new(seq, tx));
                Ok((Registration { token, seq }, rx))
            }
        }
    }

    /// Resolve the exchange matching the response's token.
    ///
    /// The entry is removed before completion, so a second response with the
    /// same token finds nothing. Unmatched responses are handed back.
    pub fn resolve(&self, response: PooledMessage) -> Result<(), PooledMessage> {
        match self.pending.remove(&response.token) {
            Some((_, mut exchange)) => {
                exchange.complete(Ok(response));
                Ok(())
            }
            None => Err(response),
        }
    }

    /// Fail the exchange for `token` with `err`
    pub fn fail(&self, token: &Bytes, err: SessionError) -> bool {
        match self.pending.remove(token) {
            Some((_, mut exchange)) => {
                exchange.complete(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail the exchange of `registration` with `err`, if still pending
    pub fn fail_registration(&self, registration: &Registration, err: SessionError) -> bool {
        match self
            .pending
            .remove_if(&registration.token, |_, e| e.seq == registration.seq)
        {
            Some((_, mut exchange)) => {
                exchange.complete(Err(err));
                true
            }
            None => false,
        }
    }

    /// Remove the exchange of `registration` without completing it
    pub fn cancel(&self, registration: &Registration) -> bool {
        self.pending
            .remove_if(&registration.token, |_, e| e.seq == registration.seq)
            .is_some()
    }

    /// Fail every pending exchange with `ConnectionClosed`
    pub fn fail_all(&self) -> usize {
        let tokens: Vec<Bytes> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for token in tokens {
            if self.fail(&token, SessionError::ConnectionClosed) {
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(failed, "Failed pending exchanges on close");
        }
        failed
    }

    /// Whether an exchange is pending for `token`
    pub fn contains(&self, token: &Bytes) -> bool {
        self.pending.contains_key(token)
    }

    /// Number of pending exchanges
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no exchange is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MessagePool;
    use coap_wire::{Code, MessageType};

    fn response(pool: &MessagePool, token: &'static [u8]) -> PooledMessage {
        let mut msg = pool.acquire();
        msg.typ = MessageType::Acknowledgement;
        msg.code = Code::CONTENT;
        msg.token = Bytes::from_static(token);
        msg
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let pool = MessagePool::default();
        let tracker = ExchangeTracker::new();
        let (_, mut rx) = tracker.register(Bytes::from_static(b"t1")).unwrap();

        assert!(tracker.resolve(response(&pool, b"t1")).is_ok());
        // duplicate response finds no exchange and is handed back
        assert!(tracker.resolve(response(&pool, b"t1")).is_err());
        assert!(!tracker.fail(&Bytes::from_static(b"t1"), SessionError::PeerReset));

        let msg = (&mut rx).await.unwrap().unwrap();
        assert_eq!(msg.code, Code::CONTENT);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_token_is_returned() {
        let pool = MessagePool::default();
        let tracker = ExchangeTracker::new();
        let _pending = tracker.register(Bytes::from_static(b"a")).unwrap();

        let back = tracker.resolve(response(&pool, b"b")).unwrap_err();
        assert_eq!(&back.token[..], b"b");
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let tracker = ExchangeTracker::new();
        let (_, rx1) = tracker.register(Bytes::from_static(b"1")).unwrap();
        let (_, rx2) = tracker.register(Bytes::from_static(b"2")).unwrap();

        assert_eq!(tracker.fail_all(), 2);
        assert!(matches!(rx1.await.unwrap(), Err(SessionError::ConnectionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(SessionError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_cancel_delivers_nothing() {
        let tracker = ExchangeTracker::new();
        let (registration, rx) = tracker.register(Bytes::from_static(b"c")).unwrap();
        assert!(tracker.cancel(&registration));
        // sender dropped without a value
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_pending_token_is_refused() {
        let pool = MessagePool::default();
        let tracker = ExchangeTracker::new();
        let (_, mut first) = tracker.register(Bytes::from_static(b"x")).unwrap();
        assert!(matches!(
            tracker.register(Bytes::from_static(b"x")),
            Err(SessionError::TokenInUse)
        ));
        assert!(first.try_recv().is_err());

        assert!(tracker.resolve(response(&pool, b"x")).is_ok());
        assert!(first.await.unwrap().is_ok());
        assert!(tracker.register(Bytes::from_static(b"x")).is_ok());
    }

    #[tokio::test]
    async fn test_stale_registration_leaves_reuse_alone() {
        let tracker = ExchangeTracker::new();
        let (old, _old_rx) = tracker.register(Bytes::from_static(b"r")).unwrap();
        assert!(tracker.cancel(&old));

        let (_new, mut new_rx) = tracker.register(Bytes::from_static(b"r")).unwrap();
        assert!(!tracker.cancel(&old));
        assert!(!tracker.fail_registration(&old, SessionError::PeerReset));
        assert!(tracker.contains(&Bytes::from_static(b"r")));
        assert!(new_rx.try_recv().is_err());
    }

    #[test]
    #[should_panic(expected = "exchange completed twice")]
    fn test_double_completion_panics() {
        let (tx, _rx) = oneshot::channel();
        let mut exchange = Exchange::new(0, tx);
        exchange.complete(Err(SessionError::PeerReset));
        exchange.complete(Err(SessionError::PeerReset));
    }
}
