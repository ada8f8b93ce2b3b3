//! Cancellation and deadlines for blocking calls.
//!
//! Every blocking operation (`Conn::do_request`, `Conn::ping`,
//! `Server::discover`) takes a [`Context`]. A context ends when its cancel
//! handle fires or its deadline passes, whichever comes first.

use crate::error::SessionError;
use std::future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation signal and optional deadline
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels the contexts derived from it
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel the associated contexts. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// Context that never ends on its own
    pub fn background() -> Self {
        Self::default()
    }

    /// Context ending `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Context ending at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Cancellable context and its handle
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: None,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// Derive a context whose deadline is at most `timeout` from now
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(at),
            None => at,
        });
        self
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Reason the context ended, if it already has
    pub fn err(&self) -> Option<SessionError> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Some(SessionError::Cancelled);
            }
        }
        match self.deadline {
            Some(at) if Instant::now() >= at => Some(SessionError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Wait until the context ends and return the reason
    pub async fn done(&self) -> SessionError {
        let cancelled = async {
            match &self.cancel {
                Some(rx) => {
                    let mut rx = rx.clone();
                    // a dropped handle can no longer cancel
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        future::pending::<()>().await;
                    }
                }
                None => future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => SessionError::Cancelled,
            _ = expired => SessionError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel() {
        let (ctx, handle) = Context::with_cancel();
        assert!(ctx.err().is_none());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.done().await })
        };
        handle.cancel();

        let reason = waiter.await.unwrap();
        assert!(matches!(reason, SessionError::Cancelled));
        assert!(matches!(ctx.err(), Some(SessionError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        assert!(ctx.err().is_none());
        assert!(matches!(ctx.done().await, SessionError::DeadlineExceeded));
        assert!(matches!(ctx.err(), Some(SessionError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_earliest_deadline() {
        let ctx = Context::with_timeout(Duration::from_millis(10)).timeout(Duration::from_secs(5));
        let deadline = ctx.deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_does_not_cancel() {
        let (ctx, handle) = Context::with_cancel();
        drop(handle);
        let ctx = ctx.timeout(Duration::from_millis(20));
        assert!(matches!(ctx.done().await, SessionError::DeadlineExceeded));
    }
}
