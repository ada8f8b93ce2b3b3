//! Inactivity and keepalive monitors.
//!
//! Both monitors only notify: the registered callback decides whether the
//! connection is closed. Each fires at most once per arming.

use crate::conn::Conn;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Callback invoked when a monitor gives up on a connection
pub type OnInactiveFn = Arc<dyn Fn(&Conn) + Send + Sync>;

/// Inactivity monitor settings
#[derive(Clone)]
pub struct InactivityConfig {
    /// Idle time after which the callback fires
    pub timeout: Duration,
    /// Callback
    pub on_inactive: OnInactiveFn,
}

impl fmt::Debug for InactivityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InactivityConfig")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Keepalive monitor settings
#[derive(Clone)]
pub struct KeepaliveConfig {
    /// Consecutive unanswered probes before the callback fires
    pub max_failures: u32,
    /// Idle time before probing, and time a probe may stay unanswered
    pub interval: Duration,
    /// Callback
    pub on_inactive: OnInactiveFn,
}

impl fmt::Debug for KeepaliveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepaliveConfig")
            .field("max_failures", &self.max_failures)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Inactivity state; re-armed by new activity
#[derive(Debug, Default)]
pub(crate) struct InactivityState {
    notified_for: Option<Instant>,
}

impl InactivityState {
    /// Whether the callback must fire now
    pub(crate) fn check(&mut self, last_activity: Instant, now: Instant, timeout: Duration) -> bool {
        if now.saturating_duration_since(last_activity) < timeout {
            return false;
        }
        if self.notified_for == Some(last_activity) {
            return false;
        }
        self.notified_for = Some(last_activity);
        true
    }
}

/// What the keepalive monitor wants done on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveAction {
    Idle,
    Probe,
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    message_id: u16,
    sent_at: Instant,
}

/// Keepalive state: outstanding probe and consecutive failures
#[derive(Debug, Default)]
pub(crate) struct KeepaliveState {
    probe: Option<Probe>,
    failures: u32,
    notified: bool,
}

impl KeepaliveState {
    pub(crate) fn poll(
        &mut self,
        now: Instant,
        last_activity: Instant,
        cfg: &KeepaliveConfig,
    ) -> KeepaliveAction {
        match self.probe {
            Some(probe) if now.saturating_duration_since(probe.sent_at) >= cfg.interval => {
                self.probe = None;
                self.failures += 1;
                debug!(
                    message_id = probe.message_id,
                    failures = self.failures,
                    "Keepalive probe unanswered"
                );
                if self.failures >= cfg.max_failures && !self.notified {
                    self.notified = true;
                    return KeepaliveAction::Exhausted;
                }
                KeepaliveAction::Probe
            }
            Some(_) => KeepaliveAction::Idle,
            None if now.saturating_duration_since(last_activity) >= cfg.interval => {
                KeepaliveAction::Probe
            }
            None => KeepaliveAction::Idle,
        }
    }

    pub(crate) fn probe_sent(&mut self, message_id: u16, now: Instant) {
        self.probe = Some(Probe {
            message_id,
            sent_at: now,
        });
    }

    /// The peer answered the probe `message_id`; reset and re-arm
    pub(crate) fn probe_answered(&mut self, message_id: u16) {
        if self.probe.map(|p| p.message_id) == Some(message_id) {
            self.probe = None;
            self.failures = 0;
            self.notified = false;
        }
    }

    /// Message id of the outstanding probe
    pub(crate) fn outstanding(&self) -> Option<u16> {
        self.probe.map(|p| p.message_id)
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepalive(max_failures: u32) -> KeepaliveConfig {
        KeepaliveConfig {
            max_failures,
            interval: Duration::from_millis(100),
            on_inactive: Arc::new(|_| {}),
        }
    }

    #[test]
    fn test_inactivity_fires_once_per_activity() {
        let mut state = InactivityState::default();
        let timeout = Duration::from_millis(100);
        let t0 = Instant::now();

        assert!(!state.check(t0, t0 + Duration::from_millis(50), timeout));
        assert!(state.check(t0, t0 + Duration::from_millis(100), timeout));
        assert!(!state.check(t0, t0 + Duration::from_millis(500), timeout));

        // new activity re-arms
        let t1 = t0 + Duration::from_millis(600);
        assert!(!state.check(t1, t1 + Duration::from_millis(10), timeout));
        assert!(state.check(t1, t1 + Duration::from_millis(150), timeout));
    }

    #[test]
    fn test_keepalive_exhaustion() {
        let cfg = keepalive(3);
        let mut state = KeepaliveState::default();
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        assert_eq!(state.poll(t0, t0, &cfg), KeepaliveAction::Idle);

        let mut now = t0 + step;
        assert_eq!(state.poll(now, t0, &cfg), KeepaliveAction::Probe);
        state.probe_sent(1, now);
        assert_eq!(state.poll(now + Duration::from_millis(50), t0, &cfg), KeepaliveAction::Idle);

        now += step;
        assert_eq!(state.poll(now, t0, &cfg), KeepaliveAction::Probe);
        state.probe_sent(2, now);
        now += step;
        assert_eq!(state.poll(now, t0, &cfg), KeepaliveAction::Probe);
        state.probe_sent(3, now);
        now += step;
        assert_eq!(state.poll(now, t0, &cfg), KeepaliveAction::Exhausted);
        assert_eq!(state.failures(), 3);

        // keeps probing but never notifies twice
        state.probe_sent(4, now);
        now += step;
        assert_eq!(state.poll(now, t0, &cfg), KeepaliveAction::Probe);
    }

    #[test]
    fn test_keepalive_answer_resets() {
        let cfg = keepalive(2);
        let mut state = KeepaliveState::default();
        let t0 = Instant::now();
        let step = Duration::from_millis(100);

        state.probe_sent(1, t0);
        assert_eq!(state.poll(t0 + step, t0, &cfg), KeepaliveAction::Probe);
        state.probe_sent(2, t0 + step);

        // a late answer to an old probe does not count
        state.probe_answered(1);
        assert_eq!(state.failures(), 1);

        state.probe_answered(2);
        assert_eq!(state.failures(), 0);
        let last = t0 + step + Duration::from_millis(10);
        assert_eq!(state.poll(last + Duration::from_millis(50), last, &cfg), KeepaliveAction::Idle);
    }
}
