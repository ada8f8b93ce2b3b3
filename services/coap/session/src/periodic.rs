//! Shared periodic runner driving every time-based check.
//!
//! A single tokio task ticks at a fixed interval and calls each registered
//! [`PeriodicJob`]. Connections register one job each, so the number of live
//! timers does not grow with the number of connections or pending messages.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

/// Default tick interval
pub const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_millis(250);

/// Work executed on every tick
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Run one tick; return `false` to unregister the job
    async fn tick(&self, now: Instant) -> bool;
}

/// Registration handle
pub type JobId = u64;

struct RunnerInner {
    interval: Duration,
    jobs: DashMap<JobId, Arc<dyn PeriodicJob>>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RunnerInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Shared ticking driver
#[derive(Clone)]
pub struct PeriodicRunner {
    inner: Arc<RunnerInner>,
}

impl fmt::Debug for PeriodicRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicRunner")
            .field("interval", &self.inner.interval)
            .field("jobs", &self.inner.jobs.len())
            .finish()
    }
}

impl Default for PeriodicRunner {
    fn default() -> Self {
        Self::new(DEFAULT_PERIODIC_INTERVAL)
    }
}

impl PeriodicRunner {
    /// Create a runner; its task starts with the first registration
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                interval,
                jobs: DashMap::new(),
                next_id: AtomicU64::new(1),
                task: Mutex::new(None),
            }),
        }
    }

    /// Tick interval
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Register a job. Must be called from within a tokio runtime.
    pub fn register(&self, job: Arc<dyn PeriodicJob>) -> JobId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.jobs.insert(id, job);
        self.ensure_started();
        id
    }

    /// Remove a job; it will not be ticked again after the current tick
    pub fn unregister(&self, id: JobId) -> bool {
        self.inner.jobs.remove(&id).is_some()
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Whether no job is registered
    pub fn is_empty(&self) -> bool {
        self.inner.jobs.is_empty()
    }

    fn ensure_started(&self) {
        let mut task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.interval;
        *task = Some(tokio::spawn(run(weak, period)));
        debug!(interval = ?period, "Periodic runner started");
    }
}

async fn run(runner: Weak<RunnerInner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let now = ticker.tick().await;

        let Some(inner) = runner.upgrade() else {
            break;
        };
        let jobs: Vec<(JobId, Arc<dyn PeriodicJob>)> = inner
            .jobs
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        drop(inner);

        let results = join_all(jobs.iter().map(|(_, job)| job.tick(now))).await;

        let Some(inner) = runner.upgrade() else {
            break;
        };
        for ((id, _), keep) in jobs.iter().zip(results) {
            if !keep {
                inner.jobs.remove(id);
            }
        }
    }
}
