//! Server, connection and client configuration.

use crate::conn::{Conn, Handler, ResponseWriter};
use crate::monitor::{InactivityConfig, KeepaliveConfig, OnInactiveFn};
use crate::periodic::{PeriodicRunner, DEFAULT_PERIODIC_INTERVAL};
use crate::pool::{MessagePool, PooledMessage};
use crate::retransmit::TransmissionParams;
use crate::transport::MAX_DATAGRAM_SIZE;
use coap_wire::{Code, DEFAULT_MAX_MESSAGE_SIZE};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default inbound queue capacity per connection
pub const DEFAULT_RECEIVED_MESSAGE_QUEUE_SIZE: usize = 16;

/// Callback invoked once per newly created connection
pub type OnNewConnFn = Arc<dyn Fn(&Conn) + Send + Sync>;

/// Dispatch of inbound requests to the handler.
///
/// The default calls [`Conn::process_received_message_with_handler`]; a custom
/// function can wrap it for instrumentation.
pub type ProcessReceivedMessageFn =
    Arc<dyn Fn(PooledMessage, Conn, Arc<dyn Handler>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Engine configuration
#[derive(Clone)]
pub struct Config {
    /// Request handler
    pub handler: Arc<dyn Handler>,
    /// Called once for every connection the server creates
    pub on_new_conn: Option<OnNewConnFn>,
    /// Inactivity monitor
    pub inactivity: Option<InactivityConfig>,
    /// Keepalive monitor
    pub keepalive: Option<KeepaliveConfig>,
    /// Tick interval of the runner created when none is supplied
    pub periodic_interval: Duration,
    /// Shared runner
    pub periodic_runner: Option<PeriodicRunner>,
    /// Inbound queue capacity per connection
    pub received_message_queue_size: usize,
    /// Request dispatch function
    pub process_received_message: ProcessReceivedMessageFn,
    /// Retransmission parameters
    pub transmission: TransmissionParams,
    /// Deduplication window; defaults to the exchange lifetime
    pub dedup_window: Option<Duration>,
    /// Largest datagram accepted or produced
    pub max_message_size: usize,
    /// Pool received messages are taken from
    pub message_pool: MessagePool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handler: Arc::new(not_found),
            on_new_conn: None,
            inactivity: None,
            keepalive: None,
            periodic_interval: DEFAULT_PERIODIC_INTERVAL,
            periodic_runner: None,
            received_message_queue_size: DEFAULT_RECEIVED_MESSAGE_QUEUE_SIZE,
            process_received_message: default_process_received_message(),
            transmission: TransmissionParams::default(),
            dedup_window: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            message_pool: MessagePool::default(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("on_new_conn", &self.on_new_conn.is_some())
            .field("inactivity", &self.inactivity)
            .field("keepalive", &self.keepalive)
            .field("periodic_interval", &self.periodic_interval)
            .field("periodic_runner", &self.periodic_runner)
            .field("received_message_queue_size", &self.received_message_queue_size)
            .field("transmission", &self.transmission)
            .field("dedup_window", &self.dedup_window())
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request handler
    pub fn with_handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Set the new-connection callback
    pub fn with_on_new_conn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn) + Send + Sync + 'static,
    {
        self.on_new_conn = Some(Arc::new(f));
        self
    }

    /// Enable the inactivity monitor
    pub fn with_inactivity_monitor<F>(mut self, timeout: Duration, on_inactive: F) -> Self
    where
        F: Fn(&Conn) + Send + Sync + 'static,
    {
        self.inactivity = Some(InactivityConfig {
            timeout,
            on_inactive: Arc::new(on_inactive) as OnInactiveFn,
        });
        self
    }

    /// Enable the keepalive monitor
    pub fn with_keepalive<F>(mut self, max_failures: u32, interval: Duration, on_inactive: F) -> Self
    where
        F: Fn(&Conn) + Send + Sync + 'static,
    {
        self.keepalive = Some(KeepaliveConfig {
            max_failures: max_failures.max(1),
            interval,
            on_inactive: Arc::new(on_inactive) as OnInactiveFn,
        });
        self
    }

    /// Tick interval of the runner created by the server or client
    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Use a shared periodic runner
    pub fn with_periodic_runner(mut self, runner: PeriodicRunner) -> Self {
        self.periodic_runner = Some(runner);
        self
    }

    /// Inbound queue capacity per connection
    pub fn with_received_message_queue_size(mut self, size: usize) -> Self {
        self.received_message_queue_size = size.max(1);
        self
    }

    /// Replace the request dispatch function
    pub fn with_process_received_message<F>(mut self, f: F) -> Self
    where
        F: Fn(PooledMessage, Conn, Arc<dyn Handler>) -> BoxFuture<'static, ()>
            + Send
            + Sync
            + 'static,
    {
        self.process_received_message = Arc::new(f);
        self
    }

    /// Retransmission parameters
    pub fn with_transmission(mut self, params: TransmissionParams) -> Self {
        self.transmission = params;
        self
    }

    /// Deduplication window
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = Some(window);
        self
    }

    /// Largest datagram accepted or produced, at most [`MAX_DATAGRAM_SIZE`]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size.min(MAX_DATAGRAM_SIZE);
        self
    }

    /// Message pool
    pub fn with_message_pool(mut self, pool: MessagePool) -> Self {
        self.message_pool = pool;
        self
    }

    /// Effective deduplication window
    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
            .unwrap_or_else(|| self.transmission.exchange_lifetime())
    }

    /// The supplied runner, or a new one ticking at `periodic_interval`
    pub(crate) fn runner(&self) -> PeriodicRunner {
        self.periodic_runner
            .clone()
            .unwrap_or_else(|| PeriodicRunner::new(self.periodic_interval))
    }
}

fn not_found(w: &mut ResponseWriter, _req: &PooledMessage) {
    w.set_code(Code::NOT_FOUND);
}

/// Dispatch function used unless one is configured
pub fn default_process_received_message() -> ProcessReceivedMessageFn {
    Arc::new(|msg, conn, handler| {
        Box::pin(async move {
            conn.process_received_message_with_handler(msg, handler.as_ref())
                .await;
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.received_message_queue_size, 16);
        assert_eq!(cfg.max_message_size, 65535);
        assert_eq!(cfg.periodic_interval, Duration::from_millis(250));
        assert_eq!(cfg.transmission.max_attempts, 4);
        assert_eq!(cfg.dedup_window(), cfg.transmission.exchange_lifetime());
        assert!(cfg.dedup_window() >= cfg.transmission.max_transmit_wait());
    }

    #[test]
    fn test_builder() {
        let cfg = Config::new()
            .with_received_message_queue_size(0)
            .with_dedup_window(Duration::from_secs(3))
            .with_keepalive(0, Duration::from_millis(100), |_| {})
            .with_inactivity_monitor(Duration::from_secs(1), |_| {})
            .with_max_message_size(1152);

        assert_eq!(cfg.received_message_queue_size, 1);
        assert_eq!(cfg.dedup_window(), Duration::from_secs(3));
        assert_eq!(cfg.keepalive.as_ref().map(|k| k.max_failures), Some(1));
        assert_eq!(
            cfg.inactivity.as_ref().map(|i| i.timeout),
            Some(Duration::from_secs(1))
        );
        assert_eq!(cfg.max_message_size, 1152);
    }

    #[test]
    fn test_max_message_size_clamped() {
        let cfg = Config::new().with_max_message_size(usize::MAX);
        assert_eq!(cfg.max_message_size, MAX_DATAGRAM_SIZE);
    }
}
