//! Configuration handling for the CoAP service.
//!
//! Settings come from the shared platform config file (the `services.coap`
//! section), then from environment variables, and finally from command line
//! flags applied by `main`.

use anyhow::{Context, Result};
use coap_session::{Config, TransmissionParams};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// CoAP service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoapConfig {
    /// UDP address the server listens on
    pub listen_addr: SocketAddr,
    /// Initial acknowledgment timeout in milliseconds
    pub ack_timeout_ms: u64,
    /// Backoff multiplier between retransmissions
    pub backoff_factor: u32,
    /// Transmissions of a confirmable message before giving up
    pub max_attempts: u32,
    /// Inbound queue capacity per connection
    pub queue_size: usize,
    /// Largest datagram accepted or produced
    pub max_message_size: usize,
    /// Close connections idle for this long
    pub inactivity_timeout: Option<Duration>,
    /// Probe idle connections at this interval
    pub keepalive_interval: Option<Duration>,
    /// Unanswered probes before a connection is closed
    pub keepalive_max_failures: u32,
    /// Periodic runner tick
    pub periodic_interval: Duration,
}

impl Default for CoapConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5683)),
            ack_timeout_ms: 2000,
            backoff_factor: 2,
            max_attempts: 4,
            queue_size: coap_session::DEFAULT_RECEIVED_MESSAGE_QUEUE_SIZE,
            max_message_size: coap_wire::DEFAULT_MAX_MESSAGE_SIZE,
            inactivity_timeout: None,
            keepalive_interval: None,
            keepalive_max_failures: 3,
            periodic_interval: coap_session::DEFAULT_PERIODIC_INTERVAL,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    coap: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl CoapConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?;
                if let Some(service) = root.services.and_then(|s| s.coap) {
                    config.apply_service_config(service)?;
                }
                info!("Loaded configuration from {}", path.display());
            }
            Err(_) => {
                warn!("Config file {} not found, using defaults", path.display());
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final CoAP configuration: listen_addr={}, ack_timeout_ms={}, max_attempts={}, queue_size={}",
            config.listen_addr, config.ack_timeout_ms, config.max_attempts, config.queue_size
        );
        Ok(config)
    }

    /// Apply the `services.coap` section
    fn apply_service_config(&mut self, service: ServiceConfig) -> Result<()> {
        for arg in service.args.unwrap_or_default() {
            if let Some(addr) = arg.strip_prefix("--listen=") {
                self.listen_addr = addr
                    .parse()
                    .with_context(|| format!("invalid --listen argument {addr:?}"))?;
            }
        }

        for (key, value) in service.config.unwrap_or_default() {
            let Some(name) = key.strip_prefix("services.coap.") else {
                continue;
            };
            match name {
                "listen_addr" => self.listen_addr = parse(&key, &value)?,
                "ack_timeout_ms" => self.ack_timeout_ms = parse(&key, &value)?,
                "backoff_factor" => self.backoff_factor = parse(&key, &value)?,
                "max_attempts" => self.max_attempts = parse(&key, &value)?,
                "queue_size" => self.queue_size = parse(&key, &value)?,
                "max_message_size" => self.max_message_size = parse(&key, &value)?,
                "inactivity_timeout" => self.inactivity_timeout = Some(duration(&key, &value)?),
                "keepalive_interval" => self.keepalive_interval = Some(duration(&key, &value)?),
                "keepalive_max_failures" => self.keepalive_max_failures = parse(&key, &value)?,
                "periodic_interval" => self.periodic_interval = duration(&key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Apply environment overrides through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("COAP_LISTEN_ADDR") {
            self.listen_addr = parse("COAP_LISTEN_ADDR", &value)?;
            info!("Listen address overridden by environment: {}", self.listen_addr);
        }
        if let Some(value) = lookup("COAP_ACK_TIMEOUT_MS") {
            self.ack_timeout_ms = parse("COAP_ACK_TIMEOUT_MS", &value)?;
            info!("ACK timeout overridden by environment: {}ms", self.ack_timeout_ms);
        }
        if let Some(value) = lookup("COAP_MAX_ATTEMPTS") {
            self.max_attempts = parse("COAP_MAX_ATTEMPTS", &value)?;
            info!("Max attempts overridden by environment: {}", self.max_attempts);
        }
        if let Some(value) = lookup("COAP_QUEUE_SIZE") {
            self.queue_size = parse("COAP_QUEUE_SIZE", &value)?;
            info!("Queue size overridden by environment: {}", self.queue_size);
        }
        if let Some(value) = lookup("COAP_INACTIVITY_TIMEOUT") {
            self.inactivity_timeout = Some(duration("COAP_INACTIVITY_TIMEOUT", &value)?);
            info!("Inactivity timeout overridden by environment: {}", value);
        }
        Ok(())
    }

    /// Retransmission parameters
    pub fn transmission(&self) -> TransmissionParams {
        TransmissionParams {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            backoff_factor: self.backoff_factor,
            max_attempts: self.max_attempts,
        }
    }

    /// Engine configuration without handler or monitors
    pub fn session_config(&self) -> Config {
        Config::new()
            .with_transmission(self.transmission())
            .with_received_message_queue_size(self.queue_size)
            .with_max_message_size(self.max_message_size)
            .with_periodic_interval(self.periodic_interval)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value {value:?} for {key}"))
}

fn duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("invalid duration {value:?} for {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CoapConfig::default();
        assert_eq!(config.listen_addr.port(), 5683);
        assert_eq!(config.ack_timeout_ms, 2000);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.queue_size, 16);
        assert_eq!(config.transmission(), TransmissionParams::default());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
supervisor:
  port: 50000

services:
  coap:
    enabled: true
    executable: ./redb-coap
    args:
      - --listen=127.0.0.1:15683
    config:
      services.coap.ack_timeout_ms: "500"
      services.coap.max_attempts: "6"
      services.coap.inactivity_timeout: "30s"
      services.coap.keepalive_interval: "5s"
      services.coap.unknown: "ignored"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = CoapConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:15683".parse().unwrap());
        assert_eq!(config.ack_timeout_ms, 500);
        assert_eq!(config.max_attempts, 6);
        assert_eq!(config.inactivity_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.backoff_factor, 2);
    }

    #[test]
    fn test_invalid_value_rejected() {
        let yaml_content = r#"
services:
  coap:
    config:
      services.coap.queue_size: "many"
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let err = CoapConfig::load_from_file(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("services.coap.queue_size"));
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("COAP_LISTEN_ADDR", "[::1]:5684"),
            ("COAP_ACK_TIMEOUT_MS", "250"),
            ("COAP_QUEUE_SIZE", "64"),
            ("COAP_INACTIVITY_TIMEOUT", "1m"),
        ]
        .into_iter()
        .collect();

        let mut config = CoapConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.listen_addr, "[::1]:5684".parse().unwrap());
        assert_eq!(config.ack_timeout_ms, 250);
        assert_eq!(config.queue_size, 64);
        assert_eq!(config.inactivity_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_attempts, 4);
    }
}
