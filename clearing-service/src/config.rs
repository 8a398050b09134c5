//! Configuration for the clearing node

use crate::{Error, Result};
use message_bus::{NatsConfig, PublisherConfig, SubscriberConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use transfer_saga::{HttpConfig, LogConfig, RelayConfig};

/// Clearing node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearingConfig {
    /// Participant name used for durable consumers and relay ownership
    pub participant: String,

    /// Ledger store holding routing entries and bookkeeping rows
    pub ledger: ledger_core::Config,

    /// NATS connection
    pub nats: NatsConfig,

    /// Publisher retry policy
    pub publisher: PublisherConfig,

    /// Subscriber lanes and acking
    pub subscriber: SubscriberConfig,

    /// Outbox relay
    pub relay: RelayConfig,

    /// REST surface
    pub http: HttpConfig,

    /// Log output
    pub log: LogConfig,
}

impl Default for ClearingConfig {
    fn default() -> Self {
        Self {
            participant: "clearing".to_string(),
            ledger: ledger_core::Config::with_data_dir(PathBuf::from("./data/clearing")),
            nats: NatsConfig::default(),
            publisher: PublisherConfig::default(),
            subscriber: SubscriberConfig::default(),
            relay: RelayConfig::default(),
            http: HttpConfig {
                listen_addr: "0.0.0.0:8090".to_string(),
            },
            log: LogConfig::default(),
        }
    }
}

impl ClearingConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClearingConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let config = ClearingConfig::default().with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `CLEARING_*`, `NATS_URL` and `LEDGER_DATA_DIR` overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(participant) = std::env::var("CLEARING_PARTICIPANT") {
            self.participant = participant;
        }
        if let Ok(addr) = std::env::var("CLEARING_HTTP_ADDR") {
            self.http.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("NATS_URL") {
            self.nats.url = url;
        }
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            self.ledger.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(json) = std::env::var("LOG_JSON") {
            self.log.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        self
    }

    /// Reject unusable values
    pub fn validate(&self) -> Result<()> {
        if self.participant.trim().is_empty() {
            return Err(Error::Config("participant must not be empty".to_string()));
        }
        if self.relay.batch_size == 0 {
            return Err(Error::Config("relay.batch_size must be at least 1".to_string()));
        }
        self.ledger.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClearingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http.listen_addr, "0.0.0.0:8090");
        assert_eq!(config.ledger.data_dir, PathBuf::from("./data/clearing"));
    }

    #[test]
    fn test_from_toml() {
        let config: ClearingConfig = toml::from_str(
            r#"
            participant = "clearing-east"

            [relay]
            batch_size = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.participant, "clearing-east");
        assert_eq!(config.relay.batch_size, 500);
        assert_eq!(config.relay.poll_interval_ms, 1_000);
    }
}
