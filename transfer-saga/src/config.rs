//! Configuration for a bank node

use crate::{relay::RelayConfig, Error, Result};
use ledger_core::types::InstitutionId;
use message_bus::{NatsConfig, PublisherConfig, SubscriberConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bank node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BankConfig {
    /// This bank's clearing number
    pub institution_id: String,

    /// Participant name used for durable consumers and relay ownership
    pub participant: String,

    /// Ledger store
    pub ledger: ledger_core::Config,

    /// NATS connection
    pub nats: NatsConfig,

    /// Publisher retry policy
    pub publisher: PublisherConfig,

    /// Subscriber lanes and acking
    pub subscriber: SubscriberConfig,

    /// Outbox relay
    pub relay: RelayConfig,

    /// Reservation expiry
    pub expiry: ExpiryConfig,

    /// REST surface
    pub http: HttpConfig,

    /// Log output
    pub log: LogConfig,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            institution_id: "5000".to_string(),
            participant: "bank-5000".to_string(),
            ledger: ledger_core::Config::with_data_dir(PathBuf::from("./data/bank")),
            nats: NatsConfig::default(),
            publisher: PublisherConfig::default(),
            subscriber: SubscriberConfig::default(),
            relay: RelayConfig::default(),
            expiry: ExpiryConfig::default(),
            http: HttpConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Reservation expiry. Disabled unless `reservation_ttl_secs` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Age after which a PENDING reservation is released
    pub reservation_ttl_secs: Option<u64>,

    /// Sweep interval (milliseconds)
    pub sweep_interval_ms: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: None,
            sweep_interval_ms: 60_000,
        }
    }
}

impl ExpiryConfig {
    /// TTL when expiry is enabled
    pub fn reservation_ttl(&self) -> Option<Duration> {
        self.reservation_ttl_secs.map(Duration::from_secs)
    }

    /// Sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl BankConfig {
    /// Typed institution id
    pub fn institution(&self) -> InstitutionId {
        InstitutionId::new(self.institution_id.clone())
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BankConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let config = BankConfig::default().with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BANK_*`, `NATS_URL` and `LEDGER_*` overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(id) = std::env::var("BANK_INSTITUTION_ID") {
            self.participant = format!("bank-{}", id);
            self.institution_id = id;
        }
        if let Ok(participant) = std::env::var("BANK_PARTICIPANT") {
            self.participant = participant;
        }
        if let Ok(addr) = std::env::var("BANK_HTTP_ADDR") {
            self.http.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("NATS_URL") {
            self.nats.url = url;
        }
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            self.ledger.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(ttl) = std::env::var("BANK_RESERVATION_TTL_SECS") {
            let secs = ttl
                .parse()
                .map_err(|_| Error::Config(format!("Invalid BANK_RESERVATION_TTL_SECS: {}", ttl)))?;
            self.expiry.reservation_ttl_secs = Some(secs);
        }
        if let Ok(json) = std::env::var("LOG_JSON") {
            self.log.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        Ok(self)
    }

    /// Reject unusable values
    pub fn validate(&self) -> Result<()> {
        if self.institution_id.trim().is_empty() {
            return Err(Error::Config("institution_id must not be empty".to_string()));
        }
        if self.relay.batch_size == 0 {
            return Err(Error::Config("relay.batch_size must be at least 1".to_string()));
        }
        if self.expiry.reservation_ttl_secs == Some(0) {
            return Err(Error::Config(
                "expiry.reservation_ttl_secs must be positive".to_string(),
            ));
        }
        self.ledger.validate()?;
        Ok(())
    }
}
