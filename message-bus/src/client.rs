//! NATS connection and JetStream stream management

use crate::{types::Subjects, Error, Result};
use async_nats::jetstream::{
    self,
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
};
use ledger_core::types::Stage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info};

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Connection name shown by the server
    pub connection_name: String,

    /// Subject prefix shared by all participants
    pub subject_prefix: String,

    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Stream retention (seconds)
    pub max_age_secs: u64,

    /// Broker-side dedup window on `Nats-Msg-Id` (seconds)
    pub duplicate_window_secs: u64,

    /// Stream replicas
    pub num_replicas: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            connection_name: "bankgood".to_string(),
            subject_prefix: "bankgood".to_string(),
            connect_timeout_ms: 5_000,
            max_age_secs: 7 * 24 * 3600,
            duplicate_window_secs: 300,
            num_replicas: 1,
        }
    }
}

/// Lazily connected NATS client
#[derive(Debug)]
pub struct NatsClient {
    config: NatsConfig,
    subjects: Subjects,
    client: OnceCell<async_nats::Client>,
}

impl NatsClient {
    /// Create new client; the connection is opened on first use
    pub fn new(config: NatsConfig) -> Self {
        let subjects = Subjects::new(config.subject_prefix.clone());
        Self {
            config,
            subjects,
            client: OnceCell::new(),
        }
    }

    /// Configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Subject layout
    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    /// Core NATS client
    pub async fn client(&self) -> Result<&async_nats::Client> {
        self.client
            .get_or_try_init(|| async {
                info!(url = %self.config.url, "Connecting to NATS");
                let client = async_nats::ConnectOptions::new()
                    .name(self.config.connection_name.clone())
                    .connection_timeout(Duration::from_millis(self.config.connect_timeout_ms))
                    .connect(self.config.url.as_str())
                    .await
                    .map_err(|e| Error::Connection(e.to_string()))?;
                crate::metrics::NATS_CONNECTION_STATUS
                    .with_label_values(&["connected"])
                    .inc();
                Ok(client)
            })
            .await
    }

    /// JetStream context
    pub async fn jetstream(&self) -> Result<jetstream::Context> {
        Ok(jetstream::new(self.client().await?.clone()))
    }

    /// Create the stream for a stage if missing
    pub async fn ensure_stream(&self, stage: Stage) -> Result<jetstream::stream::Stream> {
        let js = self.jetstream().await?;
        let name = self.subjects.stream_name(stage);

        let config = StreamConfig {
            name: name.clone(),
            description: Some(format!("Bankgood {}", stage)),
            subjects: vec![self.subjects.stage_filter(stage)],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(self.config.max_age_secs),
            storage: StorageType::File,
            num_replicas: self.config.num_replicas,
            duplicate_window: Duration::from_secs(self.config.duplicate_window_secs),
            ..Default::default()
        };

        js.get_or_create_stream(config).await.map_err(|e| {
            error!(stream = %name, error = %e, "Failed to create stream");
            Error::JetStream(e.to_string())
        })
    }

    /// Create streams for every stage
    pub async fn ensure_streams(&self) -> Result<()> {
        for stage in Stage::ALL {
            self.ensure_stream(stage).await?;
        }
        info!("JetStream streams ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.subject_prefix, "bankgood");
        assert_eq!(config.duplicate_window_secs, 300);
    }

    #[tokio::test]
    async fn test_client_is_lazy() {
        let client = NatsClient::new(NatsConfig::default());
        assert_eq!(
            client.subjects().stream_name(Stage::Initiated),
            "BANKGOOD_TRANSACTIONS_INITIATED"
        );
    }
}
