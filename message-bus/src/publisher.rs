//! JetStream publisher with retry logic

use crate::{
    client::NatsClient,
    message::{Message, MSG_ID_HEADER},
    metrics::{MESSAGE_PUBLISH_DURATION, MESSAGE_PUBLISH_TOTAL},
    transport::Transport,
    Error, Result,
};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Per-attempt ack timeout (milliseconds)
    pub publish_timeout_ms: u64,

    /// Initial retry delay (milliseconds)
    pub initial_retry_delay_ms: u64,

    /// Max retry delay (milliseconds)
    pub max_retry_delay_ms: u64,

    /// Give up after this long and leave the record to the next relay tick
    /// (milliseconds)
    pub max_elapsed_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publish_timeout_ms: 5_000,
            initial_retry_delay_ms: 100,
            max_retry_delay_ms: 2_000,
            max_elapsed_ms: 10_000,
        }
    }
}

/// Message publisher
#[derive(Debug)]
pub struct JetStreamPublisher {
    client: Arc<NatsClient>,
    config: PublisherConfig,
}

impl JetStreamPublisher {
    /// Create new publisher
    pub fn new(client: Arc<NatsClient>, config: PublisherConfig) -> Self {
        Self { client, config }
    }

    /// Single publish attempt, resolved by the JetStream ack
    async fn publish_once(&self, subject: &str, message: &Message) -> Result<()> {
        self.client.ensure_stream(message.stage).await?;
        let js = self.client.jetstream().await?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, message.id.as_str());
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        let timeout = Duration::from_millis(self.config.publish_timeout_ms);
        let ack = js
            .publish_with_headers(subject.to_string(), headers, message.body.clone())
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;

        let ack = tokio::time::timeout(timeout, ack)
            .await
            .map_err(|_| Error::Timeout(self.config.publish_timeout_ms))?
            .map_err(|e| Error::JetStream(format!("Publish ack failed: {}", e)))?;

        if ack.duplicate {
            debug!(message_id = %message.id, "Broker reported duplicate publish");
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for JetStreamPublisher {
    async fn publish(&self, message: &Message) -> Result<()> {
        let start = Instant::now();
        let subject = message.subject(self.client.subjects());
        let stage = message.stage.as_str();

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_retry_delay_ms))
            .with_max_interval(Duration::from_millis(self.config.max_retry_delay_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.config.max_elapsed_ms)))
            .build();

        let subject_ref = subject.as_str();
        let result = backoff::future::retry(policy, move || async move {
            self.publish_once(subject_ref, message).await.map_err(|e| {
                warn!(
                    message_id = %message.id,
                    subject = subject_ref,
                    error = %e,
                    "Publish failed, retrying"
                );
                backoff::Error::transient(e)
            })
        })
        .await;

        MESSAGE_PUBLISH_DURATION
            .with_label_values(&[stage])
            .observe(start.elapsed().as_secs_f64());

        let status = if result.is_ok() { "success" } else { "error" };
        MESSAGE_PUBLISH_TOTAL
            .with_label_values(&[stage, status])
            .inc();

        if result.is_ok() {
            debug!(message_id = %message.id, subject = %subject, "Message published");
        }
        result
    }
}
