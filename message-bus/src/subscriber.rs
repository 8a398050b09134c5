//! JetStream subscriber with partitioned worker lanes
//!
//! One durable pull consumer per `(participant, stage)`. Deliveries are
//! fanned out to `lanes` worker tasks: messages sharing a partition key go to
//! the same lane and are handled in order, different keys run concurrently.
//!
//! A failing handler is retried in place on its lane before the delivery is
//! nak'd, so later messages for the same key wait behind it.

use crate::{
    client::NatsClient,
    events::SagaEvent,
    message::{Message, MSG_ID_HEADER},
    metrics::{MESSAGE_PROCESS_DURATION, MESSAGE_RECEIVE_TOTAL},
    partitioning::LaneAssigner,
    transport::MessageHandler,
    types::{PartitionKey, Subjects},
    Error, Result,
};
use async_nats::jetstream::{self, consumer};
use futures::StreamExt;
use ledger_core::types::Stage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Subscriber configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Worker lanes per subscription
    pub lanes: u32,

    /// Buffered deliveries per lane
    pub lane_capacity: usize,

    /// Acknowledgment wait time (seconds)
    pub ack_wait_secs: u64,

    /// Max delivery attempts, -1 for unlimited
    pub max_deliver: i64,

    /// Redelivery delay after a failed handler (milliseconds)
    pub nak_delay_ms: u64,

    /// Handler attempts on the lane before falling back to a nak
    pub lane_attempts: u32,

    /// Delay between in-lane attempts (milliseconds)
    pub lane_retry_delay_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            lane_capacity: 64,
            ack_wait_secs: 30,
            max_deliver: -1,
            nak_delay_ms: 1_000,
            lane_attempts: 5,
            lane_retry_delay_ms: 200,
        }
    }
}

/// Message subscriber
#[derive(Debug)]
pub struct Subscriber {
    client: Arc<NatsClient>,
    config: SubscriberConfig,
    durable_name: String,
    stage: Stage,
    key: Option<PartitionKey>,
}

type Delivery = (jetstream::Message, Message);

impl Subscriber {
    /// Create new subscriber for `stage`, narrowed to `key` when given
    pub fn new(
        client: Arc<NatsClient>,
        config: SubscriberConfig,
        participant: &str,
        stage: Stage,
        key: Option<PartitionKey>,
    ) -> Self {
        let durable_name = format!("{}-{}", sanitize_durable(participant), stage.token());
        Self {
            client,
            config,
            durable_name,
            stage,
            key,
        }
    }

    /// Durable consumer name
    pub fn durable_name(&self) -> &str {
        &self.durable_name
    }

    /// Consume until the stream ends or `shutdown` flips to `true`
    pub async fn run<H>(&self, handler: Arc<H>, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        let subjects = self.client.subjects().clone();
        let filter = subjects.filter(self.stage, self.key.as_ref());
        let stream = self.client.ensure_stream(self.stage).await?;

        let consumer_config = consumer::pull::Config {
            durable_name: Some(self.durable_name.clone()),
            filter_subject: filter.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            ack_wait: Duration::from_secs(self.config.ack_wait_secs),
            max_deliver: self.config.max_deliver,
            deliver_policy: consumer::DeliverPolicy::All,
            ..Default::default()
        };

        let consumer: consumer::PullConsumer = stream
            .get_or_create_consumer(&self.durable_name, consumer_config)
            .await
            .map_err(|e| Error::JetStream(e.to_string()))?;

        info!(
            durable = %self.durable_name,
            filter = %filter,
            lanes = self.config.lanes,
            "JetStream consumer ready"
        );

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        let assigner = LaneAssigner::new(self.config.lanes);
        let nak_delay = Duration::from_millis(self.config.nak_delay_ms);
        let retry = LaneRetry {
            attempts: self.config.lane_attempts.max(1),
            delay: Duration::from_millis(self.config.lane_retry_delay_ms),
        };
        let mut lanes = Vec::with_capacity(assigner.lanes());
        let mut workers = Vec::with_capacity(assigner.lanes());
        for lane in 0..assigner.lanes() {
            let (tx, rx) = mpsc::channel::<Delivery>(self.config.lane_capacity.max(1));
            workers.push(tokio::spawn(lane_worker(
                lane,
                rx,
                handler.clone(),
                self.stage,
                retry,
                nak_delay,
            )));
            lanes.push(tx);
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(durable = %self.durable_name, "Subscriber stopping");
                        break;
                    }
                }
                next = messages.next() => {
                    let delivery = match next {
                        None => break,
                        Some(Err(e)) => {
                            warn!(durable = %self.durable_name, error = %e, "Delivery error");
                            continue;
                        }
                        Some(Ok(delivery)) => delivery,
                    };

                    match decode_delivery(&subjects, &delivery) {
                        Ok(message) => {
                            MESSAGE_RECEIVE_TOTAL
                                .with_label_values(&[self.stage.as_str(), "success"])
                                .inc();
                            let lane = assigner.lane(&message.key);
                            if lanes[lane].send((delivery, message)).await.is_err() {
                                error!(lane, "Lane worker gone");
                                break;
                            }
                        }
                        Err(e) => {
                            error!(durable = %self.durable_name, error = %e, "Failed to parse message");
                            MESSAGE_RECEIVE_TOTAL
                                .with_label_values(&[self.stage.as_str(), "parse_error"])
                                .inc();
                            // Terminate bad message (won't be redelivered)
                            if let Err(term_err) = delivery.ack_with(jetstream::AckKind::Term).await {
                                error!("Failed to terminate bad message: {}", term_err);
                            }
                        }
                    }
                }
            }
        }

        drop(lanes);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Lane worker panicked");
            }
        }
        Ok(())
    }
}

/// Rebuild the envelope from a delivery; fails for bodies that can never decode
fn decode_delivery(subjects: &Subjects, delivery: &jetstream::Message) -> Result<Message> {
    let (stage, key) = subjects.parse(&delivery.subject.to_string())?;
    let event = SagaEvent::decode(stage, &delivery.payload)?;

    let id = delivery
        .headers
        .as_ref()
        .and_then(|headers| headers.get(MSG_ID_HEADER))
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| Message::id_for(&event.transaction_id(), stage));

    Ok(Message::new(id, stage, key, delivery.payload.clone()))
}

#[derive(Debug, Clone, Copy)]
struct LaneRetry {
    attempts: u32,
    delay: Duration,
}

/// Run `handler` until it succeeds, reports poison or exhausts `retry.attempts`
async fn handle_in_lane<H>(lane: usize, handler: &H, message: Message, retry: LaneRetry) -> Result<()>
where
    H: MessageHandler + ?Sized,
{
    let mut attempt = 1;
    loop {
        match handler.handle(message.clone()).await {
            Err(e) if !e.is_poison() && attempt < retry.attempts => {
                warn!(
                    lane,
                    message_id = %message.id,
                    attempt,
                    error = %e,
                    "Handler failed, retrying in lane"
                );
                attempt += 1;
                tokio::time::sleep(retry.delay).await;
            }
            outcome => return outcome,
        }
    }
}

async fn lane_worker<H>(
    lane: usize,
    mut rx: mpsc::Receiver<Delivery>,
    handler: Arc<H>,
    stage: Stage,
    retry: LaneRetry,
    nak_delay: Duration,
) where
    H: MessageHandler + 'static,
{
    while let Some((delivery, message)) = rx.recv().await {
        let start = Instant::now();
        let message_id = message.id.clone();

        match handle_in_lane(lane, handler.as_ref(), message, retry).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(lane, message_id = %message_id, "Failed to ack message: {}", e);
                }
                MESSAGE_PROCESS_DURATION
                    .with_label_values(&[stage.as_str()])
                    .observe(start.elapsed().as_secs_f64());
                debug!(lane, message_id = %message_id, "Message handled");
            }
            Err(e) if e.is_poison() => {
                error!(lane, message_id = %message_id, error = %e, "Dropping poison message");
                if let Err(term_err) = delivery.ack_with(jetstream::AckKind::Term).await {
                    error!("Failed to terminate message {}: {}", message_id, term_err);
                }
            }
            Err(e) => {
                error!(lane, message_id = %message_id, error = %e, "Error handling message");
                // Lane retries exhausted; redelivery may now reorder this key
                if let Err(nak_err) = delivery
                    .ack_with(jetstream::AckKind::Nak(Some(nak_delay)))
                    .await
                {
                    error!("Failed to nak message {}: {}", message_id, nak_err);
                }
            }
        }
    }
}

fn sanitize_durable(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NatsConfig;
    use async_trait::async_trait;
    use bytes::Bytes;
    use ledger_core::types::InstitutionId;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        poison: bool,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self { failures, calls: AtomicU32::new(0), poison: false }
        }
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        async fn handle(&self, _message: Message) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.poison {
                return Err(Error::Decode("bad".to_string()));
            }
            if call <= self.failures {
                return Err(Error::Handler("transient".to_string()));
            }
            Ok(())
        }
    }

    fn message() -> Message {
        Message::new(
            "tx-1:completed",
            Stage::Completed,
            PartitionKey::Institution(InstitutionId::new("5000")),
            Bytes::from_static(b"{}"),
        )
    }

    fn retry(attempts: u32) -> LaneRetry {
        LaneRetry { attempts, delay: Duration::from_millis(10) }
    }

    #[test]
    fn test_subscriber_config_default() {
        let config = SubscriberConfig::default();
        assert_eq!(config.lanes, 4);
        assert_eq!(config.max_deliver, -1);
        assert_eq!(config.lane_attempts, 5);
    }

    #[test]
    fn test_durable_name() {
        let client = Arc::new(NatsClient::new(NatsConfig::default()));
        let subscriber = Subscriber::new(
            client,
            SubscriberConfig::default(),
            "bank 5000",
            Stage::Completed,
            Some(PartitionKey::Institution(InstitutionId::new("5000"))),
        );
        assert_eq!(subscriber.durable_name(), "bank_5000-completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_in_lane() {
        let handler = Flaky::new(2);
        handle_in_lane(0, &handler, message(), retry(3)).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lane_retries_exhausted() {
        let handler = Flaky::new(10);
        let err = handle_in_lane(0, &handler, message(), retry(3)).await.unwrap_err();
        assert!(!err.is_poison());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_not_retried() {
        let mut handler = Flaky::new(0);
        handler.poison = true;
        let err = handle_in_lane(0, &handler, message(), retry(5)).await.unwrap_err();
        assert!(err.is_poison());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
