//! In-process transport for tests and single-binary runs
//!
//! Ordered and at-least-once like the broker: every subscription keeps a
//! FIFO queue, a failing handler leaves its message at the head for the next
//! pump, and an outage switch makes `publish` fail without enqueuing.

use crate::{
    message::Message,
    metrics::{MESSAGE_PUBLISH_TOTAL, MESSAGE_RECEIVE_TOTAL},
    transport::{MessageHandler, Transport},
    types::PartitionKey,
    Error, Result,
};
use async_trait::async_trait;
use ledger_core::types::Stage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

struct Subscription {
    name: String,
    stage: Stage,
    key: Option<PartitionKey>,
    handler: Arc<dyn MessageHandler>,
    queue: VecDeque<Message>,
}

impl Subscription {
    fn matches(&self, message: &Message) -> bool {
        self.stage == message.stage
            && self.key.as_ref().map(|k| *k == message.key).unwrap_or(true)
    }
}

#[derive(Default)]
struct BusState {
    subscriptions: Vec<Subscription>,
    published: Vec<Message>,
    outage: bool,
}

/// Outcome of one [`InMemoryBus::pump`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    /// Deliveries acknowledged
    pub delivered: usize,
    /// Deliveries left queued for retry
    pub failed: usize,
    /// Poison deliveries dropped
    pub dropped: usize,
}

/// In-memory bus
#[derive(Default)]
pub struct InMemoryBus {
    state: Mutex<BusState>,
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBus")
            .field("subscriptions", &state.subscriptions.len())
            .field("published", &state.published.len())
            .field("outage", &state.outage)
            .finish()
    }
}

impl InMemoryBus {
    /// Empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `stage`, narrowed to `key` when given
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        stage: Stage,
        key: Option<PartitionKey>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.state.lock().subscriptions.push(Subscription {
            name: name.into(),
            stage,
            key,
            handler,
            queue: VecDeque::new(),
        });
    }

    /// Simulate a broker outage
    pub fn set_outage(&self, outage: bool) {
        self.state.lock().outage = outage;
    }

    /// Every acknowledged publish, in order
    pub fn published(&self) -> Vec<Message> {
        self.state.lock().published.clone()
    }

    /// Acknowledged publishes on one stage
    pub fn published_on(&self, stage: Stage) -> Vec<Message> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.stage == stage)
            .cloned()
            .collect()
    }

    /// Queued deliveries across all subscriptions
    pub fn queued(&self) -> usize {
        self.state
            .lock()
            .subscriptions
            .iter()
            .map(|s| s.queue.len())
            .sum()
    }

    /// Deliver `message` again to every matching subscription
    pub fn redeliver(&self, message: &Message) {
        let mut state = self.state.lock();
        for subscription in state.subscriptions.iter_mut().filter(|s| s.matches(message)) {
            subscription.queue.push_back(message.clone());
        }
    }

    /// Deliver queued messages until every queue is empty or blocked by a
    /// failing head. Each subscription stops at its first failure so later
    /// messages never overtake it.
    pub async fn pump(&self) -> PumpReport {
        let mut report = PumpReport::default();
        let count = self.state.lock().subscriptions.len();

        for index in 0..count {
            loop {
                let next = {
                    let mut state = self.state.lock();
                    let subscription = &mut state.subscriptions[index];
                    subscription
                        .queue
                        .pop_front()
                        .map(|m| (m, subscription.handler.clone(), subscription.name.clone()))
                };
                let Some((message, handler, name)) = next else {
                    break;
                };

                match handler.handle(message.clone()).await {
                    Ok(()) => {
                        MESSAGE_RECEIVE_TOTAL
                            .with_label_values(&[message.stage.as_str(), "success"])
                            .inc();
                        report.delivered += 1;
                    }
                    Err(e) if e.is_poison() => {
                        warn!(subscription = %name, message_id = %message.id, error = %e, "Dropping poison message");
                        report.dropped += 1;
                    }
                    Err(e) => {
                        debug!(subscription = %name, message_id = %message.id, error = %e, "Delivery failed, requeued");
                        self.state.lock().subscriptions[index]
                            .queue
                            .push_front(message);
                        report.failed += 1;
                        break;
                    }
                }
            }
        }

        report
    }
}

#[async_trait]
impl Transport for InMemoryBus {
    async fn publish(&self, message: &Message) -> Result<()> {
        let mut state = self.state.lock();
        if state.outage {
            MESSAGE_PUBLISH_TOTAL
                .with_label_values(&[message.stage.as_str(), "error"])
                .inc();
            return Err(Error::Unavailable("in-memory bus outage".to_string()));
        }

        for subscription in state.subscriptions.iter_mut().filter(|s| s.matches(message)) {
            subscription.queue.push_back(message.clone());
        }
        state.published.push(message.clone());

        MESSAGE_PUBLISH_TOTAL
            .with_label_values(&[message.stage.as_str(), "success"])
            .inc();
        Ok(())
    }
}
