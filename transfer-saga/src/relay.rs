//! Outbox relay
//!
//! Drains committed outbox records to the bus. A record is marked published
//! only after the transport acknowledged it, so a crash in between leads to a
//! republish under the same message id, never to a lost event.

use crate::{metrics::RELAY_RECORDS_TOTAL, Result};
use ledger_core::storage::Storage;
use message_bus::{Message, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Tick interval (milliseconds)
    pub poll_interval_ms: u64,

    /// Records claimed per tick
    pub batch_size: usize,

    /// Claim lease (milliseconds); an expired lease lets another relay take over
    pub lease_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 100,
            lease_ms: 30_000,
        }
    }
}

/// Outcome of one relay tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    /// Records claimed
    pub claimed: usize,
    /// Records published and marked
    pub published: usize,
    /// Records whose publish failed
    pub failed: usize,
    /// Records held back behind a failed record with the same key
    pub deferred: usize,
}

/// Outbox relay
pub struct OutboxRelay {
    storage: Arc<Storage>,
    transport: Arc<dyn Transport>,
    config: RelayConfig,
    owner: String,
}

impl std::fmt::Debug for OutboxRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .finish()
    }
}

impl OutboxRelay {
    /// New relay claiming as `owner`
    pub fn new(
        storage: Arc<Storage>,
        transport: Arc<dyn Transport>,
        config: RelayConfig,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            transport,
            config,
            owner: owner.into(),
        }
    }

    /// Owner name written into claims
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Claim a batch and publish it in order
    pub async fn run_once(&self) -> Result<RelayReport> {
        let lease = Duration::from_millis(self.config.lease_ms);
        let claimed = self
            .storage
            .claim_outbox(&self.owner, lease, self.config.batch_size)?;

        let mut report = RelayReport {
            claimed: claimed.len(),
            ..RelayReport::default()
        };
        let mut failed_keys: HashSet<String> = HashSet::new();

        for record in claimed {
            if let Some(key) = &record.key {
                if failed_keys.contains(key) {
                    self.storage.release_claim(record.id, &self.owner, None)?;
                    report.deferred += 1;
                    continue;
                }
            }

            let message = Message::from_outbox(&record);
            match self.transport.publish(&message).await {
                Ok(()) => {
                    if self.storage.mark_published(record.id, &self.owner)? {
                        report.published += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        outbox_id = record.id,
                        transaction_id = %record.transaction_id,
                        stage = %record.stage,
                        attempts = record.attempts + 1,
                        error = %e,
                        "Outbox publish failed, will retry"
                    );
                    self.storage
                        .release_claim(record.id, &self.owner, Some(&e.to_string()))?;
                    report.failed += 1;
                    if let Some(key) = record.key {
                        failed_keys.insert(key);
                    }
                }
            }
        }

        if report.claimed > 0 {
            RELAY_RECORDS_TOTAL
                .with_label_values(&["published"])
                .inc_by(report.published as u64);
            RELAY_RECORDS_TOTAL
                .with_label_values(&["failed"])
                .inc_by(report.failed as u64);
            RELAY_RECORDS_TOTAL
                .with_label_values(&["deferred"])
                .inc_by(report.deferred as u64);
            debug!(
                owner = %self.owner,
                claimed = report.claimed,
                published = report.published,
                failed = report.failed,
                deferred = report.deferred,
                "Relay tick"
            );
        }
        Ok(report)
    }

    /// Tick every `poll_interval_ms` until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(owner = %self.owner, "Outbox relay started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(owner = %self.owner, error = %e, "Relay tick failed");
                    }
                }
            }
        }

        info!(owner = %self.owner, "Outbox relay stopped");
    }
}
