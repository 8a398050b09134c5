//! Reservation expiry sweep
//!
//! Releases reservations of outgoing transfers that stayed PENDING longer
//! than the configured TTL. A late SUCCESS for a swept transfer is flagged by
//! [`OriginSaga::on_completed`](crate::origin::OriginSaga::on_completed).

use crate::{metrics, Result};
use chrono::{DateTime, Utc};
use ledger_core::{storage::Storage, types::TransactionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Reason recorded on swept transfers
pub const RESERVATION_EXPIRED: &str = "reservation expired";

/// Periodic expiry sweep
#[derive(Debug)]
pub struct ReservationSweeper {
    storage: Arc<Storage>,
    ttl: Duration,
    interval: Duration,
}

impl ReservationSweeper {
    /// New sweeper
    pub fn new(storage: Arc<Storage>, ttl: Duration, interval: Duration) -> Self {
        Self {
            storage,
            ttl,
            interval,
        }
    }

    /// Expire every PENDING transfer created before `now - ttl`.
    /// Returns the number of transfers failed.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| crate::Error::Config(format!("Invalid reservation TTL: {}", e)))?;
        let cutoff = now - ttl;

        let candidates: Vec<_> = self
            .storage
            .pending_outgoing()?
            .into_iter()
            .filter(|tx| tx.created_at < cutoff)
            .collect();

        let mut expired = 0;
        for candidate in candidates {
            let transaction_id = candidate.transaction_id;
            let swept = self.storage.transaction(|txn| {
                let Some(mut tx) = txn.outgoing(&transaction_id)? else {
                    return Ok(false);
                };
                if tx.status != TransactionStatus::Pending {
                    return Ok(false);
                }
                let amount = tx.amount;
                txn.update_account(&tx.from_account_number, |a| a.release(amount))?;
                tx.settle(TransactionStatus::Failed, Some(RESERVATION_EXPIRED.to_string()))?;
                txn.put_outgoing(&tx)?;
                Ok(true)
            });

            match swept {
                Ok(true) => {
                    warn!(
                        transaction_id = %transaction_id,
                        amount = %candidate.amount,
                        created_at = %candidate.created_at,
                        "Reservation expired"
                    );
                    metrics::record_step("origin", "expiry", "expired");
                    expired += 1;
                }
                Ok(false) => {}
                Err(e) => error!(transaction_id = %transaction_id, error = %e, "Failed to expire reservation"),
            }
        }
        Ok(expired)
    }

    /// Sweep every interval until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(ttl_secs = self.ttl.as_secs(), "Reservation sweeper started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()) {
                        error!(error = %e, "Reservation sweep failed");
                    }
                }
            }
        }
    }
}
