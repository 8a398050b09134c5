//! Clearing handlers: route initiated transfers, relay destination outcomes
//!
//! Clearing keeps one bookkeeping row per transaction in its own store. Both
//! handlers check that row inside the same transaction that writes it and the
//! outbox record, so redeliveries never fan out again.

use crate::{Error, Result};
use chrono::Utc;
use ledger_core::{
    outbox::OutboxDraft,
    storage::Storage,
    types::{InstitutionId, OutgoingTransaction, Stage, TransactionStatus},
};
use message_bus::events::{TransferForwarded, TransferInitiated, TransferResult};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use transfer_saga::metrics;

/// What an `initiated` delivery did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clearance {
    /// Forwarded to the institution owning the handle
    Forwarded(InstitutionId),
    /// Failed back to the origin
    Rejected(String),
    /// Row already existed
    Duplicate,
}

/// What a `processed` delivery did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    /// Outcome relayed to the origin
    Relayed(TransactionStatus),
    /// No bookkeeping row
    Unknown,
    /// Outcome already relayed
    Duplicate,
}

/// Clearing engine
#[derive(Debug, Clone)]
pub struct ClearingEngine {
    storage: Arc<Storage>,
}

impl ClearingEngine {
    /// Engine over the clearing store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Record the transfer and either forward it or fail it back
    pub fn on_initiated(&self, event: &TransferInitiated) -> Result<Clearance> {
        let transaction_id = event.transaction_id;

        let clearance = self.storage.transaction(|txn| {
            if txn.outgoing(&transaction_id)?.is_some() {
                return Ok(Clearance::Duplicate);
            }

            let mut row = OutgoingTransaction::new(
                transaction_id,
                event.from_institution.clone(),
                event.from_account_number.clone(),
                event.to_handle.clone(),
                event.amount,
                TransactionStatus::Pending,
            );
            let origin_key = Some(event.from_institution.to_string());

            let route = if event.amount <= Decimal::ZERO {
                Err(format!("invalid amount {}", event.amount))
            } else {
                txn.routing_entry(&event.to_handle)?
                    .ok_or_else(|| format!("no routing entry for handle {}", event.to_handle))
            };

            match route {
                Ok(entry) => {
                    txn.put_outgoing(&row)?;
                    let forwarded = TransferForwarded {
                        transaction_id,
                        to_institution: entry.institution.clone(),
                        to_account_number: entry.account_number.clone(),
                        amount: event.amount,
                        status: TransactionStatus::Pending,
                        created_at: Utc::now(),
                    };
                    txn.enqueue(OutboxDraft::new(
                        transaction_id,
                        Stage::Forwarded,
                        Some(entry.institution.to_string()),
                        &forwarded,
                    )?);
                    Ok(Clearance::Forwarded(entry.institution))
                }
                Err(reason) => {
                    row.settle(TransactionStatus::Failed, Some(reason.clone()))?;
                    txn.put_outgoing(&row)?;
                    let completed = TransferResult {
                        transaction_id,
                        status: TransactionStatus::Failed,
                        message: Some(reason.clone()),
                    };
                    txn.enqueue(OutboxDraft::new(
                        transaction_id,
                        Stage::Completed,
                        origin_key,
                        &completed,
                    )?);
                    Ok(Clearance::Rejected(reason))
                }
            }
        })?;

        let outcome = match &clearance {
            Clearance::Forwarded(_) => "forwarded",
            Clearance::Rejected(_) => "rejected",
            Clearance::Duplicate => "duplicate",
        };
        metrics::record_step("clearing", "initiated", outcome);

        match &clearance {
            Clearance::Forwarded(institution) => info!(
                transaction_id = %transaction_id,
                from_institution = %event.from_institution,
                to_institution = %institution,
                amount = %event.amount,
                "Transfer forwarded"
            ),
            Clearance::Rejected(reason) => warn!(
                transaction_id = %transaction_id,
                from_institution = %event.from_institution,
                reason = %reason,
                "Transfer rejected at clearing"
            ),
            Clearance::Duplicate => info!(
                transaction_id = %transaction_id,
                "Duplicate initiated delivery ignored"
            ),
        }
        Ok(clearance)
    }

    /// Settle the bookkeeping row and relay the destination's outcome to
    /// the origin verbatim
    pub fn on_processed(&self, result: &TransferResult) -> Result<Relay> {
        let transaction_id = result.transaction_id;
        if !result.status.is_terminal() {
            return Err(Error::Validation(format!(
                "processed event for {} carries non-terminal status {}",
                transaction_id, result.status
            )));
        }

        let relay = self.storage.transaction(|txn| {
            let Some(mut row) = txn.outgoing(&transaction_id)? else {
                return Ok(Relay::Unknown);
            };
            if txn.outbox_contains(&transaction_id, Stage::Completed)? {
                return Ok(Relay::Duplicate);
            }

            if !row.status.is_terminal() {
                row.settle(result.status, result.message.clone())?;
                txn.put_outgoing(&row)?;
            }
            txn.enqueue(OutboxDraft::new(
                transaction_id,
                Stage::Completed,
                Some(row.from_institution.to_string()),
                result,
            )?);
            Ok(Relay::Relayed(result.status))
        })?;

        let outcome = match &relay {
            Relay::Relayed(status) => status.as_str(),
            Relay::Unknown => "unknown",
            Relay::Duplicate => "duplicate",
        };
        metrics::record_step("clearing", "processed", outcome);

        match relay {
            Relay::Relayed(status) => info!(
                transaction_id = %transaction_id,
                status = %status,
                "Outcome relayed to origin"
            ),
            Relay::Unknown => warn!(
                transaction_id = %transaction_id,
                "Processed event for unknown transaction dropped"
            ),
            Relay::Duplicate => info!(
                transaction_id = %transaction_id,
                "Duplicate processed delivery ignored"
            ),
        }
        Ok(relay)
    }
}
