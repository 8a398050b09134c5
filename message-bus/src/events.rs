//! Saga event payloads
//!
//! One closed set of payload shapes, selected by stage name on decode.
//! Field names follow the interbank wire contract (camelCase); amounts travel
//! as decimal strings.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::types::{
    AccountNumber, InstitutionId, RoutingHandle, Stage, TransactionId, TransactionStatus,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// origin -> clearing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInitiated {
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Sending institution
    pub from_institution: InstitutionId,
    /// Debited account
    pub from_account_number: AccountNumber,
    /// Recipient handle
    pub to_handle: RoutingHandle,
    /// Amount
    pub amount: Decimal,
    /// Always PENDING
    pub status: TransactionStatus,
    /// Initiation time
    pub created_at: DateTime<Utc>,
}

/// clearing -> destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferForwarded {
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Receiving institution
    pub to_institution: InstitutionId,
    /// Credited account
    pub to_account_number: AccountNumber,
    /// Amount
    pub amount: Decimal,
    /// Always PENDING
    pub status: TransactionStatus,
    /// Forwarding time
    pub created_at: DateTime<Utc>,
}

/// destination -> clearing (processed) and clearing -> origin (completed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// SUCCESS or FAILED
    pub status: TransactionStatus,
    /// Outcome reason
    #[serde(default)]
    pub message: Option<String>,
}

/// Tagged saga event
#[derive(Debug, Clone, PartialEq)]
pub enum SagaEvent {
    /// `transactions.initiated`
    Initiated(TransferInitiated),
    /// `transactions.forwarded`
    Forwarded(TransferForwarded),
    /// `transactions.processed`
    Processed(TransferResult),
    /// `transactions.completed`
    Completed(TransferResult),
}

impl SagaEvent {
    /// Stage this event travels on
    pub fn stage(&self) -> Stage {
        match self {
            SagaEvent::Initiated(_) => Stage::Initiated,
            SagaEvent::Forwarded(_) => Stage::Forwarded,
            SagaEvent::Processed(_) => Stage::Processed,
            SagaEvent::Completed(_) => Stage::Completed,
        }
    }

    /// Transaction the event belongs to
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            SagaEvent::Initiated(e) => e.transaction_id,
            SagaEvent::Forwarded(e) => e.transaction_id,
            SagaEvent::Processed(e) | SagaEvent::Completed(e) => e.transaction_id,
        }
    }

    /// Decode a body by the stage it arrived on
    pub fn decode(stage: Stage, body: &[u8]) -> Result<Self> {
        let decoded = match stage {
            Stage::Initiated => serde_json::from_slice(body).map(SagaEvent::Initiated),
            Stage::Forwarded => serde_json::from_slice(body).map(SagaEvent::Forwarded),
            Stage::Processed => serde_json::from_slice(body).map(SagaEvent::Processed),
            Stage::Completed => serde_json::from_slice(body).map(SagaEvent::Completed),
        };
        decoded.map_err(|e| Error::Decode(format!("{} body: {}", stage, e)))
    }

    /// Encode just the payload, without a tag
    pub fn to_json(&self) -> Result<String> {
        let json = match self {
            SagaEvent::Initiated(e) => serde_json::to_string(e)?,
            SagaEvent::Forwarded(e) => serde_json::to_string(e)?,
            SagaEvent::Processed(e) | SagaEvent::Completed(e) => serde_json::to_string(e)?,
        };
        Ok(json)
    }
}
