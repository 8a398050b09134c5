//! Message envelope for pub/sub

use crate::{
    events::SagaEvent,
    types::{PartitionKey, Subjects},
    Result,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ledger_core::{
    outbox::OutboxRecord,
    types::{Stage, TransactionId},
};
use std::collections::HashMap;

/// Header carrying the broker dedup identity
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Message envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Stable identity `"{transaction_id}:{stage}"`, identical across republishes
    pub id: String,

    /// Stage the message travels on
    pub stage: Stage,

    /// Partition key for routing and ordering
    pub key: PartitionKey,

    /// JSON body
    pub body: Bytes,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Headers (metadata)
    pub headers: HashMap<String, String>,
}

impl Message {
    /// Create new message
    pub fn new(id: impl Into<String>, stage: Stage, key: PartitionKey, body: Bytes) -> Self {
        Self {
            id: id.into(),
            stage,
            key,
            body,
            timestamp: Utc::now(),
            headers: HashMap::new(),
        }
    }

    /// Message identity for a transaction at a stage
    pub fn id_for(transaction_id: &TransactionId, stage: Stage) -> String {
        format!("{}:{}", transaction_id, stage)
    }

    /// Build from a saga event
    pub fn from_event(event: &SagaEvent, key: PartitionKey) -> Result<Self> {
        let stage = event.stage();
        Ok(Self::new(
            Self::id_for(&event.transaction_id(), stage),
            stage,
            key,
            Bytes::from(event.to_json()?),
        ))
    }

    /// Build from a stored outbox record
    pub fn from_outbox(record: &OutboxRecord) -> Self {
        Self::new(
            record.message_id(),
            record.stage,
            PartitionKey::from_record_key(record.key.as_deref()),
            Bytes::from(record.payload.clone()),
        )
        .with_header("Outbox-Seq".to_string(), record.id.to_string())
    }

    /// Add header
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Decode the body by stage
    pub fn decode(&self) -> Result<SagaEvent> {
        SagaEvent::decode(self.stage, &self.body)
    }

    /// Get NATS subject for this message
    pub fn subject(&self, subjects: &Subjects) -> String {
        subjects.subject(self.stage, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TransferResult;
    use ledger_core::types::{InstitutionId, TransactionStatus};

    #[test]
    fn test_message_from_event() {
        let id = TransactionId::new();
        let event = SagaEvent::Completed(TransferResult {
            transaction_id: id,
            status: TransactionStatus::Success,
            message: Some("Transaction processed".to_string()),
        });
        let key = PartitionKey::Institution(InstitutionId::new("5000"));

        let msg = Message::from_event(&event, key).unwrap();
        assert_eq!(msg.id, format!("{}:transactions.completed", id));
        assert_eq!(msg.stage, Stage::Completed);
        assert_eq!(msg.decode().unwrap(), event);
    }

    #[test]
    fn test_message_subject() {
        let msg = Message::new(
            "x:transactions.forwarded",
            Stage::Forwarded,
            PartitionKey::Institution(InstitutionId::new("6000")),
            Bytes::from_static(b"{}"),
        );
        assert_eq!(
            msg.subject(&Subjects::new("bankgood")),
            "bankgood.transactions.forwarded.inst.6000"
        );
    }
}
