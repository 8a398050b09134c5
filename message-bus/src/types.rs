//! Type definitions for message bus

use crate::{Error, Result};
use ledger_core::types::{InstitutionId, Stage};
use serde::{Deserialize, Serialize};

/// Partition key for routing messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionKey {
    /// Ordered per institution
    Institution(InstitutionId),
    /// No ordering requirement
    Unkeyed,
}

impl PartitionKey {
    /// Key from an outbox record's stored key
    pub fn from_record_key(key: Option<&str>) -> Self {
        match key {
            Some(id) => PartitionKey::Institution(InstitutionId::new(id)),
            None => PartitionKey::Unkeyed,
        }
    }

    /// Key as stored on an outbox record
    pub fn as_record_key(&self) -> Option<String> {
        match self {
            PartitionKey::Institution(id) => Some(id.to_string()),
            PartitionKey::Unkeyed => None,
        }
    }

    /// Get partitioning string for NATS subject
    pub fn to_subject_segment(&self) -> String {
        match self {
            PartitionKey::Institution(id) => format!("inst.{}", sanitize_subject(id.as_str())),
            PartitionKey::Unkeyed => "any".to_string(),
        }
    }

    /// Compute partition number for load balancing
    pub fn partition_number(&self, num_partitions: u32) -> u32 {
        let hash = match self {
            PartitionKey::Institution(id) => blake3::hash(id.as_str().as_bytes()),
            PartitionKey::Unkeyed => return 0,
        };

        let hash_bytes = hash.as_bytes();
        let hash_u32 =
            u32::from_le_bytes([hash_bytes[0], hash_bytes[1], hash_bytes[2], hash_bytes[3]]);
        hash_u32 % num_partitions
    }
}

/// Subject layout: `{prefix}.transactions.{stage}.{segment}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    prefix: String,
}

impl Subjects {
    /// Layout under the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Subject for one message
    pub fn subject(&self, stage: Stage, key: &PartitionKey) -> String {
        format!(
            "{}.transactions.{}.{}",
            self.prefix,
            stage.token(),
            key.to_subject_segment()
        )
    }

    /// Filter matching every message of a stage
    pub fn stage_filter(&self, stage: Stage) -> String {
        format!("{}.transactions.{}.>", self.prefix, stage.token())
    }

    /// Filter for a subscription, narrowed to one key when given
    pub fn filter(&self, stage: Stage, key: Option<&PartitionKey>) -> String {
        match key {
            Some(key) => self.subject(stage, key),
            None => self.stage_filter(stage),
        }
    }

    /// JetStream stream holding a stage
    pub fn stream_name(&self, stage: Stage) -> String {
        format!(
            "{}_TRANSACTIONS_{}",
            sanitize_subject(&self.prefix).to_uppercase(),
            stage.token().to_uppercase()
        )
    }

    /// Recover stage and key from a received subject
    pub fn parse(&self, subject: &str) -> Result<(Stage, PartitionKey)> {
        let rest = subject
            .strip_prefix(&self.prefix)
            .and_then(|s| s.strip_prefix(".transactions."))
            .ok_or_else(|| Error::Decode(format!("foreign subject: {}", subject)))?;

        let (token, segment) = rest
            .split_once('.')
            .ok_or_else(|| Error::Decode(format!("malformed subject: {}", subject)))?;

        let stage: Stage = token
            .parse()
            .map_err(|_| Error::Decode(format!("unknown stage in subject: {}", subject)))?;

        let key = match segment.strip_prefix("inst.") {
            Some(id) => PartitionKey::Institution(InstitutionId::new(id)),
            None if segment == "any" => PartitionKey::Unkeyed,
            None => return Err(Error::Decode(format!("malformed subject: {}", subject))),
        };

        Ok((stage, key))
    }
}

/// Sanitize string for use in NATS subject
fn sanitize_subject(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
