//! Transactional outbox
//!
//! Outbound saga events are written as outbox records inside the same
//! [`StoreTxn`] as the business rows they describe, and drained later by a
//! relay. Records are never deleted; publishing flips `published` and drops
//! the sequence from the `outbox_pending` index.
//!
//! Several relays may drain one store. Each claims rows under a lease before
//! publishing, so a row is held by at most one owner at a time, and a row
//! whose owner died becomes claimable again once the lease runs out.

use crate::{
    error::{Error, Result},
    storage::{
        decode_seq, encode_seq, Storage, StoreTxn, CF_OUTBOX, CF_OUTBOX_INDEX, CF_OUTBOX_PENDING,
    },
    types::{Stage, TransactionId},
};
use chrono::{DateTime, Utc};
use rocksdb::{IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Outbox record as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Monotonic sequence, defines creation order
    pub id: u64,

    /// Transaction the event belongs to
    pub transaction_id: TransactionId,

    /// Destination stage
    pub stage: Stage,

    /// Partition key; `None` for unkeyed stages
    pub key: Option<String>,

    /// Serialized JSON body
    pub payload: String,

    /// Set once the transport acknowledged the event
    pub published: bool,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Publish timestamp
    pub published_at: Option<DateTime<Utc>>,

    /// Current relay claim
    pub claim: Option<OutboxClaim>,

    /// Failed publish attempts
    pub attempts: u32,

    /// Last publish error
    pub last_error: Option<String>,
}

/// Lease held by one relay on one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxClaim {
    /// Relay identity
    pub owner: String,

    /// Lease expiry
    pub expires_at: DateTime<Utc>,
}

impl OutboxClaim {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Outbox record before commit assigns its sequence
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxDraft {
    /// Transaction the event belongs to
    pub transaction_id: TransactionId,

    /// Destination stage
    pub stage: Stage,

    /// Partition key
    pub key: Option<String>,

    /// Serialized JSON body
    pub payload: String,
}

impl OutboxDraft {
    /// Serialize `body` as the record payload
    pub fn new<T: Serialize>(
        transaction_id: TransactionId,
        stage: Stage,
        key: Option<String>,
        body: &T,
    ) -> Result<Self> {
        Ok(Self {
            transaction_id,
            stage,
            key,
            payload: serde_json::to_string(body)?,
        })
    }
}

impl OutboxRecord {
    pub(crate) fn from_draft(id: u64, draft: OutboxDraft) -> Self {
        Self {
            id,
            transaction_id: draft.transaction_id,
            stage: draft.stage,
            key: draft.key,
            payload: draft.payload,
            published: false,
            created_at: Utc::now(),
            published_at: None,
            claim: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub(crate) fn index_key(transaction_id: &TransactionId, stage: Stage) -> [u8; 17] {
        let mut key = [0u8; 17];
        key[..16].copy_from_slice(transaction_id.as_bytes());
        key[16] = stage.tag();
        key
    }

    /// Message identity used for broker-side dedup
    pub fn message_id(&self) -> String {
        format!("{}:{}", self.transaction_id, self.stage)
    }
}

impl StoreTxn<'_> {
    /// Append an outbox record to the open transaction
    pub fn enqueue(&mut self, draft: OutboxDraft) {
        self.outbox.push(draft);
    }

    /// Check whether a record for `(transaction_id, stage)` exists, either
    /// committed or enqueued earlier in this transaction.
    pub fn outbox_contains(&mut self, transaction_id: &TransactionId, stage: Stage) -> Result<bool> {
        if self
            .outbox
            .iter()
            .any(|draft| draft.transaction_id == *transaction_id && draft.stage == stage)
        {
            return Ok(true);
        }
        let key = OutboxRecord::index_key(transaction_id, stage);
        Ok(self.read_raw(CF_OUTBOX_INDEX, &key)?.is_some())
    }
}

impl Storage {
    /// Get outbox record by sequence
    pub fn outbox_record(&self, id: u64) -> Result<Option<OutboxRecord>> {
        self.get(CF_OUTBOX, &encode_seq(id))
    }

    /// All records of one transaction, in stage order
    pub fn outbox_for_transaction(&self, transaction_id: &TransactionId) -> Result<Vec<OutboxRecord>> {
        let mut records = Vec::new();
        for stage in Stage::ALL {
            let index_key = OutboxRecord::index_key(transaction_id, stage);
            if let Some(seq) = self.get_raw(CF_OUTBOX_INDEX, &index_key)? {
                let id = decode_seq(&seq)?;
                let record = self
                    .outbox_record(id)?
                    .ok_or(Error::OutboxRecordNotFound(id))?;
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Unpublished records, oldest first
    pub fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let cf_pending = self.cf_handle(CF_OUTBOX_PENDING)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf_pending, IteratorMode::Start) {
            if records.len() >= limit {
                break;
            }
            let (key, _) = item?;
            let id = decode_seq(&key)?;
            let record = self
                .outbox_record(id)?
                .ok_or(Error::OutboxRecordNotFound(id))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Number of unpublished records
    pub fn pending_outbox_count(&self) -> Result<usize> {
        let cf_pending = self.cf_handle(CF_OUTBOX_PENDING)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf_pending, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Claim up to `limit` unpublished records for `owner`, oldest first.
    ///
    /// Skips records under another owner's live lease. Once such a record is
    /// skipped, later records with the same key are skipped too, so a key's
    /// records are never split across owners out of order.
    pub fn claim_outbox(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::Config(format!("Invalid outbox lease: {}", e)))?;
        let now = Utc::now();

        let _lock = self.commit_lock.lock();
        let cf_pending = self.cf_handle(CF_OUTBOX_PENDING)?;
        let cf_outbox = self.cf_handle(CF_OUTBOX)?;

        let mut blocked_keys = HashSet::new();
        let mut claimed = Vec::new();
        let mut batch = WriteBatch::default();

        for item in self.db.iterator_cf(&cf_pending, IteratorMode::Start) {
            if claimed.len() >= limit {
                break;
            }
            let (key, _) = item?;
            let id = decode_seq(&key)?;
            let mut record = self
                .outbox_record(id)?
                .ok_or(Error::OutboxRecordNotFound(id))?;

            if let Some(partition) = &record.key {
                if blocked_keys.contains(partition) {
                    continue;
                }
            }

            let held_elsewhere = record
                .claim
                .as_ref()
                .map(|claim| claim.owner != owner && claim.is_live(now))
                .unwrap_or(false);
            if held_elsewhere {
                if let Some(partition) = record.key.clone() {
                    blocked_keys.insert(partition);
                }
                continue;
            }

            record.claim = Some(OutboxClaim {
                owner: owner.to_string(),
                expires_at: now + lease,
            });
            batch.put_cf(&cf_outbox, encode_seq(id), bincode::serialize(&record)?);
            claimed.push(record);
        }

        if !claimed.is_empty() {
            self.write(batch)?;
            tracing::debug!(owner, claimed = claimed.len(), "Outbox records claimed");
        }

        Ok(claimed)
    }

    /// Durably mark a record published. Returns `false` without writing if
    /// `owner` no longer holds the claim or the record is already published.
    pub fn mark_published(&self, id: u64, owner: &str) -> Result<bool> {
        let _lock = self.commit_lock.lock();
        let mut record = self
            .outbox_record(id)?
            .ok_or(Error::OutboxRecordNotFound(id))?;

        let holds_claim = record
            .claim
            .as_ref()
            .map(|claim| claim.owner == owner)
            .unwrap_or(false);
        if record.published || !holds_claim {
            tracing::warn!(
                outbox_id = id,
                owner,
                published = record.published,
                "Skipping mark_published: claim not held"
            );
            return Ok(false);
        }

        record.published = true;
        record.published_at = Some(Utc::now());
        record.claim = None;

        let cf_outbox = self.cf_handle(CF_OUTBOX)?;
        let cf_pending = self.cf_handle(CF_OUTBOX_PENDING)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_outbox, encode_seq(id), bincode::serialize(&record)?);
        batch.delete_cf(&cf_pending, encode_seq(id));
        self.write(batch)?;

        self.metrics().outbox_published.inc();
        tracing::debug!(
            outbox_id = id,
            transaction_id = %record.transaction_id,
            stage = %record.stage,
            "Outbox record published"
        );
        Ok(true)
    }

    /// Return a claimed record to the pool. With an error, the failed
    /// attempt is counted and the error kept on the record.
    pub fn release_claim(&self, id: u64, owner: &str, error: Option<&str>) -> Result<()> {
        let _lock = self.commit_lock.lock();
        let mut record = self
            .outbox_record(id)?
            .ok_or(Error::OutboxRecordNotFound(id))?;

        let holds_claim = record
            .claim
            .as_ref()
            .map(|claim| claim.owner == owner)
            .unwrap_or(false);
        if !holds_claim {
            return Ok(());
        }

        record.claim = None;
        if let Some(error) = error {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            self.metrics().outbox_claim_released.inc();
        }

        let cf_outbox = self.cf_handle(CF_OUTBOX)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_outbox, encode_seq(id), bincode::serialize(&record)?);
        self.write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(temp_dir.path());
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn enqueue(storage: &Storage, stage: Stage, key: Option<&str>) -> TransactionId {
        let id = TransactionId::new();
        storage
            .transaction(|txn| {
                let draft =
                    OutboxDraft::new(id, stage, key.map(str::to_string), &serde_json::json!({}))?;
                txn.enqueue(draft);
                Ok(())
            })
            .unwrap();
        id
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[test]
    fn test_sequence_and_order() {
        let (storage, _temp) = test_storage();
        let first = enqueue(&storage, Stage::Initiated, None);
        let second = enqueue(&storage, Stage::Initiated, None);

        let pending = storage.pending_outbox(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].transaction_id, first);
        assert_eq!(pending[1].transaction_id, second);
        assert!(pending[0].id < pending[1].id);
        assert!(!pending[0].published);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(temp_dir.path());
        {
            let storage = Storage::open(&config).unwrap();
            enqueue(&storage, Stage::Processed, None);
            enqueue(&storage, Stage::Processed, None);
            storage.close().unwrap();
        }
        let storage = Storage::open(&config).unwrap();
        enqueue(&storage, Stage::Processed, None);
        let ids: Vec<u64> = storage
            .pending_outbox(10)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_outbox_contains() {
        let (storage, _temp) = test_storage();
        let id = enqueue(&storage, Stage::Processed, None);

        storage
            .transaction(|txn| {
                assert!(txn.outbox_contains(&id, Stage::Processed)?);
                assert!(!txn.outbox_contains(&id, Stage::Completed)?);
                txn.enqueue(OutboxDraft::new(id, Stage::Completed, None, &"x")?);
                assert!(txn.outbox_contains(&id, Stage::Completed)?);
                Ok(())
            })
            .unwrap();

        assert_eq!(storage.outbox_for_transaction(&id).unwrap().len(), 2);
    }

    #[test]
    fn test_claim_publish_lifecycle() {
        let (storage, _temp) = test_storage();
        enqueue(&storage, Stage::Forwarded, Some("6000"));

        let claimed = storage.claim_outbox("relay-a", LEASE, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        let id = claimed[0].id;

        assert!(storage.mark_published(id, "relay-a").unwrap());
        assert!(!storage.mark_published(id, "relay-a").unwrap());

        let record = storage.outbox_record(id).unwrap().unwrap();
        assert!(record.published);
        assert!(record.published_at.is_some());
        assert!(storage.pending_outbox(10).unwrap().is_empty());
        assert_eq!(storage.metrics().outbox_published.get(), 1);
    }

    #[test]
    fn test_two_owners_never_share_a_record() {
        let (storage, _temp) = test_storage();
        enqueue(&storage, Stage::Forwarded, Some("6000"));
        enqueue(&storage, Stage::Forwarded, Some("7000"));

        let a = storage.claim_outbox("relay-a", LEASE, 1).unwrap();
        let b = storage.claim_outbox("relay-b", LEASE, 10).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].id, b[0].id);

        assert!(!storage.mark_published(a[0].id, "relay-b").unwrap());
    }

    #[test]
    fn test_claim_blocks_same_key_behind_foreign_lease() {
        let (storage, _temp) = test_storage();
        enqueue(&storage, Stage::Completed, Some("5000"));
        let a = storage.claim_outbox("relay-a", LEASE, 1).unwrap();
        assert_eq!(a.len(), 1);

        enqueue(&storage, Stage::Completed, Some("5000"));
        enqueue(&storage, Stage::Completed, Some("5001"));

        let b = storage.claim_outbox("relay-b", LEASE, 10).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].key.as_deref(), Some("5001"));
    }

    #[test]
    fn test_expired_lease_is_reclaimable() {
        let (storage, _temp) = test_storage();
        enqueue(&storage, Stage::Initiated, None);

        let a = storage.claim_outbox("relay-a", Duration::ZERO, 10).unwrap();
        assert_eq!(a.len(), 1);
        let b = storage.claim_outbox("relay-b", LEASE, 10).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].id, b[0].id);
    }

    #[test]
    fn test_release_claim_records_error() {
        let (storage, _temp) = test_storage();
        enqueue(&storage, Stage::Initiated, None);

        let claimed = storage.claim_outbox("relay-a", LEASE, 10).unwrap();
        let id = claimed[0].id;
        storage
            .release_claim(id, "relay-a", Some("no responders"))
            .unwrap();

        let record = storage.outbox_record(id).unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("no responders"));
        assert!(record.claim.is_none());

        let again = storage.claim_outbox("relay-b", LEASE, 10).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_message_id() {
        let (storage, _temp) = test_storage();
        let id = enqueue(&storage, Stage::Initiated, None);
        let record = storage.pending_outbox(1).unwrap().remove(0);
        assert_eq!(record.message_id(), format!("{}:transactions.initiated", id));
    }
}
