//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Accounts (key: account_number)
//! - `outgoing` - Outgoing transactions (key: transaction_id)
//! - `outgoing_pending` - PENDING outgoing transactions (key: transaction_id -> empty)
//! - `incoming` - Incoming transactions (key: transaction_id)
//! - `routing` - Routing entries (key: handle)
//! - `outbox` - Outbox records (key: sequence, big-endian u64)
//! - `outbox_pending` - Unpublished sequences (key: sequence -> empty)
//! - `outbox_index` - Dedup index (key: transaction_id || stage -> sequence)
//!
//! # Transactions
//!
//! RocksDB gives atomic batches but no read-check-write isolation, so every
//! mutation goes through [`Storage::transaction`]: the closure reads through a
//! [`StoreTxn`], which records a guard per row read and buffers every write.
//! Commit re-validates all guards under the commit lock and applies the
//! buffered rows plus outbox records in one `WriteBatch`. A stale guard
//! re-runs the closure against fresh state.

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    outbox::{OutboxDraft, OutboxRecord},
    types::{
        Account, AccountNumber, IncomingTransaction, OutgoingTransaction, RoutingEntry,
        RoutingHandle, TransactionId,
    },
    Config,
};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Column family names
pub(crate) const CF_ACCOUNTS: &str = "accounts";
pub(crate) const CF_OUTGOING: &str = "outgoing";
pub(crate) const CF_OUTGOING_PENDING: &str = "outgoing_pending";
pub(crate) const CF_INCOMING: &str = "incoming";
pub(crate) const CF_ROUTING: &str = "routing";
pub(crate) const CF_OUTBOX: &str = "outbox";
pub(crate) const CF_OUTBOX_PENDING: &str = "outbox_pending";
pub(crate) const CF_OUTBOX_INDEX: &str = "outbox_index";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_ACCOUNTS,
    CF_OUTGOING,
    CF_OUTGOING_PENDING,
    CF_INCOMING,
    CF_ROUTING,
    CF_OUTBOX,
    CF_OUTBOX_PENDING,
    CF_OUTBOX_INDEX,
];

/// Storage wrapper for RocksDB
pub struct Storage {
    pub(crate) db: Arc<DB>,

    /// Serializes guard validation with batch writes
    pub(crate) commit_lock: Mutex<()>,

    /// Last assigned outbox sequence
    pub(crate) outbox_seq: AtomicU64,

    max_attempts: u32,
    sync_writes: bool,
    metrics: Metrics,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("outbox_seq", &self.outbox_seq.load(Ordering::SeqCst))
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let metrics = Metrics::new()
            .map_err(|e| Error::Storage(format!("Failed to create metrics: {}", e)))?;

        let storage = Self {
            db: Arc::new(db),
            commit_lock: Mutex::new(()),
            outbox_seq: AtomicU64::new(0),
            max_attempts: config.max_txn_attempts,
            sync_writes: config.rocksdb.sync_writes,
            metrics,
        };

        let last_seq = storage.last_outbox_seq()?;
        storage.outbox_seq.store(last_seq, Ordering::SeqCst);

        tracing::info!(
            path = ?path,
            column_families = COLUMN_FAMILIES.len(),
            outbox_seq = last_seq,
            "Opened RocksDB"
        );

        Ok(storage)
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            CF_OUTBOX => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            CF_OUTBOX_INDEX | CF_ROUTING => {
                // Point lookups benefit from bloom filters
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn last_outbox_seq(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                decode_seq(&key)
            }
            None => Ok(0),
        }
    }

    // Helper: get column family handle

    pub(crate) fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    pub(crate) fn get_raw(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.cf_handle(cf)?;
        Ok(self.db.get_cf(&handle, key)?)
    }

    pub(crate) fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        self.get_raw(cf, key)?
            .map(|bytes| bincode::deserialize(&bytes).map_err(Error::from))
            .transpose()
    }

    pub(crate) fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let handle = self.cf_handle(cf)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(&handle, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    pub(crate) fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    /// Store metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run `f` as one optimistic transaction.
    ///
    /// The closure may run several times; it must not have side effects
    /// outside the `StoreTxn`. An `Err` from the closure aborts without
    /// writing anything. Conflicts are retried up to `max_txn_attempts`,
    /// then reported as [`Error::ConcurrentModification`].
    pub fn transaction<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut StoreTxn<'_>) -> Result<T>,
    {
        for attempt in 1..=self.max_attempts {
            let mut txn = StoreTxn::new(self);
            let value = match f(&mut txn) {
                Ok(value) => value,
                Err(Error::Conflict) => {
                    self.metrics.txn_conflicts.inc();
                    continue;
                }
                Err(e) => {
                    self.metrics.txn_aborted.inc();
                    return Err(e);
                }
            };

            match txn.commit() {
                Ok(()) => return Ok(value),
                Err(Error::Conflict) => {
                    self.metrics.txn_conflicts.inc();
                    tracing::debug!(attempt, "Transaction conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(attempts = self.max_attempts, "Transaction retries exhausted");
        Err(Error::ConcurrentModification {
            attempts: self.max_attempts,
        })
    }

    // Direct reads (no transaction)

    /// Get account by number
    pub fn account(&self, number: &AccountNumber) -> Result<Option<Account>> {
        self.get(CF_ACCOUNTS, number.as_str().as_bytes())
    }

    /// All accounts, ordered by account number
    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.scan(CF_ACCOUNTS)
    }

    /// Get outgoing transaction
    pub fn outgoing(&self, id: &TransactionId) -> Result<Option<OutgoingTransaction>> {
        self.get(CF_OUTGOING, id.as_bytes())
    }

    /// All outgoing transactions
    pub fn outgoing_transactions(&self) -> Result<Vec<OutgoingTransaction>> {
        self.scan(CF_OUTGOING)
    }

    /// Outgoing transactions still PENDING, read through the pending index
    pub fn pending_outgoing(&self) -> Result<Vec<OutgoingTransaction>> {
        let cf_pending = self.cf_handle(CF_OUTGOING_PENDING)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(&cf_pending, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(tx) = self.get::<OutgoingTransaction>(CF_OUTGOING, &key)? {
                if !tx.status.is_terminal() {
                    rows.push(tx);
                }
            }
        }
        Ok(rows)
    }

    /// Get incoming transaction
    pub fn incoming(&self, id: &TransactionId) -> Result<Option<IncomingTransaction>> {
        self.get(CF_INCOMING, id.as_bytes())
    }

    /// Get routing entry
    pub fn routing_entry(&self, handle: &RoutingHandle) -> Result<Option<RoutingEntry>> {
        self.get(CF_ROUTING, handle.as_str().as_bytes())
    }

    /// All routing entries, ordered by handle
    pub fn routing_entries(&self) -> Result<Vec<RoutingEntry>> {
        self.scan(CF_ROUTING)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

pub(crate) fn encode_seq(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

pub(crate) fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Storage(format!("Malformed outbox key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

type RowKey = (&'static str, Vec<u8>);

/// Precondition recorded for a row read inside a transaction
#[derive(Debug, Clone, PartialEq)]
enum Guard {
    /// Account row, compared by version token
    Version(u64),
    /// Any other row, compared byte for byte
    Bytes(Vec<u8>),
    /// Row did not exist
    Absent,
}

/// Open optimistic transaction.
///
/// Reads are repeatable within the transaction; writes are visible to later
/// reads of the same transaction and reach the store only on commit.
pub struct StoreTxn<'a> {
    storage: &'a Storage,
    reads: HashMap<RowKey, (Guard, Option<Vec<u8>>)>,
    writes: BTreeMap<RowKey, Option<Vec<u8>>>,
    pub(crate) outbox: Vec<OutboxDraft>,
}

impl std::fmt::Debug for StoreTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTxn")
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

impl<'a> StoreTxn<'a> {
    fn new(storage: &'a Storage) -> Self {
        Self {
            storage,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }

    pub(crate) fn read_raw(&mut self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let row = (cf, key.to_vec());
        if let Some(written) = self.writes.get(&row) {
            return Ok(written.clone());
        }
        if let Some((_, cached)) = self.reads.get(&row) {
            return Ok(cached.clone());
        }

        let value = self.storage.get_raw(cf, key)?;
        let guard = match &value {
            None => Guard::Absent,
            Some(bytes) if cf == CF_ACCOUNTS => {
                let account: Account = bincode::deserialize(bytes)?;
                Guard::Version(account.version)
            }
            Some(bytes) => Guard::Bytes(bytes.clone()),
        };
        self.reads.insert(row, (guard, value.clone()));
        Ok(value)
    }

    fn read<T: DeserializeOwned>(&mut self, cf: &'static str, key: &[u8]) -> Result<Option<T>> {
        self.read_raw(cf, key)?
            .map(|bytes| bincode::deserialize(&bytes).map_err(Error::from))
            .transpose()
    }

    fn put<T: Serialize>(&mut self, cf: &'static str, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.writes.insert((cf, key.to_vec()), Some(bytes));
        Ok(())
    }

    /// Get account by number
    pub fn account(&mut self, number: &AccountNumber) -> Result<Option<Account>> {
        self.read(CF_ACCOUNTS, number.as_str().as_bytes())
    }

    /// Write an account; its version must already be bumped by a transition
    pub fn put_account(&mut self, account: &Account) -> Result<()> {
        self.put(CF_ACCOUNTS, account.account_number.as_str().as_bytes(), account)
    }

    /// Delete an account
    pub fn delete_account(&mut self, number: &AccountNumber) {
        self.writes
            .insert((CF_ACCOUNTS, number.as_str().as_bytes().to_vec()), None);
    }

    /// Get outgoing transaction
    pub fn outgoing(&mut self, id: &TransactionId) -> Result<Option<OutgoingTransaction>> {
        self.read(CF_OUTGOING, id.as_bytes())
    }

    /// Write outgoing transaction and keep the pending index in step
    pub fn put_outgoing(&mut self, tx: &OutgoingTransaction) -> Result<()> {
        let key = tx.transaction_id.as_bytes().to_vec();
        let index = if tx.status.is_terminal() {
            None
        } else {
            Some(Vec::new())
        };
        self.writes.insert((CF_OUTGOING_PENDING, key), index);
        self.put(CF_OUTGOING, tx.transaction_id.as_bytes(), tx)
    }

    /// Get incoming transaction
    pub fn incoming(&mut self, id: &TransactionId) -> Result<Option<IncomingTransaction>> {
        self.read(CF_INCOMING, id.as_bytes())
    }

    /// Write incoming transaction
    pub fn put_incoming(&mut self, tx: &IncomingTransaction) -> Result<()> {
        self.put(CF_INCOMING, tx.transaction_id.as_bytes(), tx)
    }

    /// Get routing entry
    pub fn routing_entry(&mut self, handle: &RoutingHandle) -> Result<Option<RoutingEntry>> {
        self.read(CF_ROUTING, handle.as_str().as_bytes())
    }

    /// Write routing entry
    pub fn put_routing_entry(&mut self, entry: &RoutingEntry) -> Result<()> {
        self.put(CF_ROUTING, entry.handle.as_str().as_bytes(), entry)
    }

    /// Delete routing entry
    pub fn delete_routing_entry(&mut self, handle: &RoutingHandle) {
        self.writes
            .insert((CF_ROUTING, handle.as_str().as_bytes().to_vec()), None);
    }

    fn validate(&self) -> Result<()> {
        for ((cf, key), (guard, _)) in &self.reads {
            let current = self.storage.get_raw(cf, key)?;
            let holds = match (guard, current) {
                (Guard::Absent, None) => true,
                (Guard::Bytes(expected), Some(bytes)) => *expected == bytes,
                (Guard::Version(expected), Some(bytes)) => {
                    let account: Account = bincode::deserialize(&bytes)?;
                    account.version == *expected
                }
                _ => false,
            };
            if !holds {
                tracing::debug!(cf = *cf, "Guard failed");
                return Err(Error::Conflict);
            }
        }
        Ok(())
    }

    fn commit(self) -> Result<()> {
        if self.writes.is_empty() && self.outbox.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let storage = self.storage;
        let _lock = storage.commit_lock.lock();

        self.validate()?;

        let mut batch = WriteBatch::default();
        for ((cf, key), value) in &self.writes {
            let handle = storage.cf_handle(cf)?;
            match value {
                Some(bytes) => batch.put_cf(&handle, key, bytes),
                None => batch.delete_cf(&handle, key),
            }
        }

        let cf_outbox = storage.cf_handle(CF_OUTBOX)?;
        let cf_pending = storage.cf_handle(CF_OUTBOX_PENDING)?;
        let cf_index = storage.cf_handle(CF_OUTBOX_INDEX)?;
        let base_seq = storage.outbox_seq.load(Ordering::SeqCst);
        let outbox_count = self.outbox.len();

        for (offset, draft) in self.outbox.into_iter().enumerate() {
            let seq = base_seq + offset as u64 + 1;
            let record = OutboxRecord::from_draft(seq, draft);
            let key = encode_seq(seq);
            batch.put_cf(&cf_outbox, key, bincode::serialize(&record)?);
            batch.put_cf(&cf_pending, key, b"");
            batch.put_cf(
                &cf_index,
                OutboxRecord::index_key(&record.transaction_id, record.stage),
                key,
            );
            tracing::debug!(
                outbox_id = seq,
                transaction_id = %record.transaction_id,
                stage = %record.stage,
                "Outbox record enqueued"
            );
        }

        storage.write(batch)?;
        storage
            .outbox_seq
            .store(base_seq + outbox_count as u64, Ordering::SeqCst);

        storage
            .metrics
            .record_commit(started.elapsed().as_secs_f64(), outbox_count);
        Ok(())
    }
}
