//! Bankgood Ledger Core
//!
//! Durable participant store: accounts with a reservation sub-balance,
//! transaction bookkeeping rows, routing entries and the transactional outbox,
//! all in one RocksDB instance.
//!
//! # Architecture
//!
//! - **Optimistic transactions**: every read-check-write runs in a
//!   [`StoreTxn`] guarded by row versions, retried on conflict
//! - **Reservation state machine**: `deposit`, `reserve`, `commit`, `release`
//!   as pure [`types::Account`] transitions
//! - **Transactional outbox**: saga events committed in the same batch as the
//!   rows they describe, drained by lease-claiming relays
//!
//! # Invariants
//!
//! - `balance - reserved >= 0` for every account at every commit
//! - Transaction status moves only `PENDING -> SUCCESS | FAILED`
//! - At most one outbox record per `(transaction id, stage)`
//! - Outbox records are never deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod outbox;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use outbox::{OutboxClaim, OutboxDraft, OutboxRecord};
pub use storage::{Storage, StoreTxn};
pub use types::{
    Account, AccountNumber, IncomingTransaction, InstitutionId, OutgoingTransaction,
    RoutingEntry, RoutingHandle, Stage, TransactionId, TransactionStatus,
};
