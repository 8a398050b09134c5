//! Error types for the ledger

use crate::types::TransactionStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Row encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Payload encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Account number already taken
    #[error("Account already exists: {0}")]
    DuplicateAccount(String),

    /// Amount must be strictly positive
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    /// Initial balance must not be negative
    #[error("Balance cannot be negative, got {0}")]
    NegativeBalance(Decimal),

    /// Credit would exceed the representable balance
    #[error("Balance overflow: {balance} + {amount}")]
    BalanceOverflow {
        /// Current balance
        balance: Decimal,
        /// Credited amount
        amount: Decimal,
    },

    /// Account still holds reserved funds
    #[error("Account {account} has {reserved} reserved")]
    ReservationsOutstanding {
        /// Account number
        account: String,
        /// Currently reserved
        reserved: Decimal,
    },

    /// Available balance does not cover the reservation
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Requested amount
        requested: Decimal,
        /// Balance minus reservations
        available: Decimal,
    },

    /// Reserved balance does not cover the commit or release
    #[error("Not enough reserved funds: requested {requested}, reserved {reserved}")]
    InsufficientReserved {
        /// Requested amount
        requested: Decimal,
        /// Currently reserved
        reserved: Decimal,
    },

    /// Illegal status machine transition
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: TransactionStatus,
        /// Requested status
        to: TransactionStatus,
    },

    /// A row read by the transaction changed before commit.
    /// Retried internally; callers only see `ConcurrentModification`.
    #[error("Optimistic precondition failed")]
    Conflict,

    /// Optimistic retries exhausted
    #[error("Concurrent modification: gave up after {attempts} attempts")]
    ConcurrentModification {
        /// Attempts made
        attempts: u32,
    },

    /// Outbox record not found
    #[error("Outbox record not found: {0}")]
    OutboxRecordNotFound(u64),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures a caller may resolve by retrying the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict | Error::ConcurrentModification { .. } | Error::Storage(_) | Error::Io(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
