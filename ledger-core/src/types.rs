//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode on disk, JSON on the wire)
//! - Exact arithmetic (Decimal for money, never floats)
//! - Value-style transitions: account mutations return the next version

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Transaction identifier, shared end to end by every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a new time-ordered identifier (UUIDv7)
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Raw bytes, used as storage key
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string-like value
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get as string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Institution identifier (the bank's clearing number)
    InstitutionId
);

string_id!(
    /// External account number, unique within one institution
    AccountNumber
);

string_id!(
    /// Opaque recipient handle ("bankgood number") resolved by clearing
    RoutingHandle
);

/// Ledger account with a reservation sub-balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Internal identifier
    pub account_id: Uuid,

    /// External account number (unique)
    pub account_number: AccountNumber,

    /// Account holder name
    pub holder: String,

    /// Settled funds
    pub balance: Decimal,

    /// Funds earmarked for in-flight outgoing transfers
    pub reserved: Decimal,

    /// Optimistic concurrency token, bumped by every mutation
    pub version: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Open a new account
    pub fn open(
        account_number: AccountNumber,
        holder: impl Into<String>,
        initial_balance: Decimal,
    ) -> Result<Self> {
        if initial_balance < Decimal::ZERO {
            return Err(Error::NegativeBalance(initial_balance));
        }

        let now = Utc::now();
        Ok(Self {
            account_id: Uuid::now_v7(),
            account_number,
            holder: holder.into(),
            balance: initial_balance,
            reserved: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Balance not earmarked by reservations
    pub fn available(&self) -> Decimal {
        self.balance - self.reserved
    }

    /// Credit settled funds
    pub fn deposit(&self, amount: Decimal) -> Result<Self> {
        ensure_positive(amount)?;
        let balance = self
            .balance
            .checked_add(amount)
            .ok_or(Error::BalanceOverflow {
                balance: self.balance,
                amount,
            })?;
        Ok(self.next(balance, self.reserved))
    }

    /// Change the holder name
    pub fn rename(&self, holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            ..self.next(self.balance, self.reserved)
        }
    }

    /// Earmark funds for an outgoing transfer
    pub fn reserve(&self, amount: Decimal) -> Result<Self> {
        ensure_positive(amount)?;
        let available = self.available();
        if available < amount {
            return Err(Error::InsufficientFunds {
                requested: amount,
                available,
            });
        }
        Ok(self.next(self.balance, self.reserved + amount))
    }

    /// Finalize a reserved debit
    pub fn commit(&self, amount: Decimal) -> Result<Self> {
        self.ensure_reserved(amount)?;
        Ok(self.next(self.balance - amount, self.reserved - amount))
    }

    /// Return reserved funds to the available balance
    pub fn release(&self, amount: Decimal) -> Result<Self> {
        self.ensure_reserved(amount)?;
        Ok(self.next(self.balance, self.reserved - amount))
    }

    fn ensure_reserved(&self, amount: Decimal) -> Result<()> {
        ensure_positive(amount)?;
        if self.reserved < amount {
            return Err(Error::InsufficientReserved {
                requested: amount,
                reserved: self.reserved,
            });
        }
        Ok(())
    }

    fn next(&self, balance: Decimal, reserved: Decimal) -> Self {
        debug_assert!(balance - reserved >= Decimal::ZERO);
        Self {
            balance,
            reserved,
            version: self.version + 1,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(amount));
    }
    Ok(())
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// In flight
    Pending,
    /// Terminal: funds moved
    Success,
    /// Terminal: nothing moved, reservations returned
    Failed,
}

impl TransactionStatus {
    /// Status name on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
        }
    }

    /// Check if terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Validate a transition; only `PENDING -> SUCCESS | FAILED` is legal.
    pub fn transition(self, next: TransactionStatus) -> Result<TransactionStatus> {
        match (self, next) {
            (TransactionStatus::Pending, TransactionStatus::Success)
            | (TransactionStatus::Pending, TransactionStatus::Failed) => Ok(next),
            (from, to) => Err(Error::InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing transfer, recorded at the sending bank and at clearing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingTransaction {
    /// Transaction ID (natural key)
    pub transaction_id: TransactionId,

    /// Debited account
    pub from_account_number: AccountNumber,

    /// Sending institution
    pub from_institution: InstitutionId,

    /// Recipient handle, resolved by clearing
    pub to_handle: RoutingHandle,

    /// Transfer amount
    pub amount: Decimal,

    /// Current status
    pub status: TransactionStatus,

    /// Reason attached to the last status change
    pub message: Option<String>,

    /// Set when the row needs an operator (stuck or contradictory outcome)
    pub needs_reconciliation: bool,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl OutgoingTransaction {
    /// New row in the given initial status
    pub fn new(
        transaction_id: TransactionId,
        from_institution: InstitutionId,
        from_account_number: AccountNumber,
        to_handle: RoutingHandle,
        amount: Decimal,
        status: TransactionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id,
            from_account_number,
            from_institution,
            to_handle,
            amount,
            status,
            message: None,
            needs_reconciliation: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a terminal status
    pub fn settle(&mut self, status: TransactionStatus, message: Option<String>) -> Result<()> {
        self.status = self.status.transition(status)?;
        self.message = message;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Incoming transfer, recorded at the receiving bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingTransaction {
    /// Transaction ID (same as the outgoing side)
    pub transaction_id: TransactionId,

    /// Receiving institution
    pub to_institution: InstitutionId,

    /// Credited account
    pub to_account_number: AccountNumber,

    /// Transfer amount
    pub amount: Decimal,

    /// Current status
    pub status: TransactionStatus,

    /// Outcome message
    pub message: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl IncomingTransaction {
    /// New PENDING row
    pub fn pending(
        transaction_id: TransactionId,
        to_institution: InstitutionId,
        to_account_number: AccountNumber,
        amount: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id,
            to_institution,
            to_account_number,
            amount,
            status: TransactionStatus::Pending,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a terminal status
    pub fn settle(&mut self, status: TransactionStatus, message: impl Into<String>) -> Result<()> {
        self.status = self.status.transition(status)?;
        self.message = Some(message.into());
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Clearing routing table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingEntry {
    /// Recipient handle (unique)
    pub handle: RoutingHandle,

    /// Destination institution
    pub institution: InstitutionId,

    /// Destination account number
    pub account_number: AccountNumber,

    /// Display name of the recipient
    pub display_name: String,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Saga stage, one per inter-service event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// origin -> clearing
    Initiated,
    /// clearing -> destination
    Forwarded,
    /// destination -> clearing
    Processed,
    /// clearing -> origin
    Completed,
}

impl Stage {
    /// All stages
    pub const ALL: [Stage; 4] = [
        Stage::Initiated,
        Stage::Forwarded,
        Stage::Processed,
        Stage::Completed,
    ];

    /// Logical topic name
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initiated => "transactions.initiated",
            Stage::Forwarded => "transactions.forwarded",
            Stage::Processed => "transactions.processed",
            Stage::Completed => "transactions.completed",
        }
    }

    /// Short token used in subjects and consumer names
    pub fn token(&self) -> &'static str {
        match self {
            Stage::Initiated => "initiated",
            Stage::Forwarded => "forwarded",
            Stage::Processed => "processed",
            Stage::Completed => "completed",
        }
    }

    /// Storage tag
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Stage::Initiated => 1,
            Stage::Forwarded => 2,
            Stage::Processed => 3,
            Stage::Completed => 4,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s || stage.token() == s)
            .ok_or_else(|| Error::Config(format!("unknown stage: {}", s)))
    }
}
