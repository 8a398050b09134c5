//! Account ledger operations
//!
//! Each operation runs as its own optimistic transaction against the
//! account's version token. The saga engines compose the same transitions
//! inside larger transactions through [`StoreTxn::update_account`].
//!
//! None of these are idempotent on their own: calling `commit` twice debits
//! twice. Callers guarantee one invocation per `(transaction id, stage)`.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{Config, Ledger};
//! use ledger_core::types::AccountNumber;
//! use rust_decimal::Decimal;
//!
//! fn main() -> ledger_core::Result<()> {
//!     let ledger = Ledger::open(&Config::default())?;
//!     let number = AccountNumber::new("1001");
//!     ledger.open_account(number.clone(), "Alice", Decimal::from(500))?;
//!     let account = ledger.reserve(&number, Decimal::from(200))?;
//!     assert_eq!(account.available(), Decimal::from(300));
//!     Ok(())
//! }
//! ```

use crate::{
    storage::{Storage, StoreTxn},
    types::{Account, AccountNumber},
    Config, Error, Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Main ledger interface
#[derive(Debug, Clone)]
pub struct Ledger {
    storage: Arc<Storage>,
}

impl Ledger {
    /// Wrap an open store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Open ledger with configuration
    pub fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(Arc::new(Storage::open(config)?)))
    }

    /// Underlying store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Open a new account
    pub fn open_account(
        &self,
        number: AccountNumber,
        holder: &str,
        initial_balance: Decimal,
    ) -> Result<Account> {
        let account = Account::open(number, holder, initial_balance)?;
        self.storage.transaction(|txn| {
            if txn.account(&account.account_number)?.is_some() {
                return Err(Error::DuplicateAccount(account.account_number.to_string()));
            }
            txn.put_account(&account)?;
            Ok(())
        })?;

        tracing::info!(
            account_number = %account.account_number,
            balance = %account.balance,
            "Account opened"
        );
        Ok(account)
    }

    /// Get account by number
    pub fn account(&self, number: &AccountNumber) -> Result<Account> {
        self.storage
            .account(number)?
            .ok_or_else(|| Error::AccountNotFound(number.to_string()))
    }

    /// All accounts
    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.storage.accounts()
    }

    /// Change the holder name
    pub fn update_holder(&self, number: &AccountNumber, holder: &str) -> Result<Account> {
        self.apply(number, "rename", |account| Ok(account.rename(holder)))
    }

    /// Delete an account. Refused while any funds are reserved; the
    /// reservation check and the delete commit in one transaction.
    pub fn close_account(&self, number: &AccountNumber) -> Result<Account> {
        let closed = self.storage.transaction(|txn| {
            let account = txn
                .account(number)?
                .ok_or_else(|| Error::AccountNotFound(number.to_string()))?;
            if account.reserved > Decimal::ZERO {
                return Err(Error::ReservationsOutstanding {
                    account: number.to_string(),
                    reserved: account.reserved,
                });
            }
            txn.delete_account(number);
            Ok(account)
        })?;

        tracing::info!(
            account_number = %number,
            balance = %closed.balance,
            "Account closed"
        );
        Ok(closed)
    }

    /// Credit settled funds
    pub fn deposit(&self, number: &AccountNumber, amount: Decimal) -> Result<Account> {
        self.apply(number, "deposit", |account| account.deposit(amount))
    }

    /// Earmark funds
    pub fn reserve(&self, number: &AccountNumber, amount: Decimal) -> Result<Account> {
        self.apply(number, "reserve", |account| account.reserve(amount))
    }

    /// Finalize a reserved debit
    pub fn commit(&self, number: &AccountNumber, amount: Decimal) -> Result<Account> {
        self.apply(number, "commit", |account| account.commit(amount))
    }

    /// Return reserved funds
    pub fn release(&self, number: &AccountNumber, amount: Decimal) -> Result<Account> {
        self.apply(number, "release", |account| account.release(amount))
    }

    fn apply<F>(&self, number: &AccountNumber, op: &'static str, f: F) -> Result<Account>
    where
        F: Fn(&Account) -> Result<Account>,
    {
        let account = self
            .storage
            .transaction(|txn| txn.update_account(number, &f))?;

        tracing::debug!(
            account_number = %number,
            op,
            balance = %account.balance,
            reserved = %account.reserved,
            version = account.version,
            "Account updated"
        );
        Ok(account)
    }
}

impl StoreTxn<'_> {
    /// Read an account, apply a transition, and buffer the result.
    pub fn update_account<F>(&mut self, number: &AccountNumber, f: F) -> Result<Account>
    where
        F: FnOnce(&Account) -> Result<Account>,
    {
        let current = self
            .account(number)?
            .ok_or_else(|| Error::AccountNotFound(number.to_string()))?;
        let next = f(&current)?;
        self.put_account(&next)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(temp_dir.path());
        (Ledger::open(&config).unwrap(), temp_dir)
    }

    #[test]
    fn test_reserve_commit_scenario() {
        let (ledger, _temp) = test_ledger();
        let number = AccountNumber::new("A");
        ledger
            .open_account(number.clone(), "Alice", Decimal::from(500))
            .unwrap();

        let account = ledger.reserve(&number, Decimal::from(200)).unwrap();
        assert_eq!(account.reserved, Decimal::from(200));
        assert_eq!(account.available(), Decimal::from(300));

        let account = ledger.commit(&number, Decimal::from(200)).unwrap();
        assert_eq!(account.balance, Decimal::from(300));
        assert_eq!(account.reserved, Decimal::ZERO);
    }

    #[test]
    fn test_insufficient_funds_leaves_account_unchanged() {
        let (ledger, _temp) = test_ledger();
        let number = AccountNumber::new("A");
        ledger
            .open_account(number.clone(), "Alice", Decimal::from(100))
            .unwrap();

        let err = ledger.reserve(&number, Decimal::from(200)).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let account = ledger.account(&number).unwrap();
        assert_eq!(account.balance, Decimal::from(100));
        assert_eq!(account.reserved, Decimal::ZERO);
        assert_eq!(account.version, 0);
    }

    #[test]
    fn test_duplicate_account() {
        let (ledger, _temp) = test_ledger();
        let number = AccountNumber::new("A");
        ledger
            .open_account(number.clone(), "Alice", Decimal::ZERO)
            .unwrap();
        let err = ledger
            .open_account(number, "Mallory", Decimal::from(1_000_000))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAccount(_)));
    }

    #[test]
    fn test_unknown_account() {
        let (ledger, _temp) = test_ledger();
        let err = ledger
            .deposit(&AccountNumber::new("nope"), Decimal::ONE)
            .unwrap_err();
        assert!(matches!(err, Error::AccountNotFound(_)));
    }

    #[test]
    fn test_close_refused_while_reserved() {
        let (ledger, _temp) = test_ledger();
        let number = AccountNumber::new("A");
        ledger
            .open_account(number.clone(), "Alice", Decimal::from(100))
            .unwrap();
        ledger.reserve(&number, Decimal::from(30)).unwrap();

        let err = ledger.close_account(&number).unwrap_err();
        assert!(matches!(err, Error::ReservationsOutstanding { .. }));
        assert_eq!(ledger.account(&number).unwrap().reserved, Decimal::from(30));

        ledger.release(&number, Decimal::from(30)).unwrap();
        let closed = ledger.close_account(&number).unwrap();
        assert_eq!(closed.balance, Decimal::from(100));
        assert!(matches!(
            ledger.account(&number).unwrap_err(),
            Error::AccountNotFound(_)
        ));
        assert!(matches!(
            ledger.close_account(&number).unwrap_err(),
            Error::AccountNotFound(_)
        ));
    }

    #[test]
    fn test_update_holder() {
        let (ledger, _temp) = test_ledger();
        let number = AccountNumber::new("A");
        ledger
            .open_account(number.clone(), "Alice", Decimal::from(100))
            .unwrap();
        let account = ledger.update_holder(&number, "Alice Smith").unwrap();
        assert_eq!(account.holder, "Alice Smith");
        assert_eq!(ledger.account(&number).unwrap().holder, "Alice Smith");
        assert!(ledger
            .update_holder(&AccountNumber::new("nope"), "X")
            .is_err());
    }

    #[test]
    fn test_deposit_overflow_is_an_error() {
        let (ledger, _temp) = test_ledger();
        let number = AccountNumber::new("A");
        ledger
            .open_account(number.clone(), "Alice", Decimal::ONE)
            .unwrap();
        let err = ledger.deposit(&number, Decimal::MAX).unwrap_err();
        assert!(matches!(err, Error::BalanceOverflow { .. }));
        assert_eq!(ledger.account(&number).unwrap().balance, Decimal::ONE);
    }

    #[test]
    fn test_release_restores_available() {
        let (ledger, _temp) = test_ledger();
        let number = AccountNumber::new("A");
        ledger
            .open_account(number.clone(), "Alice", Decimal::from(100))
            .unwrap();
        ledger.reserve(&number, Decimal::from(50)).unwrap();
        let account = ledger.release(&number, Decimal::from(50)).unwrap();
        assert_eq!(account.balance, Decimal::from(100));
        assert_eq!(account.available(), Decimal::from(100));
    }
}
