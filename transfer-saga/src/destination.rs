//! Destination role: credit the recipient and report the outcome

use crate::{metrics, Result};
use ledger_core::{
    outbox::OutboxDraft,
    storage::Storage,
    types::{IncomingTransaction, InstitutionId, Stage, TransactionStatus},
};
use message_bus::events::{TransferForwarded, TransferResult};
use std::sync::Arc;
use tracing::{info, warn};

/// Reason recorded when the credited account does not exist
pub const ACCOUNT_NOT_FOUND: &str = "account not found";

/// Reason recorded on a successful credit
pub const PROCESSED: &str = "Transaction processed";

/// What a `forwarded` delivery did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarding {
    /// First delivery, row settled with this status
    Applied(TransactionStatus),
    /// Row already existed with this status
    Duplicate(TransactionStatus),
}

/// Destination side of the saga
#[derive(Debug, Clone)]
pub struct DestinationSaga {
    storage: Arc<Storage>,
    institution: InstitutionId,
}

impl DestinationSaga {
    /// Destination role for `institution`
    pub fn new(storage: Arc<Storage>, institution: InstitutionId) -> Self {
        Self {
            storage,
            institution,
        }
    }

    /// Credit a forwarded transfer. The incoming row, the deposit and the
    /// `processed` record commit together; the first write wins.
    pub fn on_forwarded(&self, event: &TransferForwarded) -> Result<Forwarding> {
        let transaction_id = event.transaction_id;
        if event.to_institution != self.institution {
            warn!(
                transaction_id = %transaction_id,
                to_institution = %event.to_institution,
                institution = %self.institution,
                "Forwarded transfer addressed to another institution"
            );
        }

        let forwarding = self.storage.transaction(|txn| {
            if let Some(existing) = txn.incoming(&transaction_id)? {
                return Ok(Forwarding::Duplicate(existing.status));
            }

            let mut incoming = IncomingTransaction::pending(
                transaction_id,
                event.to_institution.clone(),
                event.to_account_number.clone(),
                event.amount,
            );

            match txn.update_account(&event.to_account_number, |a| a.deposit(event.amount)) {
                Ok(_) => incoming.settle(TransactionStatus::Success, PROCESSED)?,
                Err(ledger_core::Error::AccountNotFound(_)) => {
                    incoming.settle(TransactionStatus::Failed, ACCOUNT_NOT_FOUND)?
                }
                Err(
                    e @ (ledger_core::Error::InvalidAmount(_)
                    | ledger_core::Error::BalanceOverflow { .. }),
                ) => {
                    incoming.settle(TransactionStatus::Failed, e.to_string())?
                }
                Err(e) => return Err(e),
            }
            txn.put_incoming(&incoming)?;

            if !txn.outbox_contains(&transaction_id, Stage::Processed)? {
                let processed = TransferResult {
                    transaction_id,
                    status: incoming.status,
                    message: incoming.message.clone(),
                };
                txn.enqueue(OutboxDraft::new(
                    transaction_id,
                    Stage::Processed,
                    None,
                    &processed,
                )?);
            }
            Ok(Forwarding::Applied(incoming.status))
        })?;

        match forwarding {
            Forwarding::Applied(status) => {
                metrics::record_step("destination", "forwarded", status.as_str());
                info!(
                    transaction_id = %transaction_id,
                    to_account = %event.to_account_number,
                    amount = %event.amount,
                    status = %status,
                    "Incoming transfer processed"
                );
            }
            Forwarding::Duplicate(status) => {
                metrics::record_step("destination", "forwarded", "duplicate");
                info!(
                    transaction_id = %transaction_id,
                    status = %status,
                    "Duplicate forwarded delivery ignored"
                );
            }
        }
        Ok(forwarding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ledger_core::{
        types::{AccountNumber, TransactionId},
        Config, Ledger,
    };
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn setup() -> (DestinationSaga, Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&Config::with_data_dir(temp_dir.path())).unwrap();
        ledger
            .open_account(AccountNumber::new("2002"), "Bob", Decimal::ZERO)
            .unwrap();
        let saga = DestinationSaga::new(ledger.storage().clone(), InstitutionId::new("6000"));
        (saga, ledger, temp_dir)
    }

    fn forwarded(account: &str, amount: i64) -> TransferForwarded {
        TransferForwarded {
            transaction_id: TransactionId::new(),
            to_institution: InstitutionId::new("6000"),
            to_account_number: AccountNumber::new(account),
            amount: Decimal::from(amount),
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_credit_and_processed_record() {
        let (saga, ledger, _dir) = setup();
        let event = forwarded("2002", 50);

        assert_eq!(
            saga.on_forwarded(&event).unwrap(),
            Forwarding::Applied(TransactionStatus::Success)
        );
        let account = ledger.account(&AccountNumber::new("2002")).unwrap();
        assert_eq!(account.balance, Decimal::from(50));

        let records = ledger
            .storage()
            .outbox_for_transaction(&event.transaction_id)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, Stage::Processed);
        let body: TransferResult = serde_json::from_str(&records[0].payload).unwrap();
        assert_eq!(body.status, TransactionStatus::Success);
        assert_eq!(body.message.as_deref(), Some(PROCESSED));
    }

    #[test]
    fn test_redelivery_credits_once() {
        let (saga, ledger, _dir) = setup();
        let event = forwarded("2002", 50);

        saga.on_forwarded(&event).unwrap();
        assert_eq!(
            saga.on_forwarded(&event).unwrap(),
            Forwarding::Duplicate(TransactionStatus::Success)
        );

        let account = ledger.account(&AccountNumber::new("2002")).unwrap();
        assert_eq!(account.balance, Decimal::from(50));
        assert_eq!(
            ledger
                .storage()
                .outbox_for_transaction(&event.transaction_id)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_balance_overflow_fails_without_credit() {
        let (saga, ledger, _dir) = setup();
        saga.on_forwarded(&forwarded("2002", 1)).unwrap();

        let event = TransferForwarded {
            amount: Decimal::MAX,
            ..forwarded("2002", 1)
        };
        assert_eq!(
            saga.on_forwarded(&event).unwrap(),
            Forwarding::Applied(TransactionStatus::Failed)
        );

        let account = ledger.account(&AccountNumber::new("2002")).unwrap();
        assert_eq!(account.balance, Decimal::ONE);

        let records = ledger
            .storage()
            .outbox_for_transaction(&event.transaction_id)
            .unwrap();
        assert_eq!(records.len(), 1);
        let body: TransferResult = serde_json::from_str(&records[0].payload).unwrap();
        assert_eq!(body.status, TransactionStatus::Failed);
    }

    #[test]
    fn test_unknown_account_fails() {
        let (saga, ledger, _dir) = setup();
        let event = forwarded("9999", 50);

        assert_eq!(
            saga.on_forwarded(&event).unwrap(),
            Forwarding::Applied(TransactionStatus::Failed)
        );
        let row = ledger.storage().incoming(&event.transaction_id).unwrap().unwrap();
        assert_eq!(row.message.as_deref(), Some(ACCOUNT_NOT_FOUND));
    }
}
