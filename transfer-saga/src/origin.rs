//! Origin role: reserve, initiate, then commit or release on completion

use crate::{metrics, Error, Result};
use chrono::Utc;
use ledger_core::{
    outbox::OutboxDraft,
    storage::{Storage, StoreTxn},
    types::{
        AccountNumber, InstitutionId, OutgoingTransaction, RoutingHandle, Stage, TransactionId,
        TransactionStatus,
    },
};
use message_bus::events::{TransferInitiated, TransferResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Reason recorded for a non-positive amount
pub const AMOUNT_NOT_POSITIVE: &str = "Amount must be above 0";

/// Reason recorded when the debited account does not exist
pub const ACCOUNT_NOT_FOUND: &str = "Account not found";

/// Client transfer request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Client-chosen id; resubmitting it returns the existing receipt
    #[serde(default)]
    pub transaction_id: Option<TransactionId>,

    /// Debited account
    pub from_account_number: AccountNumber,

    /// Recipient handle
    pub to_handle: RoutingHandle,

    /// Amount
    pub amount: Decimal,
}

/// Immediate answer to a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    /// Transaction ID
    pub transaction_id: TransactionId,

    /// PENDING when the saga started, FAILED when rejected locally
    pub status: TransactionStatus,

    /// Failure reason
    pub message: Option<String>,
}

impl From<&OutgoingTransaction> for TransferReceipt {
    fn from(tx: &OutgoingTransaction) -> Self {
        Self {
            transaction_id: tx.transaction_id,
            status: tx.status,
            message: tx.message.clone(),
        }
    }
}

/// What a `completed` delivery did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// No row for the transaction
    Unknown,
    /// Row already carries this outcome
    Duplicate,
    /// Reservation committed, row SUCCESS
    Committed,
    /// Reservation released, row FAILED
    Released,
    /// Outcome contradicts the row; flagged for reconciliation
    Contradicted,
}

impl Completion {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Unknown => "unknown",
            Completion::Duplicate => "duplicate",
            Completion::Committed => "committed",
            Completion::Released => "released",
            Completion::Contradicted => "contradicted",
        }
    }
}

/// Origin side of the saga
#[derive(Debug, Clone)]
pub struct OriginSaga {
    storage: Arc<Storage>,
    institution: InstitutionId,
}

impl OriginSaga {
    /// Origin role for `institution`
    pub fn new(storage: Arc<Storage>, institution: InstitutionId) -> Self {
        Self {
            storage,
            institution,
        }
    }

    /// Institution this bank sends as
    pub fn institution(&self) -> &InstitutionId {
        &self.institution
    }

    /// Start a transfer.
    ///
    /// Local rejections (non-positive amount, unknown account, insufficient
    /// funds) are recorded as FAILED and returned as a receipt. Otherwise the
    /// reservation, the PENDING row and the `initiated` record commit together.
    pub fn submit(&self, request: TransferRequest) -> Result<TransferReceipt> {
        let transaction_id = request.transaction_id.unwrap_or_default();

        let receipt = self.storage.transaction(|txn| {
            if let Some(existing) = txn.outgoing(&transaction_id)? {
                return Ok(TransferReceipt::from(&existing));
            }

            let mut tx = OutgoingTransaction::new(
                transaction_id,
                self.institution.clone(),
                request.from_account_number.clone(),
                request.to_handle.clone(),
                request.amount,
                TransactionStatus::Pending,
            );

            if request.amount <= Decimal::ZERO {
                tx.settle(TransactionStatus::Failed, Some(AMOUNT_NOT_POSITIVE.to_string()))?;
                txn.put_outgoing(&tx)?;
                return Ok(TransferReceipt::from(&tx));
            }

            match txn.update_account(&request.from_account_number, |a| a.reserve(request.amount)) {
                Ok(_) => {}
                Err(ledger_core::Error::AccountNotFound(_)) => {
                    tx.settle(TransactionStatus::Failed, Some(ACCOUNT_NOT_FOUND.to_string()))?;
                    txn.put_outgoing(&tx)?;
                    return Ok(TransferReceipt::from(&tx));
                }
                Err(e @ ledger_core::Error::InsufficientFunds { .. }) => {
                    tx.settle(TransactionStatus::Failed, Some(e.to_string()))?;
                    txn.put_outgoing(&tx)?;
                    return Ok(TransferReceipt::from(&tx));
                }
                Err(e) => return Err(e),
            }

            txn.put_outgoing(&tx)?;
            let initiated = TransferInitiated {
                transaction_id,
                from_institution: self.institution.clone(),
                from_account_number: tx.from_account_number.clone(),
                to_handle: tx.to_handle.clone(),
                amount: tx.amount,
                status: TransactionStatus::Pending,
                created_at: tx.created_at,
            };
            txn.enqueue(OutboxDraft::new(
                transaction_id,
                Stage::Initiated,
                None,
                &initiated,
            )?);
            Ok(TransferReceipt::from(&tx))
        })?;

        match receipt.status {
            TransactionStatus::Pending => info!(
                transaction_id = %transaction_id,
                from_account = %request.from_account_number,
                to_handle = %request.to_handle,
                amount = %request.amount,
                "Transfer initiated"
            ),
            _ => warn!(
                transaction_id = %transaction_id,
                from_account = %request.from_account_number,
                reason = receipt.message.as_deref().unwrap_or(""),
                "Transfer rejected"
            ),
        }
        metrics::record_step("origin", "submit", receipt.status.as_str());
        Ok(receipt)
    }

    /// Apply a `completed` result.
    ///
    /// Redeliveries of an applied outcome are no-ops. If the account mutation
    /// fails, the error is returned so the delivery is retried and alerted
    /// on. A transient failure (exhausted conflict retries, storage) leaves
    /// the row PENDING for the redelivery; any other failure marks it FAILED
    /// for reconciliation.
    pub fn on_completed(&self, result: &TransferResult) -> Result<Completion> {
        let transaction_id = result.transaction_id;
        if !result.status.is_terminal() {
            return Err(Error::Validation(format!(
                "completed event for {} carries non-terminal status {}",
                transaction_id, result.status
            )));
        }

        let applied = self.storage.transaction(|txn| apply_completion(txn, result));
        if let Ok(outcome) = &applied {
            metrics::record_step("origin", "completed", outcome.as_str());
        }

        match applied {
            Ok(Completion::Unknown) => {
                warn!(transaction_id = %transaction_id, "Completion for unknown transaction ignored");
                Ok(Completion::Unknown)
            }
            Ok(Completion::Contradicted) => {
                error!(
                    transaction_id = %transaction_id,
                    status = %result.status,
                    "Completion contradicts recorded outcome, flagged for reconciliation"
                );
                Ok(Completion::Contradicted)
            }
            Ok(outcome) => {
                info!(transaction_id = %transaction_id, status = %result.status, ?outcome, "Transfer completed");
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    transaction_id = %transaction_id,
                    status = %result.status,
                    error = %e,
                    "Failed to apply completion"
                );
                self.record_completion_failure(&transaction_id, &e);
                metrics::record_step("origin", "completed", "error");
                Err(e.into())
            }
        }
    }

    fn record_completion_failure(&self, transaction_id: &TransactionId, cause: &ledger_core::Error) {
        if cause.is_retryable() {
            warn!(
                transaction_id = %transaction_id,
                error = %cause,
                "Completion left pending for redelivery"
            );
            return;
        }
        if let Err(mark_err) = self.mark_for_reconciliation(transaction_id, cause) {
            error!(
                transaction_id = %transaction_id,
                error = %mark_err,
                "Failed to flag transaction for reconciliation"
            );
        }
    }

    fn mark_for_reconciliation(
        &self,
        transaction_id: &TransactionId,
        cause: &ledger_core::Error,
    ) -> ledger_core::Result<()> {
        self.storage.transaction(|txn| {
            let Some(mut tx) = txn.outgoing(transaction_id)? else {
                return Ok(());
            };
            if !tx.status.is_terminal() {
                tx.settle(TransactionStatus::Failed, Some(cause.to_string()))?;
            }
            tx.needs_reconciliation = true;
            tx.updated_at = Utc::now();
            txn.put_outgoing(&tx)
        })
    }
}

fn apply_completion(
    txn: &mut StoreTxn<'_>,
    result: &TransferResult,
) -> ledger_core::Result<Completion> {
    let Some(mut tx) = txn.outgoing(&result.transaction_id)? else {
        return Ok(Completion::Unknown);
    };

    if tx.status.is_terminal() {
        if tx.status == result.status {
            return Ok(Completion::Duplicate);
        }
        if !tx.needs_reconciliation {
            tx.needs_reconciliation = true;
            tx.updated_at = Utc::now();
            txn.put_outgoing(&tx)?;
        }
        return Ok(Completion::Contradicted);
    }

    let amount = tx.amount;
    let outcome = match result.status {
        TransactionStatus::Success => {
            txn.update_account(&tx.from_account_number, |a| a.commit(amount))?;
            Completion::Committed
        }
        _ => {
            txn.update_account(&tx.from_account_number, |a| a.release(amount))?;
            Completion::Released
        }
    };
    tx.settle(result.status, result.message.clone())?;
    txn.put_outgoing(&tx)?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{Config, Ledger};
    use tempfile::TempDir;

    fn setup() -> (OriginSaga, Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&Config::with_data_dir(temp_dir.path())).unwrap();
        ledger
            .open_account(AccountNumber::new("1001"), "Alice", Decimal::from(100))
            .unwrap();
        let saga = OriginSaga::new(ledger.storage().clone(), InstitutionId::new("5000"));
        (saga, ledger, temp_dir)
    }

    fn request(amount: i64) -> TransferRequest {
        TransferRequest {
            transaction_id: None,
            from_account_number: AccountNumber::new("1001"),
            to_handle: RoutingHandle::new("123-4567"),
            amount: Decimal::from(amount),
        }
    }

    fn result(id: TransactionId, status: TransactionStatus) -> TransferResult {
        TransferResult {
            transaction_id: id,
            status,
            message: Some("Transaction processed".to_string()),
        }
    }

    #[test]
    fn test_submit_reserves_and_enqueues() {
        let (saga, ledger, _dir) = setup();
        let receipt = saga.submit(request(40)).unwrap();
        assert_eq!(receipt.status, TransactionStatus::Pending);

        let account = ledger.account(&AccountNumber::new("1001")).unwrap();
        assert_eq!(account.reserved, Decimal::from(40));
        assert_eq!(account.balance, Decimal::from(100));

        let records = ledger
            .storage()
            .outbox_for_transaction(&receipt.transaction_id)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, Stage::Initiated);
        assert!(records[0].key.is_none());

        let body: serde_json::Value = serde_json::from_str(&records[0].payload).unwrap();
        assert_eq!(body["fromInstitution"], "5000");
        assert_eq!(body["amount"], "40");
    }

    #[test]
    fn test_submit_rejections_are_recorded() {
        let (saga, ledger, _dir) = setup();

        let zero = saga.submit(request(0)).unwrap();
        assert_eq!(zero.status, TransactionStatus::Failed);
        assert_eq!(zero.message.as_deref(), Some(AMOUNT_NOT_POSITIVE));

        let mut missing = request(10);
        missing.from_account_number = AccountNumber::new("9999");
        let missing = saga.submit(missing).unwrap();
        assert_eq!(missing.message.as_deref(), Some(ACCOUNT_NOT_FOUND));

        let too_much = saga.submit(request(150)).unwrap();
        assert_eq!(too_much.status, TransactionStatus::Failed);
        assert!(too_much.message.unwrap().contains("Insufficient funds"));

        assert_eq!(ledger.storage().pending_outbox_count().unwrap(), 0);
        let account = ledger.account(&AccountNumber::new("1001")).unwrap();
        assert_eq!(account.reserved, Decimal::ZERO);
        assert_eq!(
            ledger.storage().outgoing(&zero.transaction_id).unwrap().unwrap().status,
            TransactionStatus::Failed
        );
    }

    #[test]
    fn test_resubmit_returns_existing_receipt() {
        let (saga, ledger, _dir) = setup();
        let id = TransactionId::new();
        let mut req = request(30);
        req.transaction_id = Some(id);

        let first = saga.submit(req.clone()).unwrap();
        let second = saga.submit(req).unwrap();
        assert_eq!(first, second);

        let account = ledger.account(&AccountNumber::new("1001")).unwrap();
        assert_eq!(account.reserved, Decimal::from(30));
    }

    #[test]
    fn test_success_commits_once() {
        let (saga, ledger, _dir) = setup();
        let receipt = saga.submit(request(40)).unwrap();
        let success = result(receipt.transaction_id, TransactionStatus::Success);

        assert_eq!(saga.on_completed(&success).unwrap(), Completion::Committed);
        assert_eq!(saga.on_completed(&success).unwrap(), Completion::Duplicate);

        let account = ledger.account(&AccountNumber::new("1001")).unwrap();
        assert_eq!(account.balance, Decimal::from(60));
        assert_eq!(account.reserved, Decimal::ZERO);
    }

    #[test]
    fn test_failure_releases() {
        let (saga, ledger, _dir) = setup();
        let receipt = saga.submit(request(40)).unwrap();
        let failed = TransferResult {
            transaction_id: receipt.transaction_id,
            status: TransactionStatus::Failed,
            message: Some("account not found".to_string()),
        };

        assert_eq!(saga.on_completed(&failed).unwrap(), Completion::Released);
        let account = ledger.account(&AccountNumber::new("1001")).unwrap();
        assert_eq!(account.balance, Decimal::from(100));
        assert_eq!(account.available(), Decimal::from(100));

        let row = ledger.storage().outgoing(&receipt.transaction_id).unwrap().unwrap();
        assert_eq!(row.message.as_deref(), Some("account not found"));
    }

    #[test]
    fn test_unknown_and_pending_results() {
        let (saga, _ledger, _dir) = setup();
        let unknown = result(TransactionId::new(), TransactionStatus::Success);
        assert_eq!(saga.on_completed(&unknown).unwrap(), Completion::Unknown);

        let pending = result(TransactionId::new(), TransactionStatus::Pending);
        assert!(matches!(saga.on_completed(&pending), Err(Error::Validation(_))));
    }

    #[test]
    fn test_contradicting_result_flags_reconciliation() {
        let (saga, ledger, _dir) = setup();
        let receipt = saga.submit(request(40)).unwrap();
        let failed = result(receipt.transaction_id, TransactionStatus::Failed);
        saga.on_completed(&failed).unwrap();

        let success = result(receipt.transaction_id, TransactionStatus::Success);
        assert_eq!(saga.on_completed(&success).unwrap(), Completion::Contradicted);

        let row = ledger.storage().outgoing(&receipt.transaction_id).unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Failed);
        assert!(row.needs_reconciliation);
        let account = ledger.account(&AccountNumber::new("1001")).unwrap();
        assert_eq!(account.balance, Decimal::from(100));
    }

    #[test]
    fn test_mutation_failure_marks_reconciliation() {
        let (saga, ledger, _dir) = setup();
        let receipt = saga.submit(request(40)).unwrap();
        // Reservation vanishes behind the saga's back
        ledger
            .release(&AccountNumber::new("1001"), Decimal::from(40))
            .unwrap();

        let success = result(receipt.transaction_id, TransactionStatus::Success);
        assert!(saga.on_completed(&success).is_err());

        let row = ledger.storage().outgoing(&receipt.transaction_id).unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Failed);
        assert!(row.needs_reconciliation);

        // Redelivery is an acknowledged contradiction, not another failure
        assert_eq!(saga.on_completed(&success).unwrap(), Completion::Contradicted);
    }

    #[test]
    fn test_transient_failure_keeps_row_pending() {
        let (saga, ledger, _dir) = setup();
        let receipt = saga.submit(request(40)).unwrap();

        saga.record_completion_failure(
            &receipt.transaction_id,
            &ledger_core::Error::ConcurrentModification { attempts: 5 },
        );
        let row = ledger.storage().outgoing(&receipt.transaction_id).unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Pending);
        assert!(!row.needs_reconciliation);

        // The redelivered completion still releases the reservation
        let failed = result(receipt.transaction_id, TransactionStatus::Failed);
        assert_eq!(saga.on_completed(&failed).unwrap(), Completion::Released);
        let account = ledger.account(&AccountNumber::new("1001")).unwrap();
        assert_eq!(account.reserved, Decimal::ZERO);
        assert_eq!(account.balance, Decimal::from(100));
    }
}
