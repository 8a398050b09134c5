//! Origin-side invariants under arbitrary outcomes and redeliveries

use ledger_core::{
    types::{AccountNumber, InstitutionId, TransactionStatus},
    Config, Ledger,
};
use message_bus::TransferResult;
use proptest::prelude::*;
use rust_decimal::Decimal;
use tempfile::TempDir;
use transfer_saga::{OriginSaga, TransferRequest};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever the outcomes and however often they are redelivered, the
    /// account ends with no reservation and is debited exactly the sum of
    /// successful transfers.
    #[test]
    fn prop_outcomes_debit_exactly_once(
        transfers in prop::collection::vec((1i64..5_000, any::<bool>(), 1usize..3), 1..12)
    ) {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&Config::with_data_dir(dir.path())).unwrap();
        let number = AccountNumber::new("1001");
        let initial = Decimal::new(2_000_000, 2);
        ledger.open_account(number.clone(), "Alice", initial).unwrap();
        let origin = OriginSaga::new(ledger.storage().clone(), InstitutionId::new("5000"));

        let mut expected_debit = Decimal::ZERO;
        for (cents, success, deliveries) in transfers {
            let amount = Decimal::new(cents, 2);
            let receipt = origin
                .submit(TransferRequest {
                    transaction_id: None,
                    from_account_number: number.clone(),
                    to_handle: "123-4567".into(),
                    amount,
                })
                .unwrap();
            prop_assert_eq!(receipt.status, TransactionStatus::Pending);

            let status = if success { TransactionStatus::Success } else { TransactionStatus::Failed };
            let result = TransferResult {
                transaction_id: receipt.transaction_id,
                status,
                message: None,
            };
            for _ in 0..deliveries {
                origin.on_completed(&result).unwrap();
            }
            if success {
                expected_debit += amount;
            }

            let account = ledger.account(&number).unwrap();
            prop_assert!(account.available() >= Decimal::ZERO);
        }

        let account = ledger.account(&number).unwrap();
        prop_assert_eq!(account.reserved, Decimal::ZERO);
        prop_assert_eq!(account.balance, initial - expected_debit);
    }
}
