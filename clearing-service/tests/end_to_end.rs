//! Full saga across two banks and clearing over the in-memory bus

use clearing_service::{ClearingConsumer, ClearingEngine, NewRoute, RoutingTable};
use ledger_core::{
    storage::Storage,
    types::{AccountNumber, InstitutionId, RoutingHandle, Stage, TransactionId, TransactionStatus},
    Config, Ledger,
};
use message_bus::{InMemoryBus, PartitionKey, SagaEvent};
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;
use transfer_saga::{
    BankConsumer, DestinationSaga, OriginSaga, OutboxRelay, RelayConfig, TransferReceipt,
    TransferRequest,
};

struct Bank {
    ledger: Ledger,
    origin: OriginSaga,
    relay: OutboxRelay,
    _dir: TempDir,
}

struct Clearing {
    storage: Arc<Storage>,
    relay: OutboxRelay,
    _dir: TempDir,
}

struct Network {
    bus: Arc<InMemoryBus>,
    bank_a: Bank,
    bank_b: Bank,
    clearing: Clearing,
}

fn bank(bus: &Arc<InMemoryBus>, institution: &str) -> Bank {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(&Config::with_data_dir(dir.path())).unwrap();
    let storage = ledger.storage().clone();
    let id = InstitutionId::new(institution);

    let origin = OriginSaga::new(storage.clone(), id.clone());
    let consumer = Arc::new(BankConsumer::new(
        origin.clone(),
        DestinationSaga::new(storage.clone(), id.clone()),
    ));
    let key = PartitionKey::Institution(id);
    bus.subscribe(
        format!("bank-{}", institution),
        Stage::Forwarded,
        Some(key.clone()),
        consumer.clone(),
    );
    bus.subscribe(format!("bank-{}", institution), Stage::Completed, Some(key), consumer);

    let relay = OutboxRelay::new(
        storage,
        bus.clone(),
        RelayConfig::default(),
        format!("bank-{}-relay", institution),
    );
    Bank {
        ledger,
        origin,
        relay,
        _dir: dir,
    }
}

fn clearing(bus: &Arc<InMemoryBus>) -> Clearing {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::open(&Config::with_data_dir(dir.path())).unwrap());
    let routing = RoutingTable::new(storage.clone());
    routing
        .register(NewRoute {
            handle: RoutingHandle::new("123-4567"),
            institution: InstitutionId::new("6000"),
            account_number: AccountNumber::new("2002"),
            display_name: "Bob".to_string(),
        })
        .unwrap();
    routing
        .register(NewRoute {
            handle: RoutingHandle::new("555-0000"),
            institution: InstitutionId::new("6000"),
            account_number: AccountNumber::new("9999"),
            display_name: "Closed account".to_string(),
        })
        .unwrap();

    let consumer = Arc::new(ClearingConsumer::new(ClearingEngine::new(storage.clone())));
    bus.subscribe("clearing", Stage::Initiated, None, consumer.clone());
    bus.subscribe("clearing", Stage::Processed, None, consumer);

    let relay = OutboxRelay::new(
        storage.clone(),
        bus.clone(),
        RelayConfig::default(),
        "clearing-relay",
    );
    Clearing {
        storage,
        relay,
        _dir: dir,
    }
}

impl Network {
    fn new() -> Self {
        let bus = Arc::new(InMemoryBus::new());
        let bank_a = bank(&bus, "5000");
        let bank_b = bank(&bus, "6000");
        let clearing = clearing(&bus);

        bank_a
            .ledger
            .open_account(AccountNumber::new("1001"), "Alice", Decimal::from(500))
            .unwrap();
        bank_b
            .ledger
            .open_account(AccountNumber::new("2002"), "Bob", Decimal::ZERO)
            .unwrap();

        Self {
            bus,
            bank_a,
            bank_b,
            clearing,
        }
    }

    fn send(&self, handle: &str, amount: Decimal) -> TransferReceipt {
        self.bank_a
            .origin
            .submit(TransferRequest {
                transaction_id: None,
                from_account_number: AccountNumber::new("1001"),
                to_handle: RoutingHandle::new(handle),
                amount,
            })
            .unwrap()
    }

    /// Relay and deliver until nothing moves
    async fn settle(&self) {
        for _ in 0..32 {
            let mut moved = 0;
            for relay in [&self.bank_a.relay, &self.bank_b.relay, &self.clearing.relay] {
                moved += relay.run_once().await.unwrap().published;
            }
            let report = self.bus.pump().await;
            moved += report.delivered + report.dropped;
            if moved == 0 {
                return;
            }
        }
        panic!("saga did not settle");
    }

    fn alice(&self) -> ledger_core::Account {
        self.bank_a.ledger.account(&AccountNumber::new("1001")).unwrap()
    }

    fn bob(&self) -> ledger_core::Account {
        self.bank_b.ledger.account(&AccountNumber::new("2002")).unwrap()
    }

    fn origin_row(&self, id: &TransactionId) -> ledger_core::OutgoingTransaction {
        self.bank_a.ledger.storage().outgoing(id).unwrap().unwrap()
    }
}

#[tokio::test]
async fn happy_path_moves_funds_once() {
    let net = Network::new();
    let receipt = net.send("123-4567", Decimal::new(5000, 2));
    assert_eq!(receipt.status, TransactionStatus::Pending);
    assert_eq!(net.alice().reserved, Decimal::new(5000, 2));

    net.settle().await;

    let alice = net.alice();
    assert_eq!(alice.balance, Decimal::new(45000, 2));
    assert_eq!(alice.reserved, Decimal::ZERO);
    assert_eq!(net.bob().balance, Decimal::new(5000, 2));

    let row = net.origin_row(&receipt.transaction_id);
    assert_eq!(row.status, TransactionStatus::Success);
    assert!(!row.needs_reconciliation);

    let clearing_row = net
        .clearing
        .storage
        .outgoing(&receipt.transaction_id)
        .unwrap()
        .unwrap();
    assert_eq!(clearing_row.status, TransactionStatus::Success);

    for stage in Stage::ALL {
        assert_eq!(net.bus.published_on(stage).len(), 1, "one {} message", stage);
    }
    let forwarded = &net.bus.published_on(Stage::Forwarded)[0];
    assert_eq!(forwarded.key.as_record_key().as_deref(), Some("6000"));
    let completed = &net.bus.published_on(Stage::Completed)[0];
    assert_eq!(completed.key.as_record_key().as_deref(), Some("5000"));
}

#[tokio::test]
async fn scenario_reserve_then_commit() {
    let net = Network::new();
    let number = AccountNumber::new("1001");

    let reserved = net.bank_a.ledger.reserve(&number, Decimal::from(200)).unwrap();
    assert_eq!(reserved.reserved, Decimal::from(200));
    assert_eq!(reserved.available(), Decimal::from(300));

    let committed = net.bank_a.ledger.commit(&number, Decimal::from(200)).unwrap();
    assert_eq!(committed.balance, Decimal::from(300));
    assert_eq!(committed.reserved, Decimal::ZERO);
}

#[tokio::test]
async fn scenario_insufficient_funds_produces_no_outbox() {
    let net = Network::new();
    let receipt = net.send("123-4567", Decimal::from(600));

    assert_eq!(receipt.status, TransactionStatus::Failed);
    assert_eq!(net.alice().balance, Decimal::from(500));
    assert_eq!(net.alice().reserved, Decimal::ZERO);
    assert_eq!(net.bank_a.ledger.storage().pending_outbox_count().unwrap(), 0);

    net.settle().await;
    assert!(net.bus.published().is_empty());
}

#[tokio::test]
async fn scenario_unknown_handle_releases_reservation() {
    let net = Network::new();
    let receipt = net.send("XYZ", Decimal::from(100));
    net.settle().await;

    let row = net.origin_row(&receipt.transaction_id);
    assert_eq!(row.status, TransactionStatus::Failed);
    assert!(row.message.unwrap().contains("no routing entry"));

    let alice = net.alice();
    assert_eq!(alice.reserved, Decimal::ZERO);
    assert_eq!(alice.balance, Decimal::from(500));
    assert!(net.bus.published_on(Stage::Forwarded).is_empty());
}

#[tokio::test]
async fn scenario_destination_account_missing() {
    let net = Network::new();
    let receipt = net.send("555-0000", Decimal::from(50));
    net.settle().await;

    let incoming = net
        .bank_b
        .ledger
        .storage()
        .incoming(&receipt.transaction_id)
        .unwrap()
        .unwrap();
    assert_eq!(incoming.status, TransactionStatus::Failed);

    let row = net.origin_row(&receipt.transaction_id);
    assert_eq!(row.status, TransactionStatus::Failed);
    assert_eq!(row.message.as_deref(), Some("account not found"));
    assert_eq!(net.alice().available(), Decimal::from(500));
}

#[tokio::test]
async fn scenario_forwarded_redelivery_is_idempotent() {
    let net = Network::new();
    let receipt = net.send("123-4567", Decimal::from(50));
    net.settle().await;
    assert_eq!(net.bob().balance, Decimal::from(50));

    let forwarded = net.bus.published_on(Stage::Forwarded)[0].clone();
    net.bus.redeliver(&forwarded);
    net.settle().await;

    assert_eq!(net.bob().balance, Decimal::from(50));
    let processed: Vec<_> = net
        .bank_b
        .ledger
        .storage()
        .outbox_for_transaction(&receipt.transaction_id)
        .unwrap()
        .into_iter()
        .filter(|r| r.stage == Stage::Processed)
        .collect();
    assert_eq!(processed.len(), 1);
    assert_eq!(net.bus.published_on(Stage::Processed).len(), 1);
}

#[tokio::test]
async fn duplicate_initiated_and_completed_change_nothing() {
    let net = Network::new();
    let receipt = net.send("123-4567", Decimal::from(50));
    net.settle().await;

    let initiated = net.bus.published_on(Stage::Initiated)[0].clone();
    let completed = net.bus.published_on(Stage::Completed)[0].clone();
    net.bus.redeliver(&initiated);
    net.bus.redeliver(&completed);
    net.bus.redeliver(&completed);
    net.settle().await;

    assert_eq!(net.bus.published_on(Stage::Forwarded).len(), 1);
    assert_eq!(net.alice().balance, Decimal::from(450));
    assert_eq!(net.bob().balance, Decimal::from(50));
    assert_eq!(
        net.origin_row(&receipt.transaction_id).status,
        TransactionStatus::Success
    );
}

#[tokio::test]
async fn scenario_concurrent_submissions_reserve_once() {
    let net = Network::new();
    let origin = net.bank_a.origin.clone();
    let barrier = Arc::new(std::sync::Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let origin = origin.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                origin
                    .submit(TransferRequest {
                        transaction_id: None,
                        from_account_number: AccountNumber::new("1001"),
                        to_handle: RoutingHandle::new("123-4567"),
                        amount: Decimal::from(300),
                    })
                    .unwrap()
            })
        })
        .collect();
    let receipts: Vec<TransferReceipt> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let pending = receipts
        .iter()
        .filter(|r| r.status == TransactionStatus::Pending)
        .count();
    assert_eq!(pending, 1);
    let failed = receipts
        .iter()
        .find(|r| r.status == TransactionStatus::Failed)
        .unwrap();
    assert!(failed.message.as_deref().unwrap().contains("Insufficient funds"));

    let alice = net.alice();
    assert_eq!(alice.reserved, Decimal::from(300));
    assert_eq!(alice.available(), Decimal::from(200));
}

#[tokio::test]
async fn outage_delays_but_never_loses_events() {
    let net = Network::new();
    let first = net.send("123-4567", Decimal::from(10));
    let second = net.send("123-4567", Decimal::from(20));

    net.bus.set_outage(true);
    let report = net.bank_a.relay.run_once().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(net.bank_a.ledger.storage().pending_outbox_count().unwrap(), 2);

    net.bus.set_outage(false);
    net.settle().await;

    let initiated: Vec<TransactionId> = net
        .bus
        .published_on(Stage::Initiated)
        .iter()
        .map(|m| match m.decode().unwrap() {
            SagaEvent::Initiated(e) => e.transaction_id,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(initiated, vec![first.transaction_id, second.transaction_id]);

    assert_eq!(net.bob().balance, Decimal::from(30));
    assert_eq!(net.alice().balance, Decimal::from(470));
    assert_eq!(net.alice().reserved, Decimal::ZERO);
}
