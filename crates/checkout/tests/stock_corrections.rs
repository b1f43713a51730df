//! Manual stock corrections and ledger reconciliation against the in-memory
//! store.

use checkout::{
    CheckoutConfig, CheckoutOrchestrator, ErrorKind, InMemoryCollaborators, StockCorrection,
};
use common::{ProductId, VariantId};
use domain::{Actor, Money, PriceSnapshot, StockLedger, TransactionKind, Variant};
use store::{InMemoryStore, StockRepository, Store, UnitOfWork};

struct TestHarness {
    store: InMemoryStore,
    orchestrator: CheckoutOrchestrator<InMemoryStore>,
    clerk: Actor,
}

impl TestHarness {
    fn new() -> Self {
        let store = InMemoryStore::new();
        let orchestrator = CheckoutOrchestrator::new(
            store.clone(),
            InMemoryCollaborators::new().collaborators(),
            CheckoutConfig::default(),
        );
        Self {
            store,
            orchestrator,
            clerk: Actor::system("warehouse"),
        }
    }

    fn variant(on_hand: i64, reserved: i64) -> Variant {
        Variant::new(
            ProductId::new(),
            "Desk Lamp",
            "LAMP-1",
            PriceSnapshot::new(
                Money::from_units(20),
                Money::from_units(45),
                Money::from_units(50),
            ),
        )
        .with_stock(on_hand, reserved)
        .unwrap()
    }

    /// Inserts a variant whose counters have no ledger rows behind them.
    async fn insert_without_ledger(&self, mut variant: Variant) -> Variant {
        let mut uow = self.store.begin().await.unwrap();
        uow.insert_variant(&mut variant).await.unwrap();
        uow.commit().await.unwrap();
        variant
    }

    async fn correct(
        &self,
        variant_id: VariantId,
        correction: StockCorrection,
    ) -> checkout::Result<Option<domain::InventoryTransaction>> {
        self.orchestrator
            .correct_stock(variant_id, correction, self.clerk.clone())
            .await
    }

    async fn derived_on_hand(&self, variant_id: VariantId) -> i64 {
        StockLedger::derived_on_hand(&self.store.ledger(variant_id).await)
    }
}

#[tokio::test]
async fn test_return_and_damage_move_on_hand_and_ledger_together() {
    let h = TestHarness::new();
    let v = h.store.seed_variant(TestHarness::variant(5, 0)).await.unwrap();
    let outbox_before = h.store.outbox().await.len();

    let entry = h
        .correct(
            v.id,
            StockCorrection::Return {
                quantity: 2,
                reason: "customer return".to_string(),
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.kind, TransactionKind::Return);
    assert_eq!(entry.quantity_delta, 2);
    assert_eq!(entry.stock_before, 5);

    h.correct(
        v.id,
        StockCorrection::Damage {
            quantity: 1,
            reason: "cracked in storage".to_string(),
        },
    )
    .await
    .unwrap();

    let stored = h.store.variant(v.id).await.unwrap();
    assert_eq!(stored.on_hand(), 6);
    assert_eq!(h.derived_on_hand(v.id).await, 6);
    assert_eq!(h.store.outbox().await.len(), outbox_before + 2);
}

#[tokio::test]
async fn test_adjustment_below_reserved_is_rejected_without_writes() {
    let h = TestHarness::new();
    let v = h.store.seed_variant(TestHarness::variant(5, 3)).await.unwrap();
    let ledger_before = h.store.ledger(v.id).await.len();

    let err = h
        .correct(
            v.id,
            StockCorrection::Adjust {
                delta: -3,
                reason: "stock count".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h
        .correct(
            v.id,
            StockCorrection::Adjust {
                delta: 1,
                reason: "  ".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let stored = h.store.variant(v.id).await.unwrap();
    assert_eq!(stored.on_hand(), 5);
    assert_eq!(stored.reserved(), 3);
    assert_eq!(h.store.ledger(v.id).await.len(), ledger_before);
}

#[tokio::test]
async fn test_correction_of_unknown_variant_is_not_found() {
    let h = TestHarness::new();

    let err = h
        .correct(
            VariantId::new(),
            StockCorrection::Return {
                quantity: 1,
                reason: "return".to_string(),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_reconcile_records_drift_once() {
    let h = TestHarness::new();
    let v = h.insert_without_ledger(TestHarness::variant(5, 0)).await;
    assert_eq!(h.derived_on_hand(v.id).await, 0);

    let entry = h
        .orchestrator
        .reconcile_stock(v.id, h.clerk.clone())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(entry.kind, TransactionKind::Adjustment);
    assert_eq!(entry.quantity_delta, 5);
    assert_eq!(entry.reference.as_deref(), Some("reconciliation"));
    assert_eq!(h.derived_on_hand(v.id).await, 5);
    assert_eq!(h.store.variant(v.id).await.unwrap().on_hand(), 5);

    let again = h
        .orchestrator
        .reconcile_stock(v.id, h.clerk.clone())
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(h.store.ledger(v.id).await.len(), 1);
}

#[tokio::test]
async fn test_reconcile_leaves_consistent_ledger_alone() {
    let h = TestHarness::new();
    let v = h.store.seed_variant(TestHarness::variant(4, 1)).await.unwrap();
    let commits = h.store.commit_count().await;

    let entry = h
        .orchestrator
        .reconcile_stock(v.id, h.clerk.clone())
        .await
        .unwrap();

    assert!(entry.is_none());
    assert_eq!(h.store.commit_count().await, commits);
}
