//! Integration tests for the payment reconciliation sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use checkout::{
    AddressSelection, CheckoutConfig, CheckoutFromCart, CheckoutOrchestrator, CheckoutReceipt,
    InMemoryCollaborators, Notification, ReconciliationSweeper, ShippingMethod, SweeperConfig,
};
use common::{ProductId, UserId};
use domain::{
    Money, NewAddress, OrderStatus, PaymentStatus, PriceSnapshot, ProcessStep, TransactionKind,
    Variant,
};
use store::{InMemoryStore, OrderRepository, Store, UnitOfWork};
use tokio_util::sync::CancellationToken;

struct TestHarness {
    store: InMemoryStore,
    fakes: InMemoryCollaborators,
    orchestrator: Arc<CheckoutOrchestrator<InMemoryStore>>,
    variant: Variant,
}

impl TestHarness {
    async fn new() -> Self {
        let store = InMemoryStore::new();
        let fakes = InMemoryCollaborators::new();
        let orchestrator = Arc::new(CheckoutOrchestrator::new(
            store.clone(),
            fakes.collaborators(),
            CheckoutConfig::default(),
        ));

        let variant = Variant::new(
            ProductId::new(),
            "Linen Shirt",
            "SHIRT-M",
            PriceSnapshot::new(
                Money::from_units(40),
                Money::from_units(100),
                Money::from_units(100),
            ),
        )
        .with_stock(5, 0)
        .unwrap();
        let variant = store.seed_variant(variant).await.unwrap();

        Self {
            store,
            fakes,
            orchestrator,
            variant,
        }
    }

    /// Checks out two units for a fresh user.
    async fn place_order(&self) -> CheckoutReceipt {
        let user = UserId::new();
        self.store
            .seed_cart_line(user, self.variant.id, 2)
            .await
            .unwrap();
        let shipping = self
            .fakes
            .shipping
            .add_method(ShippingMethod::flat(Money::zero()));

        self.orchestrator
            .checkout_from_cart(CheckoutFromCart {
                user_id: user,
                shipping_method_id: shipping,
                address: AddressSelection::New(NewAddress {
                    recipient: "Omid Karimi".to_string(),
                    phone: "+98 935 000 0000".to_string(),
                    line1: "3 Hafez Ave".to_string(),
                    city: "Shiraz".to_string(),
                    postal_code: "7133333333".to_string(),
                }),
                discount_code: None,
                expected_prices: HashMap::from([(self.variant.id, Money::from_units(100))]),
                idempotency_key: format!("sweep-{user}"),
                payer_contact: None,
            })
            .await
            .unwrap()
    }

    fn sweeper(&self, config: SweeperConfig) -> ReconciliationSweeper<InMemoryStore> {
        ReconciliationSweeper::new(self.orchestrator.clone(), config)
    }

    /// Everything is overdue as soon as it exists.
    fn overdue_config() -> SweeperConfig {
        SweeperConfig {
            stuck_payment_timeout: chrono::Duration::zero(),
            payment_window: chrono::Duration::zero(),
            ..SweeperConfig::default()
        }
    }

    /// Commits a no-op update of the order so its version moves on.
    async fn touch_order(&self, order_id: common::OrderId) {
        let mut uow = self.store.begin().await.unwrap();
        let mut order = uow.find_order(order_id).await.unwrap().unwrap();
        uow.update_order(&mut order).await.unwrap();
        uow.commit().await.unwrap();
    }

    async fn confirmations(&self) -> usize {
        self.store
            .ledger(self.variant.id)
            .await
            .iter()
            .filter(|e| e.kind == TransactionKind::ConfirmReservation)
            .count()
    }

    async fn rollbacks(&self) -> usize {
        self.store
            .ledger(self.variant.id)
            .await
            .iter()
            .filter(|e| e.kind == TransactionKind::ReservationRollback)
            .count()
    }
}

#[tokio::test]
async fn test_scenario_e_stuck_payment_expires_and_releases_once() {
    let h = TestHarness::new().await;
    let receipt = h.place_order().await;
    h.fakes.payment_gateway.set_verify_succeeds(false);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sweeper = h.sweeper(TestHarness::overdue_config());
    let report = sweeper.sweep_once().await.unwrap();

    assert_eq!(report.payments_checked, 1);
    assert_eq!(report.payments_confirmed, 0);
    assert_eq!(report.orders_expired, 1);
    assert_eq!(report.failures, 0);

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Expired);
    assert_eq!(
        h.store.payments(receipt.order_id).await[0].status,
        PaymentStatus::Expired
    );
    assert_eq!(h.store.variant(h.variant.id).await.unwrap().reserved(), 0);
    assert_eq!(h.rollbacks().await, 1);
    assert_eq!(
        h.store.process_state(receipt.order_id).await.unwrap().step,
        ProcessStep::Compensated
    );

    // Nothing is left for a second pass.
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.orders_expired, 0);
    assert_eq!(report.payments_checked, 0);
    assert_eq!(h.rollbacks().await, 1);
    assert!(
        h.fakes
            .notifications
            .sent()
            .iter()
            .any(|n| matches!(n, Notification::OrderExpired { .. }))
    );
}

#[tokio::test]
async fn test_stuck_payment_verified_by_sweeper_confirms_order() {
    let h = TestHarness::new().await;
    let receipt = h.place_order().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sweeper = h.sweeper(SweeperConfig {
        stuck_payment_timeout: chrono::Duration::zero(),
        ..SweeperConfig::default()
    });
    let report = sweeper.sweep_once().await.unwrap();

    assert_eq!(report.payments_confirmed, 1);
    assert_eq!(report.orders_expired, 0);

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Paid);
    let variant = h.store.variant(h.variant.id).await.unwrap();
    assert_eq!(variant.on_hand(), 3);
    assert_eq!(variant.reserved(), 0);
}

#[tokio::test]
async fn test_unverified_payment_inside_window_is_left_alone() {
    let h = TestHarness::new().await;
    let receipt = h.place_order().await;
    h.fakes.payment_gateway.set_verify_succeeds(false);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sweeper = h.sweeper(SweeperConfig {
        stuck_payment_timeout: chrono::Duration::zero(),
        ..SweeperConfig::default()
    });
    let report = sweeper.sweep_once().await.unwrap();

    assert_eq!(report.payments_checked, 1);
    assert_eq!(report.orders_expired, 0);

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Pending);
    assert_eq!(h.store.variant(h.variant.id).await.unwrap().reserved(), 2);
    let payment = &h.store.payments(receipt.order_id).await[0];
    assert_eq!(payment.status, PaymentStatus::VerificationInProgress);
    assert_eq!(payment.verify_attempts, 1);
}

#[tokio::test]
async fn test_paid_orders_are_never_expired() {
    let h = TestHarness::new().await;
    let receipt = h.place_order().await;
    h.orchestrator
        .verify_and_process_payment(checkout::VerifyPayment {
            order_id: receipt.order_id,
            authority: receipt.authority.clone(),
            status: checkout::CallbackStatus::Ok,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h
        .sweeper(TestHarness::overdue_config())
        .sweep_once()
        .await
        .unwrap();

    assert_eq!(report.orders_expired, 0);
    assert_eq!(
        h.store.order(receipt.order_id).await.unwrap().status(),
        OrderStatus::Paid
    );
    assert_eq!(h.rollbacks().await, 0);
}

#[tokio::test]
async fn test_sweep_fails_when_store_is_down() {
    let h = TestHarness::new().await;
    h.store.set_fail_on_begin(true).await;

    let result = h.sweeper(SweeperConfig::default()).sweep_once().await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_run_alerts_once_after_repeated_failures_and_stops() {
    let h = TestHarness::new().await;
    h.store.set_fail_on_begin(true).await;

    let sweeper = Arc::new(h.sweeper(SweeperConfig {
        interval: Duration::from_millis(5),
        max_backoff: Duration::from_millis(5),
        error_threshold: 3,
        ..SweeperConfig::default()
    }));
    let shutdown = CancellationToken::new();

    let task = {
        let sweeper = sweeper.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("sweeper did not stop")
        .unwrap();

    assert_eq!(h.fakes.alerts.count_from("reconciliation-sweeper"), 1);
}

#[tokio::test]
async fn test_conflicting_write_is_retried_and_resolved_once() {
    let h = TestHarness::new().await;
    let receipt = h.place_order().await;
    let before = h.store.order(receipt.order_id).await.unwrap().version();
    h.fakes
        .payment_gateway
        .set_verify_delay(Some(Duration::from_millis(150)));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sweeper = h.sweeper(SweeperConfig {
        stuck_payment_timeout: chrono::Duration::zero(),
        ..SweeperConfig::default()
    });
    let sweep = tokio::spawn(async move { sweeper.sweep_once().await });

    // Lands while the first attempt waits on the gateway.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.touch_order(receipt.order_id).await;

    let report = sweep.await.unwrap().unwrap();

    assert_eq!(report.payments_confirmed, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(h.fakes.payment_gateway.verify_count(), 2);

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Paid);
    assert!(order.version() > before.next());
    assert_eq!(h.confirmations().await, 1);
    let variant = h.store.variant(h.variant.id).await.unwrap();
    assert_eq!(variant.on_hand(), 3);
    assert_eq!(variant.reserved(), 0);
}

#[tokio::test]
async fn test_callback_racing_sweeper_confirms_stock_once() {
    let h = TestHarness::new().await;
    let receipt = h.place_order().await;
    h.fakes
        .payment_gateway
        .set_verify_delay(Some(Duration::from_millis(50)));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sweeper = h.sweeper(SweeperConfig {
        stuck_payment_timeout: chrono::Duration::zero(),
        ..SweeperConfig::default()
    });
    let (callback, report) = tokio::join!(
        h.orchestrator
            .verify_and_process_payment(checkout::VerifyPayment {
                order_id: receipt.order_id,
                authority: receipt.authority.clone(),
                status: checkout::CallbackStatus::Ok,
            }),
        sweeper.sweep_once()
    );

    // The callback does not retry; losing the race surfaces as a conflict.
    if let Err(e) = &callback {
        assert!(e.is_conflict(), "unexpected callback error: {e}");
    }
    let report = report.unwrap();
    assert_eq!(report.failures, 0);

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Paid);
    assert_eq!(h.confirmations().await, 1);
    assert_eq!(h.rollbacks().await, 0);
    let variant = h.store.variant(h.variant.id).await.unwrap();
    assert_eq!(variant.on_hand(), 3);
    assert_eq!(variant.reserved(), 0);
}

#[tokio::test]
async fn test_run_sweeps_immediately_on_start() {
    let h = TestHarness::new().await;
    let receipt = h.place_order().await;
    h.fakes.payment_gateway.set_verify_succeeds(false);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sweeper = Arc::new(h.sweeper(SweeperConfig {
        interval: Duration::from_secs(3600),
        ..TestHarness::overdue_config()
    }));
    let shutdown = CancellationToken::new();
    let task = {
        let sweeper = sweeper.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("sweeper did not stop")
        .unwrap();

    assert_eq!(
        h.store.order(receipt.order_id).await.unwrap().status(),
        OrderStatus::Expired
    );
}
