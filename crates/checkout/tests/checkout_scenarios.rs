//! End-to-end checkout scenarios against the in-memory store.

use std::collections::HashMap;
use std::time::Duration;

use checkout::{
    AddressSelection, CallbackStatus, CancelOrder, CheckoutConfig, CheckoutError,
    CheckoutFromCart, CheckoutOrchestrator, CheckoutReceipt, DiscountRule, ErrorKind,
    InMemoryCollaborators, Notification, PaymentOutcome, ShippingMethod, VerifyPayment,
};
use chrono::Utc;
use common::{AddressId, ProductId, ShippingMethodId, UserId, VariantId};
use domain::{
    Address, Money, NewAddress, OrderStatus, PaymentStatus, PriceSnapshot, ProcessStep,
    TransactionKind, Variant,
};
use store::{InMemoryStore, OrderQuery};

struct TestHarness {
    store: InMemoryStore,
    fakes: InMemoryCollaborators,
    orchestrator: CheckoutOrchestrator<InMemoryStore>,
    user: UserId,
    address: AddressId,
    shipping: ShippingMethodId,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_config(CheckoutConfig::default()).await
    }

    async fn with_config(config: CheckoutConfig) -> Self {
        let store = InMemoryStore::new();
        let fakes = InMemoryCollaborators::new();
        let shipping = fakes
            .shipping
            .add_method(ShippingMethod::flat(Money::from_units(10)));

        let user = UserId::new();
        let address = store
            .seed_address(Address {
                id: AddressId::new(),
                user_id: user,
                recipient: "Sara Ahmadi".to_string(),
                phone: "+98 912 000 0000".to_string(),
                line1: "12 Valiasr St".to_string(),
                city: "Tehran".to_string(),
                postal_code: "1234567890".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap()
            .id;

        let orchestrator =
            CheckoutOrchestrator::new(store.clone(), fakes.collaborators(), config);

        Self {
            store,
            fakes,
            orchestrator,
            user,
            address,
            shipping,
        }
    }

    /// Seeds V1: selling price 100, purchase price 60.
    async fn seed_variant(&self, on_hand: i64) -> Variant {
        let variant = Variant::new(
            ProductId::new(),
            "Ceramic Mug",
            "MUG-001",
            PriceSnapshot::new(
                Money::from_units(60),
                Money::from_units(100),
                Money::from_units(120),
            ),
        )
        .with_stock(on_hand, 0)
        .unwrap();
        self.store.seed_variant(variant).await.unwrap()
    }

    async fn add_to_cart(&self, variant: &Variant, quantity: u32) {
        self.store
            .seed_cart_line(self.user, variant.id, quantity)
            .await
            .unwrap();
    }

    fn command(&self, key: &str, prices: &[(VariantId, i64)]) -> CheckoutFromCart {
        CheckoutFromCart {
            user_id: self.user,
            shipping_method_id: self.shipping,
            address: AddressSelection::Existing(self.address),
            discount_code: None,
            expected_prices: prices
                .iter()
                .map(|(id, units)| (*id, Money::from_units(*units)))
                .collect::<HashMap<_, _>>(),
            idempotency_key: key.to_string(),
            payer_contact: Some("sara@example.com".to_string()),
        }
    }

    async fn checkout(&self, variant: &Variant, key: &str) -> Result<CheckoutReceipt, CheckoutError> {
        self.orchestrator
            .checkout_from_cart(self.command(key, &[(variant.id, 100)]))
            .await
    }

    async fn callback(&self, receipt: &CheckoutReceipt, status: CallbackStatus) -> PaymentOutcome {
        self.orchestrator
            .verify_and_process_payment(VerifyPayment {
                order_id: receipt.order_id,
                authority: receipt.authority.clone(),
                status,
            })
            .await
            .unwrap()
    }

    async fn ledger_count(&self, variant: &Variant, kind: TransactionKind) -> usize {
        self.store
            .ledger(variant.id)
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

#[tokio::test]
async fn test_scenario_a_checkout_reserves_stock() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;

    let receipt = h.checkout(&v1, "key-a").await.unwrap();

    assert_eq!(receipt.status, OrderStatus::Pending);
    assert!(!receipt.replayed);
    assert!(receipt.payment_url.ends_with(&receipt.authority));

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.subtotal(), Money::from_units(200));
    assert_eq!(order.shipping_cost(), Money::from_units(10));
    assert_eq!(order.final_amount(), Money::from_units(210));
    assert_eq!(order.total_profit(), Money::from_units(80));
    assert_eq!(receipt.final_amount, order.final_amount());

    let variant = h.store.variant(v1.id).await.unwrap();
    assert_eq!(variant.reserved(), 2);
    assert_eq!(variant.on_hand(), 5);
    assert_eq!(h.ledger_count(&v1, TransactionKind::Reservation).await, 1);

    let process = h.store.process_state(receipt.order_id).await.unwrap();
    assert_eq!(process.step, ProcessStep::PaymentPending);

    let payments = h.store.payments(receipt.order_id).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Pending);
    assert_eq!(payments[0].amount, order.final_amount());

    assert!(h.store.cart(h.user).await.is_empty());
    assert!(h.store.outbox().await.len() >= 2);
    assert!(matches!(
        h.fakes.notifications.sent().as_slice(),
        [Notification::OrderCreated { .. }]
    ));
    assert_eq!(
        h.fakes.audit.actions_for(receipt.order_id),
        vec!["order.created"]
    );
}

#[tokio::test]
async fn test_scenario_b_insufficient_stock_leaves_no_trace() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(1).await;
    h.add_to_cart(&v1, 2).await;

    let err = h.checkout(&v1, "key-b").await.unwrap_err();

    assert!(matches!(
        err,
        CheckoutError::InsufficientStock {
            requested: 2,
            available: 1,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.store.order_count().await, 0);
    assert_eq!(h.ledger_count(&v1, TransactionKind::Reservation).await, 0);
    assert_eq!(h.store.variant(v1.id).await.unwrap().reserved(), 0);
    assert_eq!(h.store.cart(h.user).await.len(), 1);
    assert_eq!(h.fakes.payment_gateway.request_count(), 0);
}

#[tokio::test]
async fn test_scenario_c_failed_payment_releases_reservation() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;
    let receipt = h.checkout(&v1, "key-c").await.unwrap();

    h.fakes.payment_gateway.set_verify_succeeds(false);
    let outcome = h.callback(&receipt, CallbackStatus::Ok).await;

    assert_eq!(
        outcome,
        PaymentOutcome::Failed {
            order_id: receipt.order_id
        }
    );

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Failed);
    assert!(!order.is_paid());

    let variant = h.store.variant(v1.id).await.unwrap();
    assert_eq!(variant.reserved(), 0);
    assert_eq!(variant.on_hand(), 5);
    assert_eq!(
        h.ledger_count(&v1, TransactionKind::ReservationRollback).await,
        1
    );

    let payments = h.store.payments(receipt.order_id).await;
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert_eq!(
        h.store.process_state(receipt.order_id).await.unwrap().step,
        ProcessStep::Compensated
    );
}

#[tokio::test]
async fn test_nok_callback_fails_without_gateway_verification() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;
    let receipt = h.checkout(&v1, "key-nok").await.unwrap();

    let outcome = h.callback(&receipt, CallbackStatus::Nok).await;

    assert!(matches!(outcome, PaymentOutcome::Failed { .. }));
    assert_eq!(h.fakes.payment_gateway.verify_count(), 0);
    assert_eq!(h.store.variant(v1.id).await.unwrap().reserved(), 0);

    // A late duplicate callback changes nothing.
    let again = h.callback(&receipt, CallbackStatus::Nok).await;
    assert!(matches!(again, PaymentOutcome::Failed { .. }));
    assert_eq!(
        h.ledger_count(&v1, TransactionKind::ReservationRollback).await,
        1
    );
}

#[tokio::test]
async fn test_scenario_d_verified_payment_commits_stock_once() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;
    let receipt = h.checkout(&v1, "key-d").await.unwrap();

    let outcome = h.callback(&receipt, CallbackStatus::Ok).await;
    assert!(matches!(
        outcome,
        PaymentOutcome::Verified { reference_id: Some(_), .. }
    ));

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Paid);
    assert!(order.is_paid());
    assert!(order.payment_at().is_some());

    let variant = h.store.variant(v1.id).await.unwrap();
    assert_eq!(variant.reserved(), 0);
    assert_eq!(variant.on_hand(), 3);

    let retried = h.callback(&receipt, CallbackStatus::Ok).await;
    assert_eq!(
        retried,
        PaymentOutcome::AlreadyPaid {
            order_id: receipt.order_id
        }
    );

    let variant = h.store.variant(v1.id).await.unwrap();
    assert_eq!(variant.on_hand(), 3);
    assert_eq!(
        h.ledger_count(&v1, TransactionKind::ConfirmReservation).await,
        1
    );
    assert_eq!(h.fakes.payment_gateway.verify_count(), 1);

    let payments = h.store.payments(receipt.order_id).await;
    assert_eq!(payments[0].status, PaymentStatus::Success);
    assert!(payments[0].reference_id.is_some());
    assert_eq!(
        h.store.process_state(receipt.order_id).await.unwrap().step,
        ProcessStep::Completed
    );
    assert!(
        h.fakes
            .notifications
            .sent()
            .iter()
            .any(|n| matches!(n, Notification::PaymentSucceeded { .. }))
    );
}

#[tokio::test]
async fn test_replay_returns_first_receipt() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;

    let first = h.checkout(&v1, "key-replay").await.unwrap();
    let second = h.checkout(&v1, "key-replay").await.unwrap();

    assert!(second.replayed);
    assert_eq!(second.order_id, first.order_id);
    assert_eq!(second.authority, first.authority);
    assert_eq!(h.store.order_count().await, 1);
    assert_eq!(h.fakes.payment_gateway.request_count(), 1);
    assert_eq!(h.ledger_count(&v1, TransactionKind::Reservation).await, 1);
}

#[tokio::test]
async fn test_replay_by_another_user_conflicts() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;
    h.checkout(&v1, "shared-key").await.unwrap();

    let mut command = h.command("shared-key", &[(v1.id, 100)]);
    command.user_id = UserId::new();
    let err = h.orchestrator.checkout_from_cart(command).await.unwrap_err();

    assert!(matches!(err, CheckoutError::IdempotencyKeyConflict));
}

#[tokio::test]
async fn test_missing_idempotency_key_is_rejected() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;

    let err = h.checkout(&v1, "  ").await.unwrap_err();
    assert!(matches!(err, CheckoutError::MissingIdempotencyKey));
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_second_checkout_within_window_is_throttled() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;
    let first = h.checkout(&v1, "key-1").await.unwrap();

    h.add_to_cart(&v1, 1).await;
    let err = h.checkout(&v1, "key-2").await.unwrap_err();

    assert!(matches!(
        err,
        CheckoutError::DuplicateSubmission { existing_order_id } if existing_order_id == first.order_id
    ));
}

#[tokio::test]
async fn test_failed_order_still_throttles_within_window() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;
    let first = h.checkout(&v1, "key-1").await.unwrap();
    h.callback(&first, CallbackStatus::Nok).await;
    assert_eq!(
        h.store.order(first.order_id).await.unwrap().status(),
        OrderStatus::Failed
    );

    h.add_to_cart(&v1, 1).await;
    let err = h.checkout(&v1, "key-2").await.unwrap_err();

    assert!(matches!(
        err,
        CheckoutError::DuplicateSubmission { existing_order_id } if existing_order_id == first.order_id
    ));
}

#[tokio::test]
async fn test_empty_cart_is_rejected() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;

    let err = h.checkout(&v1, "key-empty").await.unwrap_err();
    assert!(matches!(err, CheckoutError::EmptyCart));
}

#[tokio::test]
async fn test_stale_price_view_is_rejected() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;

    let err = h
        .orchestrator
        .checkout_from_cart(h.command("key-price", &[(v1.id, 95)]))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::PriceChanged { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = h
        .orchestrator
        .checkout_from_cart(h.command("key-set", &[(VariantId::new(), 100)]))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::ExpectedPricesMismatch { .. }));
    assert_eq!(h.store.order_count().await, 0);
}

#[tokio::test]
async fn test_foreign_address_is_not_found() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;

    let mut command = h.command("key-address", &[(v1.id, 100)]);
    command.address = AddressSelection::Existing(AddressId::new());
    let err = h.orchestrator.checkout_from_cart(command).await.unwrap_err();

    assert!(matches!(err, CheckoutError::AddressNotFound(_)));
}

#[tokio::test]
async fn test_inline_address_is_saved_with_order() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;

    let mut command = h.command("key-inline", &[(v1.id, 100)]);
    command.address = AddressSelection::New(NewAddress {
        recipient: "Sara Ahmadi".to_string(),
        phone: "+98 912 000 0000".to_string(),
        line1: "7 Enghelab Sq".to_string(),
        city: "Tehran".to_string(),
        postal_code: "1111111111".to_string(),
    });
    let receipt = h.orchestrator.checkout_from_cart(command).await.unwrap();

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_ne!(order.address_id(), h.address);
}

#[tokio::test]
async fn test_discount_code_reduces_final_amount() {
    let h = TestHarness::new().await;
    h.fakes
        .discounts
        .add_code("TEN", DiscountRule::Percent(10), Money::zero());
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;

    let mut command = h.command("key-discount", &[(v1.id, 100)]);
    command.discount_code = Some("TEN".to_string());
    let receipt = h.orchestrator.checkout_from_cart(command).await.unwrap();

    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.discount_amount(), Money::from_units(20));
    assert_eq!(order.final_amount(), Money::from_units(190));
    assert_eq!(order.discount_id(), Some("TEN"));
}

#[tokio::test]
async fn test_unknown_discount_code_is_validation_error() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;

    let mut command = h.command("key-bad-discount", &[(v1.id, 100)]);
    command.discount_code = Some("NOPE".to_string());
    let err = h.orchestrator.checkout_from_cart(command).await.unwrap_err();

    assert!(matches!(err, CheckoutError::InvalidDiscount(_)));
    assert_eq!(h.store.order_count().await, 0);
}

#[tokio::test]
async fn test_gateway_rejection_rolls_back_everything() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;
    h.fakes.payment_gateway.set_reject_requests(true);

    let err = h.checkout(&v1, "key-reject").await.unwrap_err();

    assert!(matches!(err, CheckoutError::PaymentRejected(_)));
    assert_eq!(h.store.order_count().await, 0);
    assert_eq!(h.store.variant(v1.id).await.unwrap().reserved(), 0);
    assert_eq!(h.ledger_count(&v1, TransactionKind::Reservation).await, 0);
    assert_eq!(h.store.cart(h.user).await.len(), 1);
    assert!(h.store.outbox().await.is_empty());
}

#[tokio::test]
async fn test_gateway_timeout_keeps_order_pending() {
    let h = TestHarness::with_config(CheckoutConfig {
        gateway_timeout: Duration::from_millis(20),
        ..CheckoutConfig::default()
    })
    .await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;
    h.fakes
        .payment_gateway
        .set_request_delay(Some(Duration::from_millis(500)));

    let err = h.checkout(&v1, "key-timeout").await.unwrap_err();

    let CheckoutError::PaymentOutcomeUnknown { order_id } = err else {
        panic!("expected unknown payment outcome, got {err:?}");
    };
    assert_eq!(err.kind(), ErrorKind::Transient);

    let order = h.store.order(order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Pending);
    assert_eq!(h.store.variant(v1.id).await.unwrap().reserved(), 2);
    assert!(h.store.payments(order_id).await.is_empty());

    let process = h.store.process_state(order_id).await.unwrap();
    assert_eq!(process.step, ProcessStep::PaymentPending);
    assert_eq!(process.retry_count, 1);
}

#[tokio::test]
async fn test_cancel_releases_reservation() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;
    let receipt = h.checkout(&v1, "key-cancel").await.unwrap();
    let version = h.store.order(receipt.order_id).await.unwrap().version();

    let order = h
        .orchestrator
        .cancel_order(CancelOrder {
            order_id: receipt.order_id,
            user_id: h.user,
            expected_version: version,
            reason: Some("changed my mind".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert!(order.cancelled_at().is_some());
    assert!(order.version() > version);
    assert_eq!(h.store.variant(v1.id).await.unwrap().reserved(), 0);
    assert_eq!(
        h.store.payments(receipt.order_id).await[0].status,
        PaymentStatus::Failed
    );
    assert!(
        h.fakes
            .audit
            .actions_for(receipt.order_id)
            .contains(&"order.cancelled")
    );
}

#[tokio::test]
async fn test_cancel_with_stale_version_is_rejected() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;
    let receipt = h.checkout(&v1, "key-stale").await.unwrap();
    let order = h.store.order(receipt.order_id).await.unwrap();

    let err = h
        .orchestrator
        .cancel_order(CancelOrder {
            order_id: receipt.order_id,
            user_id: h.user,
            expected_version: common::Version::first(),
            reason: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::VersionMismatch { actual, .. } if actual == order.version()));
    assert_eq!(h.store.variant(v1.id).await.unwrap().reserved(), 2);
}

#[tokio::test]
async fn test_other_users_order_cannot_be_cancelled() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;
    let receipt = h.checkout(&v1, "key-owner").await.unwrap();
    let version = h.store.order(receipt.order_id).await.unwrap().version();

    let err = h
        .orchestrator
        .cancel_order(CancelOrder {
            order_id: receipt.order_id,
            user_id: UserId::new(),
            expected_version: version,
            reason: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::OrderNotFound(_)));
}

#[tokio::test]
async fn test_callback_after_cancel_alerts_when_money_was_taken() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;
    let receipt = h.checkout(&v1, "key-late").await.unwrap();
    let version = h.store.order(receipt.order_id).await.unwrap().version();
    h.orchestrator
        .cancel_order(CancelOrder {
            order_id: receipt.order_id,
            user_id: h.user,
            expected_version: version,
            reason: None,
        })
        .await
        .unwrap();

    let outcome = h.callback(&receipt, CallbackStatus::Ok).await;

    assert!(matches!(outcome, PaymentOutcome::Failed { .. }));
    let order = h.store.order(receipt.order_id).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert_eq!(h.fakes.alerts.count_from("payment-reconciliation"), 1);
    assert_eq!(h.store.variant(v1.id).await.unwrap().on_hand(), 5);
}

#[tokio::test]
async fn test_unknown_authority_is_not_found() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;
    let receipt = h.checkout(&v1, "key-authority").await.unwrap();

    let err = h
        .orchestrator
        .verify_and_process_payment(VerifyPayment {
            order_id: receipt.order_id,
            authority: "A999999999".to_string(),
            status: CallbackStatus::Ok,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::PaymentNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_gateway_outage_during_verification_leaves_payment_pending() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 2).await;
    let receipt = h.checkout(&v1, "key-outage").await.unwrap();
    h.fakes.payment_gateway.set_fail_on_verify(true);

    let outcome = h.callback(&receipt, CallbackStatus::Ok).await;

    assert!(matches!(outcome, PaymentOutcome::Pending { .. }));
    let payments = h.store.payments(receipt.order_id).await;
    assert_eq!(payments[0].status, PaymentStatus::VerificationInProgress);
    assert_eq!(payments[0].verify_attempts, 1);
    assert_eq!(h.store.variant(v1.id).await.unwrap().reserved(), 2);

    h.fakes.payment_gateway.set_fail_on_verify(false);
    let outcome = h.callback(&receipt, CallbackStatus::Ok).await;
    assert!(matches!(outcome, PaymentOutcome::Verified { .. }));
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_checkout() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;
    h.fakes.notifications.set_fail_on_notify(true);
    h.fakes.audit.set_fail_on_record(true);

    let receipt = h.checkout(&v1, "key-sinks").await.unwrap();

    assert!(h.store.order(receipt.order_id).await.is_some());
}

#[tokio::test]
async fn test_get_orders_filters_by_owner() {
    let h = TestHarness::new().await;
    let v1 = h.seed_variant(5).await;
    h.add_to_cart(&v1, 1).await;
    let receipt = h.checkout(&v1, "key-query").await.unwrap();

    let order = h
        .orchestrator
        .get_order_by_id(receipt.order_id, Some(h.user))
        .await
        .unwrap();
    assert_eq!(order.id(), receipt.order_id);

    let err = h
        .orchestrator
        .get_order_by_id(receipt.order_id, Some(UserId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::OrderNotFound(_)));

    let page = h
        .orchestrator
        .get_orders(&OrderQuery {
            user_id: Some(h.user),
            ..OrderQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id(), receipt.order_id);
}

#[tokio::test]
async fn test_concurrent_checkouts_of_one_cart_place_one_order() {
    let h = TestHarness::new().await;
    let variant = Variant::new(
        ProductId::new(),
        "Gift Card",
        "GIFT-50",
        PriceSnapshot::new(
            Money::from_units(60),
            Money::from_units(100),
            Money::from_units(100),
        ),
    )
    .with_unlimited(true);
    let variant = h.store.seed_variant(variant).await.unwrap();
    h.add_to_cart(&variant, 1).await;
    h.fakes
        .payment_gateway
        .set_request_delay(Some(Duration::from_millis(100)));

    let (first, second) = tokio::join!(
        h.checkout(&variant, "key-first"),
        h.checkout(&variant, "key-second")
    );

    let placed = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(placed, 1, "first={first:?} second={second:?}");
    let rejected = match (first, second) {
        (Ok(_), Err(e)) | (Err(e), Ok(_)) => e,
        other => panic!("unexpected results: {other:?}"),
    };
    assert_eq!(rejected.kind(), ErrorKind::Conflict);

    assert_eq!(h.store.order_count().await, 1);
    assert!(h.store.cart(h.user).await.is_empty());
}
