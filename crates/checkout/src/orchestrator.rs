//! Checkout orchestrator.
//!
//! [`CheckoutOrchestrator::checkout_from_cart`] turns a cart into an order in
//! one unit of work: validate, lock and reserve stock, start the gateway
//! payment, commit. [`CheckoutOrchestrator::verify_and_process_payment`] is the
//! other half and either confirms the reservations or releases them.
//!
//! Every release (failed payment, cancellation, expiry) goes through
//! [`release_order_reservations`].

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use chrono::{DateTime, Utc};
use common::{AddressId, OrderId, UserId, VariantId};
use domain::{
    Actor, AppliedDiscount, BatchFailure, BatchFailureReason, CartLine, InventoryEngine,
    InventoryTransaction, Money,
    NewOrder, Order, OrderItem, OrderProcessState, OrderTrigger, OutboxMessage,
    PaymentStatus, PaymentTransaction, ProcessStep, StockLine, TransactionKind, Variant,
    VerificationDetails,
};
use serde_json::json;
use store::{
    CartRepository, OrderQuery, OrderRepository, OutboxRepository, Page, PaymentRepository,
    ProcessStateRepository, StockRepository, Store, StoreError, UnitOfWork,
};

use crate::commands::{
    AddressSelection, CallbackStatus, CancelOrder, CheckoutFromCart, CheckoutReceipt,
    PaymentOutcome, VerifyPayment,
};
use crate::compensation::release_order_reservations;
use crate::config::CheckoutConfig;
use crate::services::{
    Alert, AuditEvent, Collaborators, GatewayError, Notification, PaymentRequest,
    PaymentVerification,
};
use crate::stock::{
    StockCorrection, apply_correction, lock_variant_map, persist_stock_changes, reconcile_variant,
};
use crate::{CheckoutError, ErrorKind, Result};

pub(crate) const CALLBACK_ACTOR: &str = "payment-callback";
pub(crate) const SWEEPER_ACTOR: &str = "reconciliation-sweeper";

/// Who asked for a payment to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerificationOrigin {
    /// The payer came back through the gateway callback.
    Callback,
    /// The sweeper picked up a stuck payment.
    Sweeper,
}

impl VerificationOrigin {
    fn actor(self) -> Actor {
        match self {
            VerificationOrigin::Callback => Actor::system(CALLBACK_ACTOR),
            VerificationOrigin::Sweeper => Actor::system(SWEEPER_ACTOR),
        }
    }
}

/// What the gateway said about a payment.
enum GatewayVerdict {
    Verified(PaymentVerification),
    NotVerified,
    /// Timed out or unreachable. Nothing can be concluded.
    Unknown(String),
}

/// Drives orders from cart to a payment outcome.
pub struct CheckoutOrchestrator<S: Store> {
    store: S,
    collaborators: Collaborators,
    config: CheckoutConfig,
}

impl<S: Store> CheckoutOrchestrator<S> {
    pub fn new(store: S, collaborators: Collaborators, config: CheckoutConfig) -> Self {
        Self {
            store,
            collaborators,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    /// Places an order from the user's cart and starts its payment.
    ///
    /// A repeated idempotency key returns the first receipt with
    /// `replayed = true`. If the gateway does not answer within the configured
    /// timeout the order is committed in `Pending` and
    /// [`CheckoutError::PaymentOutcomeUnknown`] is returned.
    #[tracing::instrument(
        skip(self, command),
        fields(user_id = %command.user_id, idempotency_key = %command.idempotency_key)
    )]
    pub async fn checkout_from_cart(&self, command: CheckoutFromCart) -> Result<CheckoutReceipt> {
        metrics::counter!("checkout_attempts_total").increment(1);
        let started = Instant::now();

        let result = self.place_order(&command).await;

        metrics::histogram!("checkout_duration_seconds").record(started.elapsed().as_secs_f64());
        match &result {
            Ok(receipt) => {
                metrics::counter!("checkout_completed_total").increment(1);
                tracing::info!(
                    order_id = %receipt.order_id,
                    replayed = receipt.replayed,
                    "checkout completed"
                );
            }
            Err(e) => {
                metrics::counter!("checkout_rejected_total", "reason" => e.reason()).increment(1);
                match e.kind() {
                    ErrorKind::Invariant | ErrorKind::Compensation => {
                        tracing::error!(error = %e, "checkout failed")
                    }
                    _ => tracing::warn!(error = %e, "checkout rejected"),
                }
            }
        }

        result
    }

    async fn place_order(&self, command: &CheckoutFromCart) -> Result<CheckoutReceipt> {
        if command.idempotency_key.trim().is_empty() {
            return Err(CheckoutError::MissingIdempotencyKey);
        }

        let mut uow = self.store.begin().await?;
        if let Some(existing) = uow
            .find_order_by_idempotency_key(&command.idempotency_key)
            .await?
        {
            return replay(&mut uow, &existing, command.user_id).await;
        }

        match self.place_new_order(uow, command).await {
            // Lost the race against a concurrent checkout with the same key.
            Err(CheckoutError::Store(err @ StoreError::DuplicateKey { entity: "order idempotency", .. })) => {
                let mut uow = self.store.begin().await?;
                match uow
                    .find_order_by_idempotency_key(&command.idempotency_key)
                    .await?
                {
                    Some(existing) => replay(&mut uow, &existing, command.user_id).await,
                    None => Err(err.into()),
                }
            }
            other => other,
        }
    }

    async fn place_new_order(
        &self,
        mut uow: S::Tx,
        command: &CheckoutFromCart,
    ) -> Result<CheckoutReceipt> {
        let now = Utc::now();
        let user_id = command.user_id;
        let actor = Actor::User(user_id);

        // 1. Hold the cart so checkouts of one user run one at a time
        let cart = uow.lock_cart(user_id).await?;

        // 2. Throttle duplicate submissions
        if let Some(open) = uow
            .latest_open_order_for_user(user_id, now - self.config.duplicate_order_window)
            .await?
        {
            return Err(CheckoutError::DuplicateSubmission {
                existing_order_id: open.id(),
            });
        }

        // 3. Check the client's price list against the cart
        if cart.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        check_expected_prices(&cart, &command.expected_prices)?;

        // 4. Delivery address
        let address_id = resolve_address(&mut uow, user_id, &command.address, now).await?;

        // 5. Lock variants in id order and validate every line
        let mut variants = lock_variant_map(&mut uow, cart.iter().map(|l| l.variant_id)).await?;
        let items = build_items(&cart, &variants, &command.expected_prices)?;

        // 6. Shipping and discount
        let subtotal: Money = items.iter().map(OrderItem::amount).sum();
        let shipping = &self.collaborators.shipping;
        if !shipping
            .is_available(command.shipping_method_id, subtotal)
            .await?
        {
            return Err(CheckoutError::ShippingUnavailable(command.shipping_method_id));
        }
        let shipping_cost = shipping.get_cost(command.shipping_method_id, &cart).await?;

        let discount = match command
            .discount_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
        {
            Some(code) => {
                let applied = self
                    .collaborators
                    .discounts
                    .validate_and_apply(code, subtotal, user_id)
                    .await?;
                Some(AppliedDiscount {
                    discount_id: applied.discount_id,
                    amount: applied.amount,
                })
            }
            None => None,
        };

        // 7. Create the order
        let mut order = Order::place(NewOrder {
            id: OrderId::new(),
            user_id,
            items,
            shipping_cost,
            discount,
            shipping_method_id: command.shipping_method_id,
            address_id,
            idempotency_key: command.idempotency_key.clone(),
            now,
        })?;
        uow.insert_order(&mut order).await?;

        let mut process = OrderProcessState::new(order.id(), now);
        process.advance(ProcessStep::InventoryReserving, now)?;

        // 8. Reserve stock against the new order items
        let lines: Vec<StockLine> = order
            .items()
            .iter()
            .map(|item| StockLine::for_item(item.variant_id(), item.quantity(), item.id()))
            .collect();
        let entries = InventoryEngine::reserve_batch(&mut variants, &lines, &actor)
            .map_err(reservation_error)?;
        persist_stock_changes(&mut uow, &mut variants, &entries, now).await?;

        order.fire(OrderTrigger::Reserve, now)?;
        process.advance(ProcessStep::InventoryReserved, now)?;
        uow.clear_cart(user_id).await?;

        // 9. Start the payment
        let request = PaymentRequest {
            order_id: order.id(),
            amount: order.final_amount(),
            description: format!("Order {}", order.id()),
            callback_url: self.config.callback_url.clone(),
            payer_contact: command.payer_contact.clone(),
        };
        let requested = tokio::time::timeout(
            self.config.gateway_timeout,
            self.collaborators.payment_gateway.request_payment(request),
        )
        .await;

        let initiation = match requested {
            Ok(Ok(initiation)) => initiation,
            Ok(Err(GatewayError::Rejected(reason))) => {
                return Err(CheckoutError::PaymentRejected(reason));
            }
            Ok(Err(GatewayError::Unavailable(reason))) => {
                return Err(CheckoutError::GatewayUnavailable(reason));
            }
            Err(_) => {
                tracing::warn!(order_id = %order.id(), "payment request timed out");
                order.fire(OrderTrigger::AwaitPayment, now)?;
                process.advance(ProcessStep::PaymentPending, now)?;
                process.record_failure("payment request timed out", now);
                uow.update_order(&mut order).await?;
                uow.save_process_state(&mut process).await?;
                uow.enqueue_outbox(&OutboxMessage::for_order(&order, now)?)
                    .await?;
                uow.commit().await?;
                return Err(CheckoutError::PaymentOutcomeUnknown {
                    order_id: order.id(),
                });
            }
        };

        let mut payment = PaymentTransaction::new(
            order.id(),
            initiation.authority,
            initiation.redirect_url,
            order.final_amount(),
            now,
        );
        uow.insert_payment(&mut payment).await?;

        order.fire(OrderTrigger::AwaitPayment, now)?;
        process.advance(ProcessStep::PaymentPending, now)?;
        uow.update_order(&mut order).await?;
        uow.save_process_state(&mut process).await?;
        uow.enqueue_outbox(&OutboxMessage::for_order(&order, now)?)
            .await?;

        // 10. Commit
        uow.commit().await?;

        tracing::info!(
            order_id = %order.id(),
            final_amount = %order.final_amount(),
            items = order.items().len(),
            "order placed"
        );

        self.notify(Notification::OrderCreated {
            order_id: order.id(),
            user_id,
            final_amount: order.final_amount(),
        })
        .await;
        self.audit(AuditEvent::new(
            "order.created",
            order.id(),
            &actor,
            json!({
                "final_amount": order.final_amount().cents(),
                "items": order.items().len(),
                "authority": payment.authority,
            }),
        ))
        .await;

        Ok(CheckoutReceipt {
            order_id: order.id(),
            status: order.status(),
            final_amount: order.final_amount(),
            payment_url: payment.payment_url,
            authority: payment.authority,
            replayed: false,
        })
    }

    /// Resolves a payment reported by the gateway callback.
    #[tracing::instrument(
        skip(self, command),
        fields(order_id = %command.order_id, authority = %command.authority, status = ?command.status)
    )]
    pub async fn verify_and_process_payment(&self, command: VerifyPayment) -> Result<PaymentOutcome> {
        self.resolve_payment(
            command.order_id,
            &command.authority,
            command.status,
            VerificationOrigin::Callback,
        )
        .await
    }

    pub(crate) async fn resolve_payment(
        &self,
        order_id: OrderId,
        authority: &str,
        status: CallbackStatus,
        origin: VerificationOrigin,
    ) -> Result<PaymentOutcome> {
        let now = Utc::now();
        let actor = origin.actor();
        let mut uow = self.store.begin().await?;

        let order = uow
            .find_order(order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))?;
        let payment = uow
            .find_payment_by_authority(authority)
            .await?
            .filter(|p| p.order_id == order_id)
            .ok_or_else(|| CheckoutError::PaymentNotFound(authority.to_string()))?;

        if order.is_paid() {
            tracing::info!("order already paid");
            return Ok(PaymentOutcome::AlreadyPaid { order_id });
        }

        if !order.status().awaits_payment() {
            return self
                .settle_closed_order_payment(uow, &order, payment, status, now)
                .await;
        }

        if payment.status.is_terminal() {
            tracing::info!(payment_status = %payment.status, "payment already resolved");
            return Ok(match payment.status {
                PaymentStatus::Success => PaymentOutcome::AlreadyPaid { order_id },
                _ => PaymentOutcome::Failed { order_id },
            });
        }

        match status {
            CallbackStatus::Nok => {
                self.fail_payment(uow, order, payment, &actor, "gateway reported failure", now)
                    .await
            }
            CallbackStatus::Ok => {
                self.verify_open_order_payment(uow, order, payment, origin, now)
                    .await
            }
        }
    }

    async fn verify_open_order_payment(
        &self,
        mut uow: S::Tx,
        order: Order,
        mut payment: PaymentTransaction,
        origin: VerificationOrigin,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome> {
        let order_id = order.id();
        let actor = origin.actor();

        payment.begin_verification(now)?;
        let verdict = self.verify_with_gateway(&payment).await;

        match verdict {
            GatewayVerdict::Verified(verification) => {
                self.confirm_payment(uow, order, payment, verification, &actor, now)
                    .await
            }
            GatewayVerdict::NotVerified if origin == VerificationOrigin::Callback => {
                self.fail_payment(uow, order, payment, &actor, "gateway did not verify payment", now)
                    .await
            }
            GatewayVerdict::NotVerified => {
                // Left for expiry once the payment window has passed.
                let mut process = load_process(&mut uow, order_id).await?;
                process.record_failure("gateway did not verify payment", now);
                uow.update_payment(&mut payment).await?;
                uow.save_process_state(&mut process).await?;
                uow.commit().await?;
                tracing::info!("payment not verified yet");
                Ok(PaymentOutcome::Pending { order_id })
            }
            GatewayVerdict::Unknown(reason) => {
                let mut process = load_process(&mut uow, order_id).await?;
                process.record_failure(reason.as_str(), now);
                uow.update_payment(&mut payment).await?;
                uow.save_process_state(&mut process).await?;
                uow.commit().await?;
                tracing::warn!(%reason, "payment verification deferred");
                Ok(PaymentOutcome::Pending { order_id })
            }
        }
    }

    async fn confirm_payment(
        &self,
        mut uow: S::Tx,
        mut order: Order,
        mut payment: PaymentTransaction,
        verification: PaymentVerification,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome> {
        let order_id = order.id();

        // Only reservations not yet confirmed; a retried verification finds none.
        let mut lines = Vec::new();
        for item in order.items() {
            if uow
                .ledger_has_entry(TransactionKind::ConfirmReservation, item.id())
                .await?
            {
                continue;
            }
            if !uow
                .ledger_has_entry(TransactionKind::Reservation, item.id())
                .await?
            {
                continue;
            }
            lines.push(StockLine::for_item(
                item.variant_id(),
                item.quantity(),
                item.id(),
            ));
        }

        if !lines.is_empty() {
            let mut variants =
                lock_variant_map(&mut uow, lines.iter().map(|l| l.variant_id)).await?;
            let entries = match InventoryEngine::confirm_batch(&mut variants, &lines, actor) {
                Ok(entries) => entries,
                Err(failures) => {
                    let reason = describe_failures(&failures);
                    tracing::error!(%reason, "confirming reservations failed");
                    self.alert(
                        Alert::critical(
                            "checkout",
                            format!("confirming reservations of a verified payment failed: {reason}"),
                        )
                        .for_order(order_id),
                    )
                    .await;
                    return Err(CheckoutError::InvariantViolation(format!(
                        "order {order_id}: {reason}"
                    )));
                }
            };
            persist_stock_changes(&mut uow, &mut variants, &entries, now).await?;
        }

        let reference_id = verification.reference_id.clone();
        payment.mark_succeeded(
            VerificationDetails {
                reference_id: verification.reference_id,
                card_mask: verification.card_mask,
                fee: verification.fee,
            },
            now,
        )?;
        uow.update_payment(&mut payment).await?;

        order.fire(OrderTrigger::ConfirmPayment, now)?;
        uow.update_order(&mut order).await?;

        let mut process = load_process(&mut uow, order_id).await?;
        process.advance(ProcessStep::PaymentSucceeded, now)?;
        process.advance(ProcessStep::Completed, now)?;
        uow.save_process_state(&mut process).await?;

        uow.enqueue_outbox(&OutboxMessage::for_order(&order, now)?)
            .await?;
        uow.commit().await?;

        metrics::counter!("payments_verified_total").increment(1);
        tracing::info!(reference_id = ?reference_id, "payment verified");

        self.notify(Notification::PaymentSucceeded {
            order_id,
            user_id: order.user_id(),
        })
        .await;
        self.audit(AuditEvent::new(
            "payment.verified",
            order_id,
            actor,
            json!({ "authority": payment.authority, "reference_id": reference_id }),
        ))
        .await;

        Ok(PaymentOutcome::Verified {
            order_id,
            reference_id,
        })
    }

    async fn fail_payment(
        &self,
        mut uow: S::Tx,
        mut order: Order,
        mut payment: PaymentTransaction,
        actor: &Actor,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome> {
        let order_id = order.id();

        payment.mark_failed(now)?;
        uow.update_payment(&mut payment).await?;
        self.compensate(&mut uow, &mut order, OrderTrigger::FailPayment, actor, reason, now)
            .await?;
        uow.commit().await?;

        metrics::counter!("payments_failed_total").increment(1);
        tracing::info!(%reason, "payment failed, reservations released");

        self.notify(Notification::PaymentFailed {
            order_id,
            user_id: order.user_id(),
        })
        .await;
        self.audit(AuditEvent::new(
            "payment.failed",
            order_id,
            actor,
            json!({ "authority": payment.authority, "reason": reason }),
        ))
        .await;

        Ok(PaymentOutcome::Failed { order_id })
    }

    /// A callback for an order that is no longer waiting for its payment.
    ///
    /// The order is never reopened. Money taken for it raises a critical
    /// alert so an operator can refund it.
    async fn settle_closed_order_payment(
        &self,
        mut uow: S::Tx,
        order: &Order,
        mut payment: PaymentTransaction,
        status: CallbackStatus,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome> {
        let order_id = order.id();

        if status == CallbackStatus::Nok {
            if payment.status.is_unresolved() {
                payment.mark_failed(now)?;
                uow.update_payment(&mut payment).await?;
                uow.commit().await?;
            }
            return Ok(PaymentOutcome::Failed { order_id });
        }

        match self.verify_with_gateway(&payment).await {
            GatewayVerdict::Verified(verification) => {
                tracing::error!(
                    order_status = %order.status(),
                    "payment verified for a closed order"
                );
                self.alert(
                    Alert::critical(
                        "payment-reconciliation",
                        format!(
                            "payment {} verified for order in status {}; refund required",
                            payment.authority,
                            order.status()
                        ),
                    )
                    .for_order(order_id),
                )
                .await;

                if payment.status.is_unresolved() {
                    payment.mark_succeeded(
                        VerificationDetails {
                            reference_id: verification.reference_id,
                            card_mask: verification.card_mask,
                            fee: verification.fee,
                        },
                        now,
                    )?;
                    uow.update_payment(&mut payment).await?;
                    uow.commit().await?;
                }
                Ok(PaymentOutcome::Failed { order_id })
            }
            GatewayVerdict::NotVerified => {
                if payment.status.is_unresolved() {
                    payment.mark_failed(now)?;
                    uow.update_payment(&mut payment).await?;
                    uow.commit().await?;
                }
                Ok(PaymentOutcome::Failed { order_id })
            }
            GatewayVerdict::Unknown(reason) => {
                tracing::warn!(%reason, "verification for closed order deferred");
                Ok(PaymentOutcome::Pending { order_id })
            }
        }
    }

    /// Cancels an order on behalf of its owner and releases its stock.
    #[tracing::instrument(
        skip(self, command),
        fields(order_id = %command.order_id, user_id = %command.user_id)
    )]
    pub async fn cancel_order(&self, command: CancelOrder) -> Result<Order> {
        let now = Utc::now();
        let order_id = command.order_id;
        let actor = Actor::User(command.user_id);
        let mut uow = self.store.begin().await?;

        let mut order = uow
            .find_order(order_id)
            .await?
            .filter(|o| o.user_id() == command.user_id && !o.is_deleted())
            .ok_or(CheckoutError::OrderNotFound(order_id))?;

        if order.version() != command.expected_version {
            return Err(CheckoutError::VersionMismatch {
                order_id,
                expected: command.expected_version,
                actual: order.version(),
            });
        }

        if !order.can_fire(OrderTrigger::Cancel) {
            return Err(CheckoutError::NotCancellable {
                order_id,
                status: order.status(),
            });
        }

        let reason = command.reason.as_deref().unwrap_or("cancelled by user");

        for mut payment in uow.payments_for_order(order_id).await? {
            if payment.status.is_unresolved() {
                payment.mark_failed(now)?;
                uow.update_payment(&mut payment).await?;
            }
        }

        self.compensate(&mut uow, &mut order, OrderTrigger::Cancel, &actor, reason, now)
            .await?;
        uow.commit().await?;

        tracing::info!(%reason, "order cancelled");

        self.notify(Notification::OrderCancelled {
            order_id,
            user_id: order.user_id(),
        })
        .await;
        self.audit(AuditEvent::new(
            "order.cancelled",
            order_id,
            &actor,
            json!({ "reason": reason }),
        ))
        .await;

        Ok(order)
    }

    /// Expires an unpaid order created before `cutoff`.
    ///
    /// Returns false when the order no longer qualifies (paid, closed or
    /// too recent) so a sweeper racing a callback does nothing.
    #[tracing::instrument(skip(self))]
    pub async fn expire_order(&self, order_id: OrderId, cutoff: DateTime<Utc>) -> Result<bool> {
        let now = Utc::now();
        let actor = VerificationOrigin::Sweeper.actor();
        let mut uow = self.store.begin().await?;

        let Some(mut order) = uow.find_order(order_id).await? else {
            return Ok(false);
        };

        let expirable = order.status().awaits_payment()
            && !order.is_paid()
            && !order.is_deleted()
            && order.created_at() < cutoff
            && order.can_fire(OrderTrigger::Expire);
        if !expirable {
            tracing::debug!(status = %order.status(), "order no longer expirable");
            return Ok(false);
        }

        for mut payment in uow.payments_for_order(order_id).await? {
            if payment.status.is_unresolved() {
                payment.mark_expired(now)?;
                uow.update_payment(&mut payment).await?;
            }
        }

        self.compensate(
            &mut uow,
            &mut order,
            OrderTrigger::Expire,
            &actor,
            "payment window elapsed",
            now,
        )
        .await?;
        uow.commit().await?;

        metrics::counter!("sweeper_orders_expired_total").increment(1);
        tracing::info!("order expired");

        self.notify(Notification::OrderExpired {
            order_id,
            user_id: order.user_id(),
        })
        .await;
        self.audit(AuditEvent::new(
            "order.expired",
            order_id,
            &actor,
            json!({ "created_at": order.created_at(), "cutoff": cutoff }),
        ))
        .await;

        Ok(true)
    }

    /// Loads an order. With `user_id` set, orders of other users are reported
    /// as not found.
    #[tracing::instrument(skip(self))]
    pub async fn get_order_by_id(&self, order_id: OrderId, user_id: Option<UserId>) -> Result<Order> {
        let mut uow = self.store.begin().await?;
        uow.find_order(order_id)
            .await?
            .filter(|o| user_id.is_none_or(|user| o.user_id() == user))
            .ok_or(CheckoutError::OrderNotFound(order_id))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_orders(&self, query: &OrderQuery) -> Result<Page<Order>> {
        let mut uow = self.store.begin().await?;
        Ok(uow.query_orders(query).await?)
    }

    /// Applies a manual return, adjustment or damage write-off to a variant.
    ///
    /// Returns the ledger row written, or `None` for an unlimited variant.
    #[tracing::instrument(skip(self, correction, actor), fields(kind = correction.kind()))]
    pub async fn correct_stock(
        &self,
        variant_id: VariantId,
        correction: StockCorrection,
        actor: Actor,
    ) -> Result<Option<InventoryTransaction>> {
        let now = Utc::now();
        let mut uow = self.store.begin().await?;
        let entry = apply_correction(&mut uow, variant_id, &correction, &actor, now).await?;
        uow.commit().await?;

        metrics::counter!("stock_corrections_total", "kind" => correction.kind()).increment(1);
        tracing::info!(
            delta = entry.as_ref().map(|e| e.quantity_delta),
            "stock corrected"
        );
        Ok(entry)
    }

    /// Re-derives on-hand from the variant's ledger and records the
    /// difference to the counter as an adjustment row.
    #[tracing::instrument(skip(self, actor))]
    pub async fn reconcile_stock(
        &self,
        variant_id: VariantId,
        actor: Actor,
    ) -> Result<Option<InventoryTransaction>> {
        let now = Utc::now();
        let mut uow = self.store.begin().await?;
        let entry = reconcile_variant(&mut uow, variant_id, &actor, now).await?;
        if entry.is_none() {
            return Ok(None);
        }
        uow.commit().await?;

        metrics::counter!("stock_drift_corrected_total").increment(1);
        Ok(entry)
    }

    /// Releases the order's reservations, fires `trigger` and records the
    /// compensation in the process state, all inside `uow`.
    async fn compensate<U: UnitOfWork>(
        &self,
        uow: &mut U,
        order: &mut Order,
        trigger: OrderTrigger,
        actor: &Actor,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut process = load_process(uow, order.id()).await?;
        let track = !process.step.is_terminal();
        if track {
            process.advance(ProcessStep::Compensating, now)?;
            process.last_error = Some(reason.to_string());
        }

        if let Err(e) = release_order_reservations(uow, order, actor, now).await {
            if matches!(e, CheckoutError::CompensationFailed { .. }) {
                self.alert(Alert::critical("compensation", e.to_string()).for_order(order.id()))
                    .await;
                self.record_compensation_failure(order.id(), &e.to_string())
                    .await;
            }
            return Err(e);
        }

        order.fire(trigger, now)?;
        uow.update_order(order).await?;

        if track {
            process.advance(ProcessStep::Compensated, now)?;
            uow.save_process_state(&mut process).await?;
        }

        uow.enqueue_outbox(&OutboxMessage::for_order(order, now)?)
            .await?;
        Ok(())
    }

    /// Marks the process `Failed` in its own unit of work, since the one that
    /// failed is rolled back.
    async fn record_compensation_failure(&self, order_id: OrderId, reason: &str) {
        if let Err(e) = self.mark_process_failed(order_id, reason).await {
            tracing::warn!(%order_id, error = %e, "could not record compensation failure");
        }
    }

    async fn mark_process_failed(&self, order_id: OrderId, reason: &str) -> Result<()> {
        let now = Utc::now();
        let mut uow = self.store.begin().await?;
        let mut process = load_process(&mut uow, order_id).await?;
        if process.step.is_terminal() {
            return Ok(());
        }

        process.advance(ProcessStep::Compensating, now)?;
        process.advance(ProcessStep::Failed, now)?;
        process.record_failure(reason, now);
        uow.save_process_state(&mut process).await?;
        uow.commit().await?;
        Ok(())
    }

    async fn verify_with_gateway(&self, payment: &PaymentTransaction) -> GatewayVerdict {
        let verified = tokio::time::timeout(
            self.config.gateway_timeout,
            self.collaborators
                .payment_gateway
                .verify_payment(payment.amount, &payment.authority),
        )
        .await;

        match verified {
            Ok(Ok(verification)) if verification.verified => GatewayVerdict::Verified(verification),
            Ok(Ok(_)) | Ok(Err(GatewayError::Rejected(_))) => GatewayVerdict::NotVerified,
            Ok(Err(GatewayError::Unavailable(reason))) => GatewayVerdict::Unknown(reason),
            Err(_) => GatewayVerdict::Unknown("payment verification timed out".to_string()),
        }
    }

    async fn notify(&self, notification: Notification) {
        let kind = notification.kind();
        if let Err(e) = self.collaborators.notifications.notify(notification).await {
            tracing::warn!(kind, error = %e, "notification failed");
        }
    }

    async fn audit(&self, event: AuditEvent) {
        let action = event.action;
        if let Err(e) = self.collaborators.audit.record(event).await {
            tracing::warn!(action, error = %e, "audit record failed");
        }
    }

    pub(crate) async fn alert(&self, alert: Alert) {
        if let Err(e) = self.collaborators.alerts.raise(alert).await {
            tracing::error!(error = %e, "raising alert failed");
        }
    }
}

async fn replay<U: UnitOfWork>(
    uow: &mut U,
    order: &Order,
    user_id: UserId,
) -> Result<CheckoutReceipt> {
    if order.user_id() != user_id {
        return Err(CheckoutError::IdempotencyKeyConflict);
    }

    let Some(payment) = uow.payments_for_order(order.id()).await?.pop() else {
        return Err(CheckoutError::PaymentOutcomeUnknown {
            order_id: order.id(),
        });
    };

    tracing::info!(order_id = %order.id(), "replaying checkout");
    Ok(CheckoutReceipt {
        order_id: order.id(),
        status: order.status(),
        final_amount: order.final_amount(),
        payment_url: payment.payment_url,
        authority: payment.authority,
        replayed: true,
    })
}

async fn load_process<U: UnitOfWork>(uow: &mut U, order_id: OrderId) -> Result<OrderProcessState> {
    uow.find_process_state(order_id).await?.ok_or_else(|| {
        CheckoutError::InvariantViolation(format!("order {order_id} has no process state"))
    })
}

async fn resolve_address<U: UnitOfWork>(
    uow: &mut U,
    user_id: UserId,
    selection: &AddressSelection,
    now: DateTime<Utc>,
) -> Result<AddressId> {
    match selection {
        AddressSelection::Existing(id) => uow
            .find_address(*id)
            .await?
            .filter(|a| a.user_id == user_id)
            .map(|a| a.id)
            .ok_or(CheckoutError::AddressNotFound(*id)),
        AddressSelection::New(new) => {
            let address = new.clone().into_address(user_id, now)?;
            uow.insert_address(&address).await?;
            Ok(address.id)
        }
    }
}

/// The client's price list must name exactly the variants in the cart.
fn check_expected_prices(cart: &[CartLine], expected: &HashMap<VariantId, Money>) -> Result<()> {
    let in_cart: BTreeSet<VariantId> = cart.iter().map(|l| l.variant_id).collect();
    let quoted: BTreeSet<VariantId> = expected.keys().copied().collect();

    if in_cart == quoted {
        return Ok(());
    }

    Err(CheckoutError::ExpectedPricesMismatch {
        missing: in_cart.difference(&quoted).copied().collect(),
        unexpected: quoted.difference(&in_cart).copied().collect(),
    })
}

/// Checks each cart line against its locked variant and snapshots it.
///
/// Checked in order: unavailable, price changed, insufficient stock.
fn build_items(
    cart: &[CartLine],
    variants: &HashMap<VariantId, Variant>,
    expected: &HashMap<VariantId, Money>,
) -> Result<Vec<OrderItem>> {
    let mut items = Vec::with_capacity(cart.len());

    for line in cart {
        let variant_id = line.variant_id;
        let variant = variants
            .get(&variant_id)
            .filter(|v| v.is_sellable())
            .ok_or(CheckoutError::VariantUnavailable { variant_id })?;

        let expected_price =
            expected
                .get(&variant_id)
                .copied()
                .ok_or_else(|| CheckoutError::ExpectedPricesMismatch {
                    missing: vec![variant_id],
                    unexpected: Vec::new(),
                })?;
        if expected_price != variant.prices.selling {
            return Err(CheckoutError::PriceChanged {
                variant_id,
                expected: expected_price,
                actual: variant.prices.selling,
            });
        }

        let requested = i64::from(line.quantity);
        if !variant.can_fulfil(requested) {
            return Err(CheckoutError::InsufficientStock {
                variant_id,
                requested,
                available: variant.available(),
            });
        }

        items.push(OrderItem::from_variant(variant, line.quantity)?);
    }

    Ok(items)
}

fn reservation_error(failures: Vec<BatchFailure>) -> CheckoutError {
    let reason = describe_failures(&failures);
    match failures.into_iter().next() {
        Some(BatchFailure {
            variant_id,
            reason: BatchFailureReason::InsufficientStock {
                requested,
                available,
            },
            ..
        }) => CheckoutError::InsufficientStock {
            variant_id,
            requested,
            available,
        },
        Some(BatchFailure {
            variant_id,
            reason: BatchFailureReason::UnknownVariant,
            ..
        }) => CheckoutError::VariantUnavailable { variant_id },
        _ => CheckoutError::InvariantViolation(format!("reservation failed: {reason}")),
    }
}

fn describe_failures(failures: &[BatchFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ProductId;
    use domain::PriceSnapshot;

    fn variant(selling: i64, on_hand: i64) -> Variant {
        Variant::new(
            ProductId::new(),
            "Mug",
            "MUG-1",
            PriceSnapshot::new(Money::from_units(40), Money::from_units(selling), Money::from_units(selling)),
        )
        .with_stock(on_hand, 0)
        .unwrap()
    }

    #[test]
    fn test_expected_prices_must_match_cart() {
        let user = UserId::new();
        let in_cart = VariantId::new();
        let stray = VariantId::new();
        let cart = vec![CartLine::new(user, in_cart, 1)];

        let mut expected = HashMap::new();
        expected.insert(stray, Money::from_units(1));

        match check_expected_prices(&cart, &expected) {
            Err(CheckoutError::ExpectedPricesMismatch {
                missing,
                unexpected,
            }) => {
                assert_eq!(missing, vec![in_cart]);
                assert_eq!(unexpected, vec![stray]);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        expected.clear();
        expected.insert(in_cart, Money::from_units(1));
        assert!(check_expected_prices(&cart, &expected).is_ok());
    }

    #[test]
    fn test_price_change_reported_before_stock() {
        let user = UserId::new();
        let v = variant(100, 1);
        let cart = vec![CartLine::new(user, v.id, 3)];
        let expected = HashMap::from([(v.id, Money::from_units(90))]);
        let variants = HashMap::from([(v.id, v.clone())]);

        let err = build_items(&cart, &variants, &expected).unwrap_err();
        assert!(matches!(err, CheckoutError::PriceChanged { .. }));

        let expected = HashMap::from([(v.id, Money::from_units(100))]);
        let err = build_items(&cart, &variants, &expected).unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InsufficientStock {
                requested: 3,
                available: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_inactive_variant_is_unavailable() {
        let user = UserId::new();
        let mut v = variant(100, 5);
        v.is_active = false;
        let cart = vec![CartLine::new(user, v.id, 1)];
        let expected = HashMap::from([(v.id, Money::from_units(100))]);
        let variants = HashMap::from([(v.id, v.clone())]);

        let err = build_items(&cart, &variants, &expected).unwrap_err();
        assert!(matches!(err, CheckoutError::VariantUnavailable { variant_id } if variant_id == v.id));
    }

    #[test]
    fn test_reservation_failure_maps_to_stock_error() {
        let variant_id = VariantId::new();
        let err = reservation_error(vec![BatchFailure {
            variant_id,
            correlation_id: None,
            reason: BatchFailureReason::InsufficientStock {
                requested: 4,
                available: 2,
            },
        }]);
        assert!(matches!(
            err,
            CheckoutError::InsufficientStock {
                requested: 4,
                available: 2,
                ..
            }
        ));
    }
}
