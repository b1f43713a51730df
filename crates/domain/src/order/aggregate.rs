//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::{AddressId, OrderId, ShippingMethodId, UserId, Version};
use serde::{Deserialize, Serialize};

use super::{Guard, OrderError, OrderItem, OrderStateMachine, OrderStatus, OrderTrigger};
use crate::money::Money;

/// A discount accepted by the discount evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub discount_id: String,
    pub amount: Money,
}

/// Input for placing a new order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: OrderId,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    pub shipping_cost: Money,
    pub discount: Option<AppliedDiscount>,
    pub shipping_method_id: ShippingMethodId,
    pub address_id: AddressId,
    pub idempotency_key: String,
    pub now: DateTime<Utc>,
}

/// Every persisted field of an order, used by storage adapters to rebuild
/// the aggregate.
#[derive(Debug, Clone)]
pub struct OrderParts {
    pub id: OrderId,
    pub user_id: UserId,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub subtotal: Money,
    pub shipping_cost: Money,
    pub discount_amount: Money,
    pub final_amount: Money,
    pub total_profit: Money,
    pub discount_id: Option<String>,
    pub shipping_method_id: ShippingMethodId,
    pub address_id: AddressId,
    pub idempotency_key: String,
    pub version: Version,
    pub is_paid: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payment_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Order aggregate root.
///
/// Status only changes through [`Order::fire`], which consults the transition
/// table. Money fields always satisfy `final = subtotal + shipping - discount`
/// with every figure non-negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    status: OrderStatus,
    items: Vec<OrderItem>,
    subtotal: Money,
    shipping_cost: Money,
    discount_amount: Money,
    final_amount: Money,
    total_profit: Money,
    discount_id: Option<String>,
    shipping_method_id: ShippingMethodId,
    address_id: AddressId,
    idempotency_key: String,
    version: Version,
    is_paid: bool,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    payment_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

// Construction
impl Order {
    /// Places a new order in the `Created` state.
    ///
    /// A discount larger than the subtotal is clamped to the subtotal.
    pub fn place(new: NewOrder) -> Result<Self, OrderError> {
        if new.items.is_empty() {
            return Err(OrderError::NoItems);
        }

        if new.idempotency_key.trim().is_empty() {
            return Err(OrderError::MissingIdempotencyKey);
        }

        if new.shipping_cost.is_negative() {
            return Err(OrderError::NegativeAmount {
                field: "shipping_cost",
                amount: new.shipping_cost,
            });
        }

        let (discount_id, discount_amount) = match new.discount {
            Some(discount) if discount.amount.is_negative() => {
                return Err(OrderError::NegativeAmount {
                    field: "discount_amount",
                    amount: discount.amount,
                });
            }
            Some(discount) => (Some(discount.discount_id), discount.amount),
            None => (None, Money::zero()),
        };

        let mut order = Self {
            id: new.id,
            user_id: new.user_id,
            status: OrderStatus::Created,
            items: new.items,
            subtotal: Money::zero(),
            shipping_cost: new.shipping_cost,
            discount_amount,
            final_amount: Money::zero(),
            total_profit: Money::zero(),
            discount_id,
            shipping_method_id: new.shipping_method_id,
            address_id: new.address_id,
            idempotency_key: new.idempotency_key,
            version: Version::initial(),
            is_paid: false,
            is_deleted: false,
            created_at: new.now,
            updated_at: new.now,
            payment_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
        };
        order.recalculate_totals();

        Ok(order)
    }

    /// Rebuilds a persisted order.
    pub fn from_parts(parts: OrderParts) -> Self {
        Self {
            id: parts.id,
            user_id: parts.user_id,
            status: parts.status,
            items: parts.items,
            subtotal: parts.subtotal,
            shipping_cost: parts.shipping_cost,
            discount_amount: parts.discount_amount,
            final_amount: parts.final_amount,
            total_profit: parts.total_profit,
            discount_id: parts.discount_id,
            shipping_method_id: parts.shipping_method_id,
            address_id: parts.address_id,
            idempotency_key: parts.idempotency_key,
            version: parts.version,
            is_paid: parts.is_paid,
            is_deleted: parts.is_deleted,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
            payment_at: parts.payment_at,
            shipped_at: parts.shipped_at,
            delivered_at: parts.delivered_at,
            cancelled_at: parts.cancelled_at,
        }
    }
}

// Query methods
impl Order {
    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn subtotal(&self) -> Money {
        self.subtotal
    }

    pub fn shipping_cost(&self) -> Money {
        self.shipping_cost
    }

    pub fn discount_amount(&self) -> Money {
        self.discount_amount
    }

    pub fn final_amount(&self) -> Money {
        self.final_amount
    }

    pub fn total_profit(&self) -> Money {
        self.total_profit
    }

    pub fn discount_id(&self) -> Option<&str> {
        self.discount_id.as_deref()
    }

    pub fn shipping_method_id(&self) -> ShippingMethodId {
        self.shipping_method_id
    }

    pub fn address_id(&self) -> AddressId {
        self.address_id
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_paid(&self) -> bool {
        self.is_paid
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn payment_at(&self) -> Option<DateTime<Utc>> {
        self.payment_at
    }

    pub fn shipped_at(&self) -> Option<DateTime<Utc>> {
        self.shipped_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    /// Returns true if the order is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if `Cancel` would currently be accepted.
    pub fn can_cancel(&self) -> bool {
        Guard::CanCancel.allows(self)
            && OrderStateMachine::can_transition(self.status, OrderTrigger::Cancel, self)
    }

    /// Returns true if `trigger` would currently be accepted.
    pub fn can_fire(&self, trigger: OrderTrigger) -> bool {
        OrderStateMachine::can_transition(self.status, trigger, self)
    }

    /// Triggers that would currently be accepted.
    pub fn permitted_triggers(&self) -> Vec<OrderTrigger> {
        OrderStateMachine::permitted_triggers(self.status, self)
    }
}

// Mutations
impl Order {
    /// Fires a trigger through the state machine.
    ///
    /// Returns the new status. Confirming payment sets the paid flag; shipping,
    /// delivery and cancellation stamp their timestamps.
    pub fn fire(&mut self, trigger: OrderTrigger, now: DateTime<Utc>) -> Result<OrderStatus, OrderError> {
        let next = OrderStateMachine::transition(self.status, trigger, self)?;

        match trigger {
            OrderTrigger::ConfirmPayment => {
                self.is_paid = true;
                self.payment_at = Some(now);
            }
            OrderTrigger::Ship => self.shipped_at = Some(now),
            OrderTrigger::Deliver => self.delivered_at = Some(now),
            OrderTrigger::Cancel => self.cancelled_at = Some(now),
            _ => {}
        }

        tracing::debug!(
            order_id = %self.id,
            from = %self.status,
            to = %next,
            trigger = %trigger,
            "Order transition"
        );

        self.status = next;
        self.updated_at = now;
        Ok(next)
    }

    /// Recomputes subtotal, profit and final amount from the items.
    pub fn recalculate_totals(&mut self) {
        self.subtotal = self.items.iter().map(OrderItem::amount).sum();
        self.total_profit = self.items.iter().map(OrderItem::profit).sum();
        self.discount_amount = self.discount_amount.min(self.subtotal).clamp_non_negative();
        self.final_amount = self.subtotal + self.shipping_cost - self.discount_amount;
    }

    /// Sets the concurrency token after a successful write.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Soft-deletes a terminal order. Orders are never physically removed.
    pub fn soft_delete(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        if self.is_deleted {
            return Err(OrderError::AlreadyDeleted);
        }

        if !self.is_terminal() {
            return Err(OrderError::NotTerminal {
                status: self.status,
            });
        }

        self.is_deleted = true;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::tests_support::{sample_item, sample_order};
    use crate::order::TransitionRejection;

    fn new_order(items: Vec<OrderItem>, shipping: i64, discount: Option<i64>) -> NewOrder {
        NewOrder {
            id: OrderId::new(),
            user_id: UserId::new(),
            items,
            shipping_cost: Money::from_cents(shipping),
            discount: discount.map(|cents| AppliedDiscount {
                discount_id: "SAVE".to_string(),
                amount: Money::from_cents(cents),
            }),
            shipping_method_id: ShippingMethodId::new(),
            address_id: AddressId::new(),
            idempotency_key: "key".to_string(),
            now: Utc::now(),
        }
    }

    fn assert_money_invariant(order: &Order) {
        let items_total: Money = order.items().iter().map(OrderItem::amount).sum();
        assert_eq!(items_total, order.subtotal());
        assert_eq!(
            order.final_amount(),
            order.subtotal() + order.shipping_cost() - order.discount_amount()
        );
        assert!(!order.final_amount().is_negative());
    }

    #[test]
    fn test_place_computes_totals() {
        let order = Order::place(new_order(
            vec![sample_item(2, 100), sample_item(1, 300)],
            50,
            Some(100),
        ))
        .unwrap();

        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(order.subtotal().cents(), 500);
        assert_eq!(order.total_profit().cents(), 250);
        assert_eq!(order.final_amount().cents(), 450);
        assert_eq!(order.discount_id(), Some("SAVE"));
        assert_eq!(order.version(), Version::initial());
        assert_money_invariant(&order);
    }

    #[test]
    fn test_place_clamps_discount_to_subtotal() {
        let order = Order::place(new_order(vec![sample_item(1, 100)], 30, Some(1_000))).unwrap();

        assert_eq!(order.discount_amount().cents(), 100);
        assert_eq!(order.final_amount().cents(), 30);
        assert_money_invariant(&order);
    }

    #[test]
    fn test_place_rejects_empty_order() {
        assert_eq!(
            Order::place(new_order(vec![], 0, None)).unwrap_err(),
            OrderError::NoItems
        );
    }

    #[test]
    fn test_place_requires_idempotency_key() {
        let mut input = new_order(vec![sample_item(1, 100)], 0, None);
        input.idempotency_key = "  ".to_string();
        assert_eq!(
            Order::place(input).unwrap_err(),
            OrderError::MissingIdempotencyKey
        );
    }

    #[test]
    fn test_place_rejects_negative_shipping() {
        let err = Order::place(new_order(vec![sample_item(1, 100)], -1, None)).unwrap_err();
        assert!(matches!(err, OrderError::NegativeAmount { field: "shipping_cost", .. }));
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut order = sample_order();
        let now = Utc::now();

        for trigger in [
            OrderTrigger::Reserve,
            OrderTrigger::AwaitPayment,
            OrderTrigger::ConfirmPayment,
            OrderTrigger::StartProcessing,
            OrderTrigger::Ship,
            OrderTrigger::Deliver,
        ] {
            order.fire(trigger, now).unwrap();
        }

        assert_eq!(order.status(), OrderStatus::Delivered);
        assert!(order.is_paid());
        assert_eq!(order.payment_at(), Some(now));
        assert_eq!(order.shipped_at(), Some(now));
        assert_eq!(order.delivered_at(), Some(now));
        assert!(order.is_terminal());
    }

    #[test]
    fn test_delivered_cannot_return_to_pending() {
        let mut order = sample_order();
        let now = Utc::now();
        for trigger in [
            OrderTrigger::Reserve,
            OrderTrigger::AwaitPayment,
            OrderTrigger::ConfirmPayment,
            OrderTrigger::StartProcessing,
            OrderTrigger::Ship,
            OrderTrigger::Deliver,
        ] {
            order.fire(trigger, now).unwrap();
        }

        for trigger in [OrderTrigger::AwaitPayment, OrderTrigger::Return, OrderTrigger::Cancel] {
            let err = order.fire(trigger, now).unwrap_err();
            assert!(matches!(
                err,
                OrderError::InvalidTransition {
                    reason: TransitionRejection::TerminalState,
                    ..
                }
            ));
        }
        assert_eq!(order.status(), OrderStatus::Delivered);
    }

    #[test]
    fn test_cancel_stamps_timestamp() {
        let mut order = sample_order();
        let now = Utc::now();
        order.fire(OrderTrigger::Reserve, now).unwrap();
        assert!(order.can_cancel());

        order.fire(OrderTrigger::Cancel, now).unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(order.cancelled_at(), Some(now));
        assert!(!order.can_cancel());
    }

    #[test]
    fn test_paid_order_cannot_be_cancelled() {
        let mut order = sample_order();
        let now = Utc::now();
        order.fire(OrderTrigger::Reserve, now).unwrap();
        order.fire(OrderTrigger::AwaitPayment, now).unwrap();
        order.fire(OrderTrigger::ConfirmPayment, now).unwrap();

        assert!(!order.can_cancel());
        assert!(order.fire(OrderTrigger::Cancel, now).is_err());
        assert!(order.can_fire(OrderTrigger::Refund));
    }

    #[test]
    fn test_failed_payment_then_cancel() {
        let mut order = sample_order();
        let now = Utc::now();
        order.fire(OrderTrigger::Reserve, now).unwrap();
        order.fire(OrderTrigger::AwaitPayment, now).unwrap();
        order.fire(OrderTrigger::FailPayment, now).unwrap();
        assert_eq!(order.status(), OrderStatus::Failed);

        order.fire(OrderTrigger::Cancel, now).unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
    }

    #[test]
    fn test_rejected_fire_leaves_order_unchanged() {
        let mut order = sample_order();
        let before = order.clone();

        assert!(order.fire(OrderTrigger::Ship, Utc::now()).is_err());
        assert_eq!(order, before);
    }

    #[test]
    fn test_soft_delete_requires_terminal_state() {
        let mut order = sample_order();
        let now = Utc::now();
        assert!(matches!(
            order.soft_delete(now),
            Err(OrderError::NotTerminal { .. })
        ));

        order.fire(OrderTrigger::Expire, now).unwrap();
        order.soft_delete(now).unwrap();
        assert!(order.is_deleted());
        assert_eq!(order.soft_delete(now), Err(OrderError::AlreadyDeleted));
    }

    #[test]
    fn test_from_parts_round_trip() {
        let order = sample_order();
        let parts = OrderParts {
            id: order.id(),
            user_id: order.user_id(),
            status: order.status(),
            items: order.items().to_vec(),
            subtotal: order.subtotal(),
            shipping_cost: order.shipping_cost(),
            discount_amount: order.discount_amount(),
            final_amount: order.final_amount(),
            total_profit: order.total_profit(),
            discount_id: None,
            shipping_method_id: order.shipping_method_id(),
            address_id: order.address_id(),
            idempotency_key: order.idempotency_key().to_string(),
            version: Version::new(4),
            is_paid: false,
            is_deleted: false,
            created_at: order.created_at(),
            updated_at: order.updated_at(),
            payment_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
        };

        let rebuilt = Order::from_parts(parts);
        assert_eq!(rebuilt.version(), Version::new(4));
        assert_eq!(rebuilt.items(), order.items());
    }
}
