//! Repository and unit-of-work traits.
//!
//! A [`UnitOfWork`] is one transaction. Every repository method runs inside
//! it and nothing becomes visible to other units until [`UnitOfWork::commit`]
//! succeeds. Dropping a unit of work without committing rolls it back.
//!
//! Writes are version-checked: `update_*` methods require the entity's
//! `version` to match the stored one, and bump it on success. A stale write
//! fails with [`StoreError::ConcurrencyConflict`](crate::StoreError).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AddressId, OrderId, OrderItemId, UserId, VariantId};
use domain::{
    Address, CartLine, InventoryTransaction, Order, OrderProcessState, OutboxMessage,
    PaymentTransaction, TransactionKind, Variant,
};

use crate::{OrderQuery, Page, Result};

#[async_trait]
pub trait OrderRepository: Send {
    async fn find_order(&mut self, id: OrderId) -> Result<Option<Order>>;

    async fn find_order_by_idempotency_key(&mut self, key: &str) -> Result<Option<Order>>;

    /// Most recent non-terminal order the user created at or after `since`.
    async fn latest_open_order_for_user(
        &mut self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Option<Order>>;

    /// Inserts a new order with its items and sets its version to `first`.
    async fn insert_order(&mut self, order: &mut Order) -> Result<()>;

    /// Version-checked update of the order row.
    async fn update_order(&mut self, order: &mut Order) -> Result<()>;

    async fn query_orders(&mut self, query: &OrderQuery) -> Result<Page<Order>>;

    /// Unpaid, undeleted orders in `Created`/`Reserved`/`Pending` created
    /// before `created_before`, oldest first.
    async fn orders_awaiting_payment(
        &mut self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Order>>;
}

#[async_trait]
pub trait StockRepository: Send {
    /// Loads the variants for update, in ascending id order. Unknown ids are
    /// skipped.
    async fn lock_variants(&mut self, ids: &[VariantId]) -> Result<Vec<Variant>>;

    async fn insert_variant(&mut self, variant: &mut Variant) -> Result<()>;

    /// Version-checked update of counters and catalog fields.
    async fn update_variant(&mut self, variant: &mut Variant) -> Result<()>;

    async fn append_ledger(&mut self, entries: &[InventoryTransaction]) -> Result<()>;

    /// Returns true if a ledger row of `kind` exists for the order item.
    async fn ledger_has_entry(
        &mut self,
        kind: TransactionKind,
        correlation_id: OrderItemId,
    ) -> Result<bool>;

    /// All ledger rows of a variant in append order.
    async fn ledger_for_variant(&mut self, variant_id: VariantId)
    -> Result<Vec<InventoryTransaction>>;
}

#[async_trait]
pub trait CartRepository: Send {
    async fn load_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>>;

    /// Loads the user's cart and holds it until the unit of work ends.
    ///
    /// A second unit locking the same cart waits for (Postgres) or conflicts
    /// with (in-memory) the first, so one cart never becomes two orders.
    async fn lock_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>>;

    /// Inserts or replaces the line for `(user_id, variant_id)`.
    async fn put_cart_line(&mut self, line: CartLine) -> Result<()>;

    async fn clear_cart(&mut self, user_id: UserId) -> Result<()>;
}

#[async_trait]
pub trait AddressRepository: Send {
    async fn find_address(&mut self, id: AddressId) -> Result<Option<Address>>;

    async fn insert_address(&mut self, address: &Address) -> Result<()>;
}

#[async_trait]
pub trait PaymentRepository: Send {
    async fn insert_payment(&mut self, payment: &mut PaymentTransaction) -> Result<()>;

    async fn update_payment(&mut self, payment: &mut PaymentTransaction) -> Result<()>;

    async fn find_payment_by_authority(
        &mut self,
        authority: &str,
    ) -> Result<Option<PaymentTransaction>>;

    /// Payments of an order, oldest first.
    async fn payments_for_order(&mut self, order_id: OrderId) -> Result<Vec<PaymentTransaction>>;

    /// `Pending`/`VerificationInProgress` payments created before
    /// `older_than`, oldest first.
    async fn unresolved_payments(
        &mut self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentTransaction>>;
}

#[async_trait]
pub trait ProcessStateRepository: Send {
    /// Inserts a state at `Version::initial()`, otherwise version-checked
    /// update.
    async fn save_process_state(&mut self, state: &mut OrderProcessState) -> Result<()>;

    async fn find_process_state(&mut self, order_id: OrderId)
    -> Result<Option<OrderProcessState>>;
}

#[async_trait]
pub trait OutboxRepository: Send {
    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<()>;

    /// Unprocessed, unparked messages in creation order.
    async fn pending_outbox(&mut self, limit: u32) -> Result<Vec<OutboxMessage>>;

    /// Persists delivery bookkeeping (processed, retry count, parked).
    async fn update_outbox(&mut self, message: &OutboxMessage) -> Result<()>;
}

/// One transaction across every repository.
#[async_trait]
pub trait UnitOfWork:
    OrderRepository
    + StockRepository
    + CartRepository
    + AddressRepository
    + PaymentRepository
    + ProcessStateRepository
    + OutboxRepository
    + Send
{
    async fn commit(self) -> Result<()>;
}

/// Factory for units of work.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Tx: UnitOfWork + 'static;

    async fn begin(&self) -> Result<Self::Tx>;
}
