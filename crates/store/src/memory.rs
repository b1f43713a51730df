use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AddressId, LedgerEntryId, OrderId, OrderItemId, OutboxMessageId, PaymentId, UserId,
    VariantId, Version,
};
use domain::{
    Actor, Address, CartLine, InventoryTransaction, Order, OrderProcessState, OutboxMessage,
    PaymentTransaction, StockLedger, TransactionKind, Variant,
};
use tokio::sync::RwLock;

use crate::{
    AddressRepository, CartRepository, OrderQuery, OrderRepository, OutboxRepository, Page,
    PaymentRepository, ProcessStateRepository, Result, StockRepository, Store, StoreError,
    UnitOfWork,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    orders: HashMap<OrderId, Order>,
    variants: HashMap<VariantId, Variant>,
    ledger: Vec<InventoryTransaction>,
    carts: HashMap<UserId, Vec<CartLine>>,
    cart_versions: HashMap<UserId, Version>,
    addresses: HashMap<AddressId, Address>,
    payments: HashMap<PaymentId, PaymentTransaction>,
    processes: HashMap<OrderId, OrderProcessState>,
    outbox: Vec<OutboxMessage>,
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    fail_on_begin: bool,
    fail_on_commit: bool,
    commit_count: usize,
}

/// In-memory store for tests and local runs.
///
/// Each unit of work operates on a private snapshot of every table. Commit
/// re-validates the version of every row it wrote against the shared tables,
/// so concurrent units touching the same row fail the same way a stale
/// `UPDATE ... WHERE version = $n` would.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `begin` fail with `StoreError::Unavailable`.
    pub async fn set_fail_on_begin(&self, fail: bool) {
        self.state.write().await.fail_on_begin = fail;
    }

    /// Makes `commit` fail with `StoreError::Unavailable`.
    pub async fn set_fail_on_commit(&self, fail: bool) {
        self.state.write().await.fail_on_commit = fail;
    }

    /// Number of successful commits.
    pub async fn commit_count(&self) -> usize {
        self.state.read().await.commit_count
    }

    /// Inserts a variant and records its opening stock in the ledger.
    pub async fn seed_variant(&self, mut variant: Variant) -> Result<Variant> {
        let mut uow = self.begin().await?;
        uow.insert_variant(&mut variant).await?;

        let actor = Actor::system("seed");
        let mut opening = Vec::new();
        if variant.on_hand() != 0 {
            opening.push(opening_entry(
                &variant,
                TransactionKind::Adjustment,
                variant.on_hand(),
                &actor,
            ));
        }
        if variant.reserved() != 0 {
            opening.push(opening_entry(
                &variant,
                TransactionKind::Reservation,
                variant.reserved(),
                &actor,
            ));
        }
        uow.append_ledger(&opening).await?;
        uow.commit().await?;
        Ok(variant)
    }

    pub async fn seed_cart_line(&self, user_id: UserId, variant_id: VariantId, quantity: u32) -> Result<()> {
        let mut uow = self.begin().await?;
        uow.put_cart_line(CartLine::new(user_id, variant_id, quantity))
            .await?;
        uow.commit().await
    }

    pub async fn seed_address(&self, address: Address) -> Result<Address> {
        let mut uow = self.begin().await?;
        uow.insert_address(&address).await?;
        uow.commit().await?;
        Ok(address)
    }

    pub async fn variant(&self, id: VariantId) -> Option<Variant> {
        self.state.read().await.tables.variants.get(&id).cloned()
    }

    pub async fn order(&self, id: OrderId) -> Option<Order> {
        self.state.read().await.tables.orders.get(&id).cloned()
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.tables.orders.len()
    }

    pub async fn ledger(&self, variant_id: VariantId) -> Vec<InventoryTransaction> {
        self.state
            .read()
            .await
            .tables
            .ledger
            .iter()
            .filter(|e| e.variant_id == variant_id)
            .cloned()
            .collect()
    }

    pub async fn cart(&self, user_id: UserId) -> Vec<CartLine> {
        self.state
            .read()
            .await
            .tables
            .carts
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn payments(&self, order_id: OrderId) -> Vec<PaymentTransaction> {
        let state = self.state.read().await;
        let mut payments: Vec<_> = state
            .tables
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }

    pub async fn process_state(&self, order_id: OrderId) -> Option<OrderProcessState> {
        self.state.read().await.tables.processes.get(&order_id).cloned()
    }

    pub async fn outbox(&self) -> Vec<OutboxMessage> {
        self.state.read().await.tables.outbox.clone()
    }
}

fn opening_entry(
    variant: &Variant,
    kind: TransactionKind,
    quantity_delta: i64,
    actor: &Actor,
) -> InventoryTransaction {
    InventoryTransaction {
        id: LedgerEntryId::new(),
        variant_id: variant.id,
        kind,
        quantity_delta,
        stock_before: 0,
        reserved_before: 0,
        correlation_id: None,
        reference: Some("opening".to_string()),
        reason: Some("opening stock".to_string()),
        actor: actor.clone(),
        created_at: Utc::now(),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::Tx> {
        let state = self.state.read().await;
        if state.fail_on_begin {
            return Err(StoreError::Unavailable("store is down".to_string()));
        }

        Ok(InMemoryUnitOfWork {
            state: Arc::clone(&self.state),
            working: state.tables.clone(),
            writes: WriteSet::default(),
        })
    }
}

/// Rows written by a unit of work, with the version each had when first
/// written. `Version::initial()` marks an insert.
#[derive(Debug, Default)]
struct WriteSet {
    orders: HashMap<OrderId, Version>,
    variants: HashMap<VariantId, Version>,
    payments: HashMap<PaymentId, Version>,
    processes: HashMap<OrderId, Version>,
    addresses: HashSet<AddressId>,
    /// Carts read under lock or written, with their version at snapshot time.
    carts: HashMap<UserId, Version>,
    carts_changed: HashSet<UserId>,
    ledger: Vec<InventoryTransaction>,
    outbox_new: Vec<OutboxMessageId>,
    outbox_updated: HashSet<OutboxMessageId>,
}

/// A snapshot-isolated transaction over [`InMemoryStore`].
pub struct InMemoryUnitOfWork {
    state: Arc<RwLock<State>>,
    working: Tables,
    writes: WriteSet,
}

fn check_versions<K: Hash + Eq + Display>(
    entity: &'static str,
    writes: &HashMap<K, Version>,
    current: impl Fn(&K) -> Option<Version>,
) -> Result<()> {
    for (id, base) in writes {
        let actual = current(id).unwrap_or(Version::initial());
        if actual != *base {
            tracing::debug!(entity, %id, expected = %base, %actual, "commit rejected");
            return Err(StoreError::conflict(entity, id, *base, actual));
        }
    }
    Ok(())
}

impl InMemoryUnitOfWork {
    /// Remembers the cart version this unit saw so commit can detect a
    /// concurrent change to the same cart.
    fn track_cart(&mut self, user_id: UserId) {
        let base = self
            .working
            .cart_versions
            .get(&user_id)
            .copied()
            .unwrap_or(Version::initial());
        self.writes.carts.entry(user_id).or_insert(base);
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn commit(self) -> Result<()> {
        let Self {
            state,
            mut working,
            writes,
        } = self;
        let mut state = state.write().await;

        if state.fail_on_commit {
            return Err(StoreError::Unavailable("commit failed".to_string()));
        }

        let shared = &mut state.tables;

        check_versions("order", &writes.orders, |id| {
            shared.orders.get(id).map(Order::version)
        })?;
        check_versions("variant", &writes.variants, |id| {
            shared.variants.get(id).map(|v| v.version)
        })?;
        check_versions("payment", &writes.payments, |id| {
            shared.payments.get(id).map(|p| p.version)
        })?;
        check_versions("process state", &writes.processes, |id| {
            shared.processes.get(id).map(|p| p.version)
        })?;
        check_versions("cart", &writes.carts, |id| {
            shared.cart_versions.get(id).copied()
        })?;

        for (id, base) in &writes.orders {
            let Some(order) = working.orders.get(id) else {
                continue;
            };
            if *base == Version::initial()
                && shared
                    .orders
                    .values()
                    .any(|o| o.idempotency_key() == order.idempotency_key())
            {
                return Err(StoreError::DuplicateKey {
                    entity: "order idempotency",
                    key: order.idempotency_key().to_string(),
                });
            }
        }

        for (id, base) in &writes.payments {
            let Some(payment) = working.payments.get(id) else {
                continue;
            };
            if *base == Version::initial()
                && shared
                    .payments
                    .values()
                    .any(|p| p.authority == payment.authority)
            {
                return Err(StoreError::DuplicateKey {
                    entity: "payment authority",
                    key: payment.authority.clone(),
                });
            }
        }

        for id in writes.orders.keys() {
            if let Some(order) = working.orders.remove(id) {
                shared.orders.insert(*id, order);
            }
        }
        for id in writes.variants.keys() {
            if let Some(variant) = working.variants.remove(id) {
                shared.variants.insert(*id, variant);
            }
        }
        for id in writes.payments.keys() {
            if let Some(payment) = working.payments.remove(id) {
                shared.payments.insert(*id, payment);
            }
        }
        for id in writes.processes.keys() {
            if let Some(process) = working.processes.remove(id) {
                shared.processes.insert(*id, process);
            }
        }
        for id in &writes.addresses {
            if let Some(address) = working.addresses.remove(id) {
                shared.addresses.insert(*id, address);
            }
        }
        for user_id in &writes.carts_changed {
            match working.carts.remove(user_id) {
                Some(lines) => shared.carts.insert(*user_id, lines),
                None => shared.carts.remove(user_id),
            };
            let version = shared
                .cart_versions
                .get(user_id)
                .copied()
                .unwrap_or(Version::initial());
            shared.cart_versions.insert(*user_id, version.next());
        }

        shared.ledger.extend(writes.ledger);

        for id in &writes.outbox_updated {
            let updated = working.outbox.iter().find(|m| m.id == *id);
            let existing = shared.outbox.iter_mut().find(|m| m.id == *id);
            if let (Some(updated), Some(existing)) = (updated, existing) {
                *existing = updated.clone();
            }
        }
        for id in &writes.outbox_new {
            if let Some(message) = working.outbox.iter().find(|m| m.id == *id) {
                shared.outbox.push(message.clone());
            }
        }

        state.commit_count += 1;
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for InMemoryUnitOfWork {
    async fn find_order(&mut self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.working.orders.get(&id).cloned())
    }

    async fn find_order_by_idempotency_key(&mut self, key: &str) -> Result<Option<Order>> {
        Ok(self
            .working
            .orders
            .values()
            .find(|o| o.idempotency_key() == key)
            .cloned())
    }

    async fn latest_open_order_for_user(
        &mut self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Option<Order>> {
        Ok(self
            .working
            .orders
            .values()
            .filter(|o| o.user_id() == user_id && !o.is_terminal() && o.created_at() >= since)
            .max_by_key(|o| o.created_at())
            .cloned())
    }

    async fn insert_order(&mut self, order: &mut Order) -> Result<()> {
        if self.working.orders.contains_key(&order.id()) {
            return Err(StoreError::DuplicateKey {
                entity: "order",
                key: order.id().to_string(),
            });
        }
        if self
            .working
            .orders
            .values()
            .any(|o| o.idempotency_key() == order.idempotency_key())
        {
            return Err(StoreError::DuplicateKey {
                entity: "order idempotency",
                key: order.idempotency_key().to_string(),
            });
        }

        order.set_version(Version::first());
        self.writes
            .orders
            .entry(order.id())
            .or_insert(Version::initial());
        self.working.orders.insert(order.id(), order.clone());
        Ok(())
    }

    async fn update_order(&mut self, order: &mut Order) -> Result<()> {
        let stored = self
            .working
            .orders
            .get(&order.id())
            .ok_or_else(|| StoreError::not_found("order", order.id()))?;

        if stored.version() != order.version() {
            return Err(StoreError::conflict(
                "order",
                order.id(),
                order.version(),
                stored.version(),
            ));
        }

        self.writes
            .orders
            .entry(order.id())
            .or_insert(order.version());
        order.set_version(order.version().next());
        self.working.orders.insert(order.id(), order.clone());
        Ok(())
    }

    async fn query_orders(&mut self, query: &OrderQuery) -> Result<Page<Order>> {
        let mut matches: Vec<&Order> = self
            .working
            .orders
            .values()
            .filter(|o| {
                if let Some(user_id) = query.user_id
                    && o.user_id() != user_id
                {
                    return false;
                }
                if let Some(status) = query.status
                    && o.status() != status
                {
                    return false;
                }
                if let Some(from) = query.from
                    && o.created_at() < from
                {
                    return false;
                }
                if let Some(to) = query.to
                    && o.created_at() >= to
                {
                    return false;
                }
                query.include_deleted || !o.is_deleted()
            })
            .collect();

        matches.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then(b.id().cmp(&a.id()))
        });

        let total = matches.len() as u64;
        let items = matches
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            page: query.page,
            page_size: query.limit(),
            total,
        })
    }

    async fn orders_awaiting_payment(
        &mut self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .working
            .orders
            .values()
            .filter(|o| {
                o.status().awaits_payment()
                    && !o.is_paid()
                    && !o.is_deleted()
                    && o.created_at() < created_before
            })
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at());
        orders.truncate(limit as usize);
        Ok(orders)
    }
}

#[async_trait]
impl StockRepository for InMemoryUnitOfWork {
    async fn lock_variants(&mut self, ids: &[VariantId]) -> Result<Vec<Variant>> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        Ok(ids
            .iter()
            .filter_map(|id| self.working.variants.get(id))
            .cloned()
            .collect())
    }

    async fn insert_variant(&mut self, variant: &mut Variant) -> Result<()> {
        if self.working.variants.contains_key(&variant.id) {
            return Err(StoreError::DuplicateKey {
                entity: "variant",
                key: variant.id.to_string(),
            });
        }

        variant.version = Version::first();
        self.writes
            .variants
            .entry(variant.id)
            .or_insert(Version::initial());
        self.working.variants.insert(variant.id, variant.clone());
        Ok(())
    }

    async fn update_variant(&mut self, variant: &mut Variant) -> Result<()> {
        let stored = self
            .working
            .variants
            .get(&variant.id)
            .ok_or_else(|| StoreError::not_found("variant", variant.id))?;

        if stored.version != variant.version {
            return Err(StoreError::conflict(
                "variant",
                variant.id,
                variant.version,
                stored.version,
            ));
        }

        self.writes
            .variants
            .entry(variant.id)
            .or_insert(variant.version);
        variant.version = variant.version.next();
        self.working.variants.insert(variant.id, variant.clone());
        Ok(())
    }

    async fn append_ledger(&mut self, entries: &[InventoryTransaction]) -> Result<()> {
        self.working.ledger.extend_from_slice(entries);
        self.writes.ledger.extend_from_slice(entries);
        Ok(())
    }

    async fn ledger_has_entry(
        &mut self,
        kind: TransactionKind,
        correlation_id: OrderItemId,
    ) -> Result<bool> {
        Ok(StockLedger::has_entry(
            &self.working.ledger,
            kind,
            correlation_id,
        ))
    }

    async fn ledger_for_variant(
        &mut self,
        variant_id: VariantId,
    ) -> Result<Vec<InventoryTransaction>> {
        Ok(self
            .working
            .ledger
            .iter()
            .filter(|e| e.variant_id == variant_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CartRepository for InMemoryUnitOfWork {
    async fn load_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>> {
        Ok(self
            .working
            .carts
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn lock_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>> {
        self.track_cart(user_id);
        self.load_cart(user_id).await
    }

    async fn put_cart_line(&mut self, line: CartLine) -> Result<()> {
        self.track_cart(line.user_id);
        let lines = self.working.carts.entry(line.user_id).or_default();
        match lines.iter_mut().find(|l| l.variant_id == line.variant_id) {
            Some(existing) => *existing = line,
            None => lines.push(line),
        }
        self.writes.carts_changed.insert(line.user_id);
        Ok(())
    }

    async fn clear_cart(&mut self, user_id: UserId) -> Result<()> {
        self.track_cart(user_id);
        self.working.carts.remove(&user_id);
        self.writes.carts_changed.insert(user_id);
        Ok(())
    }
}

#[async_trait]
impl AddressRepository for InMemoryUnitOfWork {
    async fn find_address(&mut self, id: AddressId) -> Result<Option<Address>> {
        Ok(self.working.addresses.get(&id).cloned())
    }

    async fn insert_address(&mut self, address: &Address) -> Result<()> {
        if self.working.addresses.contains_key(&address.id) {
            return Err(StoreError::DuplicateKey {
                entity: "address",
                key: address.id.to_string(),
            });
        }
        self.working.addresses.insert(address.id, address.clone());
        self.writes.addresses.insert(address.id);
        Ok(())
    }
}

#[async_trait]
impl PaymentRepository for InMemoryUnitOfWork {
    async fn insert_payment(&mut self, payment: &mut PaymentTransaction) -> Result<()> {
        if self
            .working
            .payments
            .values()
            .any(|p| p.authority == payment.authority)
        {
            return Err(StoreError::DuplicateKey {
                entity: "payment authority",
                key: payment.authority.clone(),
            });
        }

        payment.version = Version::first();
        self.writes
            .payments
            .entry(payment.id)
            .or_insert(Version::initial());
        self.working.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn update_payment(&mut self, payment: &mut PaymentTransaction) -> Result<()> {
        let stored = self
            .working
            .payments
            .get(&payment.id)
            .ok_or_else(|| StoreError::not_found("payment", payment.id))?;

        if stored.version != payment.version {
            return Err(StoreError::conflict(
                "payment",
                payment.id,
                payment.version,
                stored.version,
            ));
        }

        self.writes
            .payments
            .entry(payment.id)
            .or_insert(payment.version);
        payment.version = payment.version.next();
        self.working.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn find_payment_by_authority(
        &mut self,
        authority: &str,
    ) -> Result<Option<PaymentTransaction>> {
        Ok(self
            .working
            .payments
            .values()
            .find(|p| p.authority == authority)
            .cloned())
    }

    async fn payments_for_order(&mut self, order_id: OrderId) -> Result<Vec<PaymentTransaction>> {
        let mut payments: Vec<_> = self
            .working
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn unresolved_payments(
        &mut self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentTransaction>> {
        let mut payments: Vec<_> = self
            .working
            .payments
            .values()
            .filter(|p| p.status.is_unresolved() && p.created_at < older_than)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments.truncate(limit as usize);
        Ok(payments)
    }
}

#[async_trait]
impl ProcessStateRepository for InMemoryUnitOfWork {
    async fn save_process_state(&mut self, state: &mut OrderProcessState) -> Result<()> {
        let stored = self
            .working
            .processes
            .get(&state.order_id)
            .map(|s| s.version)
            .unwrap_or(Version::initial());

        if stored != state.version {
            return Err(StoreError::conflict(
                "process state",
                state.order_id,
                state.version,
                stored,
            ));
        }

        self.writes
            .processes
            .entry(state.order_id)
            .or_insert(state.version);
        state.version = state.version.next();
        self.working
            .processes
            .insert(state.order_id, state.clone());
        Ok(())
    }

    async fn find_process_state(
        &mut self,
        order_id: OrderId,
    ) -> Result<Option<OrderProcessState>> {
        Ok(self.working.processes.get(&order_id).cloned())
    }
}

#[async_trait]
impl OutboxRepository for InMemoryUnitOfWork {
    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        self.working.outbox.push(message.clone());
        self.writes.outbox_new.push(message.id);
        Ok(())
    }

    async fn pending_outbox(&mut self, limit: u32) -> Result<Vec<OutboxMessage>> {
        let mut pending: Vec<_> = self
            .working
            .outbox
            .iter()
            .filter(|m| m.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn update_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        let stored = self
            .working
            .outbox
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| StoreError::not_found("outbox message", message.id))?;
        *stored = message.clone();
        self.writes.outbox_updated.insert(message.id);
        Ok(())
    }
}
