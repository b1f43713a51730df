use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AddressId, LedgerEntryId, OrderId, OrderItemId, OutboxMessageId, PaymentId, ProductId,
    ShippingMethodId, UserId, VariantId, Version,
};
use domain::{
    Actor, Address, CartLine, InventoryTransaction, ItemSnapshot, Money, Order, OrderItem,
    OrderParts, OrderProcessState, OrderStatus, OutboxMessage, PaymentStatus, PaymentTransaction,
    PriceSnapshot, ProcessStep, TransactionKind, Variant,
};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AddressRepository, CartRepository, OrderQuery, OrderRepository, OutboxRepository, Page,
    PaymentRepository, ProcessStateRepository, Result, StockRepository, Store, StoreError,
    UnitOfWork,
};

const ORDER_COLUMNS: &str = "id, user_id, status, subtotal, shipping_cost, discount_amount, \
     final_amount, total_profit, discount_id, shipping_method_id, address_id, idempotency_key, \
     version, is_paid, is_deleted, created_at, updated_at, payment_at, shipped_at, delivered_at, \
     cancelled_at";

const VARIANT_COLUMNS: &str = "id, product_id, product_name, sku, purchase_price, selling_price, \
     original_price, is_active, is_deleted, unlimited, low_stock_threshold, on_hand, reserved, \
     version";

const LEDGER_COLUMNS: &str = "id, variant_id, kind, quantity_delta, stock_before, \
     reserved_before, correlation_id, reference, reason, actor, created_at";

const PAYMENT_COLUMNS: &str = "id, order_id, authority, payment_url, status, amount, \
     reference_id, card_mask, fee, verify_attempts, created_at, updated_at, verified_at, version";

const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, created_at, \
     processed_at, retry_count, last_error, parked_at";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = PostgresUnitOfWork;

    async fn begin(&self) -> Result<Self::Tx> {
        let tx = self.pool.begin().await?;
        Ok(PostgresUnitOfWork { tx })
    }
}

/// One database transaction. Dropping it without committing rolls back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await.inspect_err(|e| {
            tracing::warn!(error = %e, "transaction commit failed");
        })?;
        Ok(())
    }
}

fn invalid(what: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidData(format!("unknown {what} '{value}'"))
}

fn to_u32(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("{column} out of range: {value}")))
}

/// Maps unique violations to `DuplicateKey`.
fn map_unique(entity: &'static str, key: impl ToString) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.is_unique_violation()
        {
            return StoreError::DuplicateKey {
                entity,
                key: key.to_string(),
            };
        }
        StoreError::Database(e)
    }
}

fn row_to_item(row: &PgRow) -> Result<OrderItem> {
    let snapshot = ItemSnapshot {
        variant_id: VariantId::from_uuid(row.try_get("variant_id")?),
        product_id: ProductId::from_uuid(row.try_get("product_id")?),
        product_name: row.try_get("product_name")?,
        sku: row.try_get("sku")?,
        quantity: to_u32("quantity", row.try_get("quantity")?)?,
        prices: PriceSnapshot::new(
            Money::from_cents(row.try_get("purchase_price")?),
            Money::from_cents(row.try_get("selling_price")?),
            Money::from_cents(row.try_get("original_price")?),
        ),
    };
    Ok(OrderItem::restore(
        OrderItemId::from_uuid(row.try_get("id")?),
        snapshot,
    ))
}

fn row_to_order(row: &PgRow, items: Vec<OrderItem>) -> Result<Order> {
    let status: String = row.try_get("status")?;
    let status = OrderStatus::parse(&status).ok_or_else(|| invalid("order status", &status))?;

    Ok(Order::from_parts(OrderParts {
        id: OrderId::from_uuid(row.try_get("id")?),
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        status,
        items,
        subtotal: Money::from_cents(row.try_get("subtotal")?),
        shipping_cost: Money::from_cents(row.try_get("shipping_cost")?),
        discount_amount: Money::from_cents(row.try_get("discount_amount")?),
        final_amount: Money::from_cents(row.try_get("final_amount")?),
        total_profit: Money::from_cents(row.try_get("total_profit")?),
        discount_id: row.try_get("discount_id")?,
        shipping_method_id: ShippingMethodId::from_uuid(row.try_get("shipping_method_id")?),
        address_id: AddressId::from_uuid(row.try_get("address_id")?),
        idempotency_key: row.try_get("idempotency_key")?,
        version: Version::new(row.try_get("version")?),
        is_paid: row.try_get("is_paid")?,
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        payment_at: row.try_get("payment_at")?,
        shipped_at: row.try_get("shipped_at")?,
        delivered_at: row.try_get("delivered_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
    }))
}

fn row_to_variant(row: &PgRow) -> Result<Variant> {
    let mut variant = Variant::new(
        ProductId::from_uuid(row.try_get("product_id")?),
        row.try_get::<String, _>("product_name")?,
        row.try_get::<String, _>("sku")?,
        PriceSnapshot::new(
            Money::from_cents(row.try_get("purchase_price")?),
            Money::from_cents(row.try_get("selling_price")?),
            Money::from_cents(row.try_get("original_price")?),
        ),
    )
    .with_id(VariantId::from_uuid(row.try_get("id")?))
    .with_unlimited(row.try_get("unlimited")?)
    .with_stock(row.try_get("on_hand")?, row.try_get("reserved")?)
    .map_err(|e| StoreError::InvalidData(e.to_string()))?;

    variant.is_active = row.try_get("is_active")?;
    variant.is_deleted = row.try_get("is_deleted")?;
    variant.low_stock_threshold = row.try_get("low_stock_threshold")?;
    variant.version = Version::new(row.try_get("version")?);
    Ok(variant)
}

fn row_to_ledger(row: &PgRow) -> Result<InventoryTransaction> {
    let kind: String = row.try_get("kind")?;
    let actor: String = row.try_get("actor")?;

    Ok(InventoryTransaction {
        id: LedgerEntryId::from_uuid(row.try_get("id")?),
        variant_id: VariantId::from_uuid(row.try_get("variant_id")?),
        kind: TransactionKind::parse(&kind).map_err(|e| StoreError::InvalidData(e.to_string()))?,
        quantity_delta: row.try_get("quantity_delta")?,
        stock_before: row.try_get("stock_before")?,
        reserved_before: row.try_get("reserved_before")?,
        correlation_id: row
            .try_get::<Option<Uuid>, _>("correlation_id")?
            .map(OrderItemId::from_uuid),
        reference: row.try_get("reference")?,
        reason: row.try_get("reason")?,
        actor: Actor::parse(&actor).map_err(|e| StoreError::InvalidData(e.to_string()))?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_cart_line(row: &PgRow) -> Result<CartLine> {
    Ok(CartLine::new(
        UserId::from_uuid(row.try_get("user_id")?),
        VariantId::from_uuid(row.try_get("variant_id")?),
        to_u32("quantity", row.try_get("quantity")?)?,
    ))
}

fn row_to_payment(row: &PgRow) -> Result<PaymentTransaction> {
    let status: String = row.try_get("status")?;

    Ok(PaymentTransaction {
        id: PaymentId::from_uuid(row.try_get("id")?),
        order_id: OrderId::from_uuid(row.try_get("order_id")?),
        authority: row.try_get("authority")?,
        payment_url: row.try_get("payment_url")?,
        status: PaymentStatus::parse(&status).ok_or_else(|| invalid("payment status", &status))?,
        amount: Money::from_cents(row.try_get("amount")?),
        reference_id: row.try_get("reference_id")?,
        card_mask: row.try_get("card_mask")?,
        fee: row.try_get::<Option<i64>, _>("fee")?.map(Money::from_cents),
        verify_attempts: to_u32("verify_attempts", row.try_get("verify_attempts")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        verified_at: row.try_get("verified_at")?,
        version: Version::new(row.try_get("version")?),
    })
}

fn row_to_process(row: &PgRow) -> Result<OrderProcessState> {
    let step: String = row.try_get("step")?;

    Ok(OrderProcessState {
        order_id: OrderId::from_uuid(row.try_get("order_id")?),
        step: ProcessStep::parse(&step).ok_or_else(|| invalid("process step", &step))?,
        retry_count: to_u32("retry_count", row.try_get("retry_count")?)?,
        correlation_id: row.try_get("correlation_id")?,
        last_error: row.try_get("last_error")?,
        version: Version::new(row.try_get("version")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_outbox(row: &PgRow) -> Result<OutboxMessage> {
    Ok(OutboxMessage {
        id: OutboxMessageId::from_uuid(row.try_get("id")?),
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        retry_count: to_u32("retry_count", row.try_get("retry_count")?)?,
        last_error: row.try_get("last_error")?,
        parked_at: row.try_get("parked_at")?,
    })
}

impl PostgresUnitOfWork {
    /// Loads the items of the given orders and assembles the aggregates,
    /// preserving row order.
    async fn hydrate_orders(&mut self, rows: Vec<PgRow>) -> Result<Vec<Order>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let item_rows = sqlx::query(
            r#"
            SELECT order_id, id, variant_id, product_id, product_name, sku, quantity,
                   purchase_price, selling_price, original_price
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY order_id, position
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut items: std::collections::HashMap<Uuid, Vec<OrderItem>> =
            std::collections::HashMap::new();
        for row in &item_rows {
            let order_id: Uuid = row.try_get("order_id")?;
            items.entry(order_id).or_default().push(row_to_item(row)?);
        }

        rows.iter()
            .zip(ids)
            .map(|(row, id)| row_to_order(row, items.remove(&id).unwrap_or_default()))
            .collect()
    }

    async fn first_order(&mut self, row: Option<PgRow>) -> Result<Option<Order>> {
        match row {
            Some(row) => Ok(self.hydrate_orders(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OrderRepository for PostgresUnitOfWork {
    async fn find_order(&mut self, id: OrderId) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;
        self.first_order(row).await
    }

    async fn find_order_by_idempotency_key(&mut self, key: &str) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE idempotency_key = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;
        self.first_order(row).await
    }

    async fn latest_open_order_for_user(
        &mut self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Option<Order>> {
        let terminal: Vec<&str> = OrderStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str())
            .collect();

        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE user_id = $1 AND created_at >= $2 AND status <> ALL($3) \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(user_id.as_uuid())
            .bind(since)
            .bind(terminal)
            .fetch_optional(&mut *self.tx)
            .await?;
        self.first_order(row).await
    }

    async fn insert_order(&mut self, order: &mut Order) -> Result<()> {
        let version = Version::first();

        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, status, subtotal, shipping_cost, discount_amount,
                final_amount, total_profit, discount_id, shipping_method_id, address_id,
                idempotency_key, version, is_paid, is_deleted, created_at, updated_at,
                payment_at, shipped_at, delivered_at, cancelled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21)
            "#,
        )
        .bind(order.id().as_uuid())
        .bind(order.user_id().as_uuid())
        .bind(order.status().as_str())
        .bind(order.subtotal().cents())
        .bind(order.shipping_cost().cents())
        .bind(order.discount_amount().cents())
        .bind(order.final_amount().cents())
        .bind(order.total_profit().cents())
        .bind(order.discount_id())
        .bind(order.shipping_method_id().as_uuid())
        .bind(order.address_id().as_uuid())
        .bind(order.idempotency_key())
        .bind(version.as_i64())
        .bind(order.is_paid())
        .bind(order.is_deleted())
        .bind(order.created_at())
        .bind(order.updated_at())
        .bind(order.payment_at())
        .bind(order.shipped_at())
        .bind(order.delivered_at())
        .bind(order.cancelled_at())
        .execute(&mut *self.tx)
        .await
        .map_err(map_unique("order idempotency", order.idempotency_key()))?;

        for (position, item) in order.items().iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, position, variant_id, product_id,
                    product_name, sku, quantity, purchase_price, selling_price, original_price,
                    discount, amount, profit)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(item.id().as_uuid())
            .bind(order.id().as_uuid())
            .bind(position as i32)
            .bind(item.variant_id().as_uuid())
            .bind(item.product_id().as_uuid())
            .bind(item.product_name())
            .bind(item.sku())
            .bind(i64::from(item.quantity()))
            .bind(item.purchase_price().cents())
            .bind(item.selling_price().cents())
            .bind(item.original_price().cents())
            .bind(item.discount().cents())
            .bind(item.amount().cents())
            .bind(item.profit().cents())
            .execute(&mut *self.tx)
            .await?;
        }

        order.set_version(version);
        Ok(())
    }

    async fn update_order(&mut self, order: &mut Order) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                status = $3, subtotal = $4, shipping_cost = $5, discount_amount = $6,
                final_amount = $7, total_profit = $8, discount_id = $9, is_paid = $10,
                is_deleted = $11, updated_at = $12, payment_at = $13, shipped_at = $14,
                delivered_at = $15, cancelled_at = $16, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(order.id().as_uuid())
        .bind(order.version().as_i64())
        .bind(order.status().as_str())
        .bind(order.subtotal().cents())
        .bind(order.shipping_cost().cents())
        .bind(order.discount_amount().cents())
        .bind(order.final_amount().cents())
        .bind(order.total_profit().cents())
        .bind(order.discount_id())
        .bind(order.is_paid())
        .bind(order.is_deleted())
        .bind(order.updated_at())
        .bind(order.payment_at())
        .bind(order.shipped_at())
        .bind(order.delivered_at())
        .bind(order.cancelled_at())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM orders WHERE id = $1")
                .bind(order.id().as_uuid())
                .fetch_optional(&mut *self.tx)
                .await?;
            return Err(match actual {
                Some(actual) => {
                    StoreError::conflict("order", order.id(), order.version(), Version::new(actual))
                }
                None => StoreError::not_found("order", order.id()),
            });
        }

        order.set_version(order.version().next());
        Ok(())
    }

    async fn query_orders(&mut self, query: &OrderQuery) -> Result<Page<Order>> {
        let mut filter = String::from(" WHERE 1=1");
        let mut param_count = 0;

        if query.user_id.is_some() {
            param_count += 1;
            filter.push_str(&format!(" AND user_id = ${param_count}"));
        }
        if query.status.is_some() {
            param_count += 1;
            filter.push_str(&format!(" AND status = ${param_count}"));
        }
        if query.from.is_some() {
            param_count += 1;
            filter.push_str(&format!(" AND created_at >= ${param_count}"));
        }
        if query.to.is_some() {
            param_count += 1;
            filter.push_str(&format!(" AND created_at < ${param_count}"));
        }
        if !query.include_deleted {
            filter.push_str(" AND NOT is_deleted");
        }

        let count_sql = format!("SELECT COUNT(*) FROM orders{filter}");
        let select_sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders{filter} ORDER BY created_at DESC, id DESC \
             LIMIT {} OFFSET {}",
            query.limit(),
            query.offset()
        );

        macro_rules! bind_filters {
            ($q:expr) => {{
                let mut q = $q;
                if let Some(user_id) = query.user_id {
                    q = q.bind(user_id.as_uuid());
                }
                if let Some(status) = query.status {
                    q = q.bind(status.as_str());
                }
                if let Some(from) = query.from {
                    q = q.bind(from);
                }
                if let Some(to) = query.to {
                    q = q.bind(to);
                }
                q
            }};
        }

        let total: i64 = bind_filters!(sqlx::query_scalar(&count_sql))
            .fetch_one(&mut *self.tx)
            .await?;
        let rows = bind_filters!(sqlx::query(&select_sql))
            .fetch_all(&mut *self.tx)
            .await?;
        let items = self.hydrate_orders(rows).await?;

        Ok(Page {
            items,
            page: query.page,
            page_size: query.limit(),
            total: total.max(0) as u64,
        })
    }

    async fn orders_awaiting_payment(
        &mut self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Order>> {
        let statuses: Vec<&str> = OrderStatus::ALL
            .iter()
            .filter(|s| s.awaits_payment())
            .map(|s| s.as_str())
            .collect();

        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status = ANY($1) AND NOT is_paid AND NOT is_deleted AND created_at < $2 \
             ORDER BY created_at ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(statuses)
            .bind(created_before)
            .bind(i64::from(limit))
            .fetch_all(&mut *self.tx)
            .await?;

        self.hydrate_orders(rows).await
    }
}

#[async_trait]
impl StockRepository for PostgresUnitOfWork {
    async fn lock_variants(&mut self, ids: &[VariantId]) -> Result<Vec<Variant>> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let sql = format!(
            "SELECT {VARIANT_COLUMNS} FROM variants WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter().map(row_to_variant).collect()
    }

    async fn insert_variant(&mut self, variant: &mut Variant) -> Result<()> {
        let version = Version::first();

        sqlx::query(
            r#"
            INSERT INTO variants (id, product_id, product_name, sku, purchase_price,
                selling_price, original_price, is_active, is_deleted, unlimited,
                low_stock_threshold, on_hand, reserved, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(variant.id.as_uuid())
        .bind(variant.product_id.as_uuid())
        .bind(&variant.product_name)
        .bind(&variant.sku)
        .bind(variant.prices.purchase.cents())
        .bind(variant.prices.selling.cents())
        .bind(variant.prices.original.cents())
        .bind(variant.is_active)
        .bind(variant.is_deleted)
        .bind(variant.unlimited)
        .bind(variant.low_stock_threshold)
        .bind(variant.on_hand())
        .bind(variant.reserved())
        .bind(version.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(map_unique("variant", variant.id))?;

        variant.version = version;
        Ok(())
    }

    async fn update_variant(&mut self, variant: &mut Variant) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE variants SET
                product_name = $3, sku = $4, purchase_price = $5, selling_price = $6,
                original_price = $7, is_active = $8, is_deleted = $9, unlimited = $10,
                low_stock_threshold = $11, on_hand = $12, reserved = $13,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(variant.id.as_uuid())
        .bind(variant.version.as_i64())
        .bind(&variant.product_name)
        .bind(&variant.sku)
        .bind(variant.prices.purchase.cents())
        .bind(variant.prices.selling.cents())
        .bind(variant.prices.original.cents())
        .bind(variant.is_active)
        .bind(variant.is_deleted)
        .bind(variant.unlimited)
        .bind(variant.low_stock_threshold)
        .bind(variant.on_hand())
        .bind(variant.reserved())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM variants WHERE id = $1")
                    .bind(variant.id.as_uuid())
                    .fetch_optional(&mut *self.tx)
                    .await?;
            return Err(match actual {
                Some(actual) => StoreError::conflict(
                    "variant",
                    variant.id,
                    variant.version,
                    Version::new(actual),
                ),
                None => StoreError::not_found("variant", variant.id),
            });
        }

        variant.version = variant.version.next();
        Ok(())
    }

    async fn append_ledger(&mut self, entries: &[InventoryTransaction]) -> Result<()> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO inventory_transactions (id, variant_id, kind, quantity_delta,
                    stock_before, reserved_before, correlation_id, reference, reason, actor,
                    created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(entry.id.as_uuid())
            .bind(entry.variant_id.as_uuid())
            .bind(entry.kind.as_str())
            .bind(entry.quantity_delta)
            .bind(entry.stock_before)
            .bind(entry.reserved_before)
            .bind(entry.correlation_id.map(|id| id.as_uuid()))
            .bind(&entry.reference)
            .bind(&entry.reason)
            .bind(entry.actor.to_string())
            .bind(entry.created_at)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn ledger_has_entry(
        &mut self,
        kind: TransactionKind,
        correlation_id: OrderItemId,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM inventory_transactions \
             WHERE correlation_id = $1 AND kind = $2)",
        )
        .bind(correlation_id.as_uuid())
        .bind(kind.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn ledger_for_variant(
        &mut self,
        variant_id: VariantId,
    ) -> Result<Vec<InventoryTransaction>> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM inventory_transactions WHERE variant_id = $1 ORDER BY seq"
        );
        let rows = sqlx::query(&sql)
            .bind(variant_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter().map(row_to_ledger).collect()
    }
}

#[async_trait]
impl CartRepository for PostgresUnitOfWork {
    async fn load_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>> {
        let rows = sqlx::query(
            "SELECT user_id, variant_id, quantity FROM cart_lines WHERE user_id = $1 \
             ORDER BY variant_id",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(row_to_cart_line).collect()
    }

    async fn lock_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>> {
        // Also taken for an empty cart, where FOR UPDATE locks nothing.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(user_id.as_uuid())
            .execute(&mut *self.tx)
            .await?;

        let rows = sqlx::query(
            "SELECT user_id, variant_id, quantity FROM cart_lines WHERE user_id = $1 \
             ORDER BY variant_id FOR UPDATE",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(row_to_cart_line).collect()
    }

    async fn put_cart_line(&mut self, line: CartLine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cart_lines (user_id, variant_id, quantity)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, variant_id) DO UPDATE SET quantity = EXCLUDED.quantity
            "#,
        )
        .bind(line.user_id.as_uuid())
        .bind(line.variant_id.as_uuid())
        .bind(i64::from(line.quantity))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn clear_cart(&mut self, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM cart_lines WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AddressRepository for PostgresUnitOfWork {
    async fn find_address(&mut self, id: AddressId) -> Result<Option<Address>> {
        let row = sqlx::query(
            "SELECT id, user_id, recipient, phone, line1, city, postal_code, created_at \
             FROM addresses WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|row| {
            Ok(Address {
                id: AddressId::from_uuid(row.try_get("id")?),
                user_id: UserId::from_uuid(row.try_get("user_id")?),
                recipient: row.try_get("recipient")?,
                phone: row.try_get("phone")?,
                line1: row.try_get("line1")?,
                city: row.try_get("city")?,
                postal_code: row.try_get("postal_code")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn insert_address(&mut self, address: &Address) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO addresses (id, user_id, recipient, phone, line1, city, postal_code,
                created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(address.id.as_uuid())
        .bind(address.user_id.as_uuid())
        .bind(&address.recipient)
        .bind(&address.phone)
        .bind(&address.line1)
        .bind(&address.city)
        .bind(&address.postal_code)
        .bind(address.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_unique("address", address.id))?;
        Ok(())
    }
}

#[async_trait]
impl PaymentRepository for PostgresUnitOfWork {
    async fn insert_payment(&mut self, payment: &mut PaymentTransaction) -> Result<()> {
        let version = Version::first();

        sqlx::query(
            r#"
            INSERT INTO payment_transactions (id, order_id, authority, payment_url, status,
                amount, reference_id, card_mask, fee, verify_attempts, created_at, updated_at,
                verified_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.order_id.as_uuid())
        .bind(&payment.authority)
        .bind(&payment.payment_url)
        .bind(payment.status.as_str())
        .bind(payment.amount.cents())
        .bind(&payment.reference_id)
        .bind(&payment.card_mask)
        .bind(payment.fee.map(|f| f.cents()))
        .bind(i64::from(payment.verify_attempts))
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(payment.verified_at)
        .bind(version.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(map_unique("payment authority", &payment.authority))?;

        payment.version = version;
        Ok(())
    }

    async fn update_payment(&mut self, payment: &mut PaymentTransaction) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE payment_transactions SET
                status = $3, reference_id = $4, card_mask = $5, fee = $6, verify_attempts = $7,
                updated_at = $8, verified_at = $9, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.version.as_i64())
        .bind(payment.status.as_str())
        .bind(&payment.reference_id)
        .bind(&payment.card_mask)
        .bind(payment.fee.map(|f| f.cents()))
        .bind(i64::from(payment.verify_attempts))
        .bind(payment.updated_at)
        .bind(payment.verified_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM payment_transactions WHERE id = $1")
                    .bind(payment.id.as_uuid())
                    .fetch_optional(&mut *self.tx)
                    .await?;
            return Err(match actual {
                Some(actual) => StoreError::conflict(
                    "payment",
                    payment.id,
                    payment.version,
                    Version::new(actual),
                ),
                None => StoreError::not_found("payment", payment.id),
            });
        }

        payment.version = payment.version.next();
        Ok(())
    }

    async fn find_payment_by_authority(
        &mut self,
        authority: &str,
    ) -> Result<Option<PaymentTransaction>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE authority = $1");
        let row = sqlx::query(&sql)
            .bind(authority)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(row_to_payment).transpose()
    }

    async fn payments_for_order(&mut self, order_id: OrderId) -> Result<Vec<PaymentTransaction>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE order_id = $1 \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(order_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter().map(row_to_payment).collect()
    }

    async fn unresolved_payments(
        &mut self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentTransaction>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions \
             WHERE status IN ('Pending', 'VerificationInProgress') AND created_at < $1 \
             ORDER BY created_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(older_than)
            .bind(i64::from(limit))
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter().map(row_to_payment).collect()
    }
}

#[async_trait]
impl ProcessStateRepository for PostgresUnitOfWork {
    async fn save_process_state(&mut self, state: &mut OrderProcessState) -> Result<()> {
        if state.version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO order_process_states (order_id, step, retry_count, correlation_id,
                    last_error, version, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(state.order_id.as_uuid())
            .bind(state.step.as_str())
            .bind(i64::from(state.retry_count))
            .bind(state.correlation_id)
            .bind(&state.last_error)
            .bind(Version::first().as_i64())
            .bind(state.created_at)
            .bind(state.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.is_unique_violation()
                {
                    return StoreError::conflict(
                        "process state",
                        state.order_id,
                        Version::initial(),
                        Version::first(),
                    );
                }
                StoreError::Database(e)
            })?;

            state.version = Version::first();
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE order_process_states SET
                step = $3, retry_count = $4, last_error = $5, updated_at = $6,
                version = version + 1
            WHERE order_id = $1 AND version = $2
            "#,
        )
        .bind(state.order_id.as_uuid())
        .bind(state.version.as_i64())
        .bind(state.step.as_str())
        .bind(i64::from(state.retry_count))
        .bind(&state.last_error)
        .bind(state.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM order_process_states WHERE order_id = $1",
            )
            .bind(state.order_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;
            return Err(StoreError::conflict(
                "process state",
                state.order_id,
                state.version,
                Version::new(actual.unwrap_or(0)),
            ));
        }

        state.version = state.version.next();
        Ok(())
    }

    async fn find_process_state(
        &mut self,
        order_id: OrderId,
    ) -> Result<Option<OrderProcessState>> {
        let row = sqlx::query(
            "SELECT order_id, step, retry_count, correlation_id, last_error, version, \
             created_at, updated_at FROM order_process_states WHERE order_id = $1",
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_process).transpose()
    }
}

#[async_trait]
impl OutboxRepository for PostgresUnitOfWork {
    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (id, aggregate_type, aggregate_id, event_type, payload,
                created_at, processed_at, retry_count, last_error, parked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(&message.aggregate_type)
        .bind(message.aggregate_id)
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(message.created_at)
        .bind(message.processed_at)
        .bind(i64::from(message.retry_count))
        .bind(&message.last_error)
        .bind(message.parked_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn pending_outbox(&mut self, limit: u32) -> Result<Vec<OutboxMessage>> {
        // SKIP LOCKED lets several relays share the table.
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages \
             WHERE processed_at IS NULL AND parked_at IS NULL \
             ORDER BY created_at, seq LIMIT $1 FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter().map(row_to_outbox).collect()
    }

    async fn update_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages SET
                processed_at = $2, retry_count = $3, last_error = $4, parked_at = $5
            WHERE id = $1
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.processed_at)
        .bind(i64::from(message.retry_count))
        .bind(&message.last_error)
        .bind(message.parked_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("outbox message", message.id));
        }
        Ok(())
    }
}
