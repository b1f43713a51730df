//! Order line items.

use common::{OrderItemId, ProductId, VariantId};
use serde::{Deserialize, Serialize};

use super::OrderError;
use crate::inventory::Variant;
use crate::money::{Money, PriceSnapshot};

/// The catalog facts an order line copies at checkout time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSnapshot {
    pub variant_id: VariantId,
    pub product_id: ProductId,
    pub product_name: String,
    pub sku: String,
    pub quantity: u32,
    pub prices: PriceSnapshot,
}

/// An immutable price snapshot of one order line.
///
/// Product name and SKU are copied so later catalog edits leave historical
/// orders untouched. The derived figures are always computed from the
/// snapshot:
///
/// * `amount = selling * quantity`
/// * `profit = (selling - purchase) * quantity`
/// * `discount = max(0, original - selling) * quantity`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    id: OrderItemId,
    variant_id: VariantId,
    product_id: ProductId,
    product_name: String,
    sku: String,
    quantity: u32,
    purchase_price: Money,
    selling_price: Money,
    original_price: Money,
    discount: Money,
    amount: Money,
    profit: Money,
}

impl OrderItem {
    /// Takes a validated snapshot under a fresh line id.
    pub fn snapshot(snapshot: ItemSnapshot) -> Result<Self, OrderError> {
        if snapshot.quantity == 0 {
            return Err(OrderError::InvalidQuantity { quantity: 0 });
        }

        let prices = snapshot.prices;
        for price in [prices.purchase, prices.selling, prices.original] {
            if price.is_negative() {
                return Err(OrderError::InvalidPrice { price });
            }
        }

        if prices.selling < prices.purchase {
            return Err(OrderError::SellingBelowPurchase {
                sku: snapshot.sku,
                selling: prices.selling,
                purchase: prices.purchase,
            });
        }

        Ok(Self::restore(OrderItemId::new(), snapshot))
    }

    /// Snapshots a live variant.
    pub fn from_variant(variant: &Variant, quantity: u32) -> Result<Self, OrderError> {
        Self::snapshot(ItemSnapshot {
            variant_id: variant.id,
            product_id: variant.product_id,
            product_name: variant.product_name.clone(),
            sku: variant.sku.clone(),
            quantity,
            prices: variant.prices,
        })
    }

    /// Rebuilds a persisted line. Derived figures are recomputed.
    pub fn restore(id: OrderItemId, snapshot: ItemSnapshot) -> Self {
        let ItemSnapshot {
            variant_id,
            product_id,
            product_name,
            sku,
            quantity,
            prices,
        } = snapshot;

        Self {
            id,
            variant_id,
            product_id,
            product_name,
            sku,
            quantity,
            purchase_price: prices.purchase,
            selling_price: prices.selling,
            original_price: prices.original,
            discount: (prices.original - prices.selling)
                .clamp_non_negative()
                .multiply(quantity),
            amount: prices.selling.multiply(quantity),
            profit: (prices.selling - prices.purchase).multiply(quantity),
        }
    }

    pub fn id(&self) -> OrderItemId {
        self.id
    }

    pub fn variant_id(&self) -> VariantId {
        self.variant_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn prices(&self) -> PriceSnapshot {
        PriceSnapshot::new(self.purchase_price, self.selling_price, self.original_price)
    }

    pub fn purchase_price(&self) -> Money {
        self.purchase_price
    }

    pub fn selling_price(&self) -> Money {
        self.selling_price
    }

    pub fn original_price(&self) -> Money {
        self.original_price
    }

    /// Markdown from the original price, over the whole line.
    pub fn discount(&self) -> Money {
        self.discount
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn profit(&self) -> Money {
        self.profit
    }
}
