use common::{ProductId, VariantId, Version};
use serde::{Deserialize, Serialize};

use super::InventoryError;
use crate::money::PriceSnapshot;

/// A sellable product variant: stock counters plus the catalog snapshot a
/// checkout needs.
///
/// Counters are private; they change only through
/// [`InventoryEngine`](super::InventoryEngine) so every change has a ledger
/// row. For limited variants `0 <= reserved <= on_hand` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub product_id: ProductId,
    pub product_name: String,
    pub sku: String,
    pub prices: PriceSnapshot,
    pub is_active: bool,
    pub is_deleted: bool,
    /// Unlimited variants never block a sale and never move their counters.
    pub unlimited: bool,
    pub low_stock_threshold: i64,
    pub version: Version,
    on_hand: i64,
    reserved: i64,
}

impl Variant {
    /// Creates an active variant with no stock.
    pub fn new(
        product_id: ProductId,
        product_name: impl Into<String>,
        sku: impl Into<String>,
        prices: PriceSnapshot,
    ) -> Self {
        Self {
            id: VariantId::new(),
            product_id,
            product_name: product_name.into(),
            sku: sku.into(),
            prices,
            is_active: true,
            is_deleted: false,
            unlimited: false,
            low_stock_threshold: 0,
            version: Version::initial(),
            on_hand: 0,
            reserved: 0,
        }
    }

    /// Sets both counters, validating `0 <= reserved <= on_hand`.
    pub fn with_stock(mut self, on_hand: i64, reserved: i64) -> Result<Self, InventoryError> {
        if on_hand < 0 || reserved < 0 || (!self.unlimited && reserved > on_hand) {
            return Err(InventoryError::InvalidStockLevels { on_hand, reserved });
        }
        self.on_hand = on_hand;
        self.reserved = reserved;
        Ok(self)
    }

    pub fn with_id(mut self, id: VariantId) -> Self {
        self.id = id;
        self
    }

    pub fn with_unlimited(mut self, unlimited: bool) -> Self {
        self.unlimited = unlimited;
        self
    }

    pub fn on_hand(&self) -> i64 {
        self.on_hand
    }

    pub fn reserved(&self) -> i64 {
        self.reserved
    }

    /// `max(0, on_hand - reserved)`.
    pub fn available(&self) -> i64 {
        (self.on_hand - self.reserved).max(0)
    }

    /// Returns true if `quantity` units can be sold right now.
    pub fn can_fulfil(&self, quantity: i64) -> bool {
        self.unlimited || self.available() >= quantity
    }

    pub fn is_low_stock(&self) -> bool {
        !self.unlimited && self.available() <= self.low_stock_threshold
    }

    /// Active and not soft-deleted.
    pub fn is_sellable(&self) -> bool {
        self.is_active && !self.is_deleted
    }

    pub(crate) fn set_counters(&mut self, on_hand: i64, reserved: i64) {
        debug_assert!(self.unlimited || (0..=on_hand).contains(&reserved));
        self.on_hand = on_hand;
        self.reserved = reserved;
    }
}
