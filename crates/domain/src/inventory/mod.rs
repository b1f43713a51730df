//! Per-variant stock counters, the append-only stock ledger and the stateless
//! reservation engine that decides every stock mutation.

mod engine;
mod ledger;
mod variant;

pub use engine::{BatchFailure, BatchFailureReason, InventoryEngine, StockLine, StockOutcome};
pub use ledger::{Actor, InventoryTransaction, StockLedger, TransactionKind};
pub use variant::Variant;

use common::VariantId;
use thiserror::Error;

/// Errors raised by stock bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    /// Counters violate `0 <= reserved <= on_hand`.
    #[error("Invalid stock levels: on_hand={on_hand}, reserved={reserved}")]
    InvalidStockLevels { on_hand: i64, reserved: i64 },

    #[error("Insufficient stock for {variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        variant_id: VariantId,
        requested: i64,
        available: i64,
    },

    #[error("Stock operation on {variant_id} failed: {reason}")]
    OperationFailed { variant_id: VariantId, reason: String },

    #[error("Unknown variant: {0}")]
    UnknownVariant(VariantId),

    #[error("Unknown ledger value: {0}")]
    UnknownLedgerValue(String),
}
