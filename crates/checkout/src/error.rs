//! Checkout error types.

use common::{AddressId, OrderId, ShippingMethodId, VariantId, Version};
use domain::{
    AddressError, DomainError, InventoryError, Money, OrderError, OrderStatus, PaymentError,
    ProcessError,
};
use store::StoreError;
use thiserror::Error;

use crate::services::{DiscountError, ShippingError};

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input. Nothing was persisted.
    Validation,
    NotFound,
    /// Stock, price or version moved underneath the caller. Refresh and retry.
    Conflict,
    /// Infrastructure trouble. The saga is left resumable.
    Transient,
    /// A domain invariant was broken. Indicates a defect.
    Invariant,
    /// Releasing a reservation failed.
    Compensation,
}

/// Errors that can occur during checkout operations.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Idempotency key is required")]
    MissingIdempotencyKey,

    #[error("Cart is empty")]
    EmptyCart,

    /// The caller's price list does not name exactly the cart's variants.
    #[error("Expected prices do not match the cart (missing {missing:?}, unexpected {unexpected:?})")]
    ExpectedPricesMismatch {
        missing: Vec<VariantId>,
        unexpected: Vec<VariantId>,
    },

    #[error("Address not found: {0}")]
    AddressNotFound(AddressId),

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("Invalid discount: {0}")]
    InvalidDiscount(String),

    #[error("Shipping method {0} is not available for this order")]
    ShippingUnavailable(ShippingMethodId),

    #[error("Payment rejected by gateway: {0}")]
    PaymentRejected(String),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Payment not found for authority {0}")]
    PaymentNotFound(String),

    #[error("Idempotency key already used by another user")]
    IdempotencyKeyConflict,

    #[error("Order {existing_order_id} was just placed and is still open")]
    DuplicateSubmission { existing_order_id: OrderId },

    #[error("Variant not found: {0}")]
    VariantNotFound(VariantId),

    #[error("Stock correction for variant {variant_id} rejected: {reason}")]
    StockCorrectionRejected { variant_id: VariantId, reason: String },

    #[error("Variant {variant_id} is not available")]
    VariantUnavailable { variant_id: VariantId },

    #[error("Price of variant {variant_id} changed: expected {expected}, now {actual}")]
    PriceChanged {
        variant_id: VariantId,
        expected: Money,
        actual: Money,
    },

    #[error("Insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        variant_id: VariantId,
        requested: i64,
        available: i64,
    },

    #[error("Order {order_id} cannot be cancelled in status {status}")]
    NotCancellable {
        order_id: OrderId,
        status: OrderStatus,
    },

    #[error("Order {order_id} is at version {actual}, not {expected}")]
    VersionMismatch {
        order_id: OrderId,
        expected: Version,
        actual: Version,
    },

    /// The gateway call timed out. The order is kept in `Pending` for the
    /// sweeper.
    #[error("Payment outcome unknown for order {order_id}")]
    PaymentOutcomeUnknown { order_id: OrderId },

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("{service} unavailable: {reason}")]
    DependencyUnavailable {
        service: &'static str,
        reason: String,
    },

    #[error("Compensation failed for order {order_id}: {reason}")]
    CompensationFailed { order_id: OrderId, reason: String },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CheckoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckoutError::MissingIdempotencyKey
            | CheckoutError::EmptyCart
            | CheckoutError::ExpectedPricesMismatch { .. }
            | CheckoutError::AddressNotFound(_)
            | CheckoutError::InvalidAddress(_)
            | CheckoutError::InvalidDiscount(_)
            | CheckoutError::ShippingUnavailable(_)
            | CheckoutError::PaymentRejected(_)
            | CheckoutError::StockCorrectionRejected { .. } => ErrorKind::Validation,

            CheckoutError::OrderNotFound(_)
            | CheckoutError::PaymentNotFound(_)
            | CheckoutError::VariantNotFound(_) => ErrorKind::NotFound,

            CheckoutError::IdempotencyKeyConflict
            | CheckoutError::DuplicateSubmission { .. }
            | CheckoutError::VariantUnavailable { .. }
            | CheckoutError::PriceChanged { .. }
            | CheckoutError::InsufficientStock { .. }
            | CheckoutError::NotCancellable { .. }
            | CheckoutError::VersionMismatch { .. } => ErrorKind::Conflict,

            CheckoutError::PaymentOutcomeUnknown { .. }
            | CheckoutError::GatewayUnavailable(_)
            | CheckoutError::DependencyUnavailable { .. } => ErrorKind::Transient,

            CheckoutError::CompensationFailed { .. } => ErrorKind::Compensation,

            CheckoutError::InvariantViolation(_)
            | CheckoutError::Domain(_)
            | CheckoutError::Serialization(_) => ErrorKind::Invariant,

            CheckoutError::Store(e) => match e {
                StoreError::ConcurrencyConflict { .. } | StoreError::DuplicateKey { .. } => {
                    ErrorKind::Conflict
                }
                StoreError::NotFound { .. } => ErrorKind::NotFound,
                StoreError::InvalidData(_) | StoreError::Serialization(_) => ErrorKind::Invariant,
                _ => ErrorKind::Transient,
            },
        }
    }

    /// Returns true for optimistic-concurrency failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CheckoutError::Store(e) if e.is_conflict())
    }

    /// Order the error refers to, if any.
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            CheckoutError::OrderNotFound(id)
            | CheckoutError::DuplicateSubmission {
                existing_order_id: id,
            }
            | CheckoutError::NotCancellable { order_id: id, .. }
            | CheckoutError::VersionMismatch { order_id: id, .. }
            | CheckoutError::PaymentOutcomeUnknown { order_id: id }
            | CheckoutError::CompensationFailed { order_id: id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Short label used as the `reason` metric tag.
    pub fn reason(&self) -> &'static str {
        match self {
            CheckoutError::MissingIdempotencyKey => "missing_idempotency_key",
            CheckoutError::EmptyCart => "empty_cart",
            CheckoutError::ExpectedPricesMismatch { .. } => "expected_prices_mismatch",
            CheckoutError::AddressNotFound(_) | CheckoutError::InvalidAddress(_) => "address",
            CheckoutError::InvalidDiscount(_) => "discount",
            CheckoutError::ShippingUnavailable(_) => "shipping",
            CheckoutError::PaymentRejected(_) => "payment_rejected",
            CheckoutError::OrderNotFound(_)
            | CheckoutError::PaymentNotFound(_)
            | CheckoutError::VariantNotFound(_) => "not_found",
            CheckoutError::StockCorrectionRejected { .. } => "stock_correction_rejected",
            CheckoutError::IdempotencyKeyConflict => "idempotency_conflict",
            CheckoutError::DuplicateSubmission { .. } => "duplicate_submission",
            CheckoutError::VariantUnavailable { .. } => "variant_unavailable",
            CheckoutError::PriceChanged { .. } => "price_changed",
            CheckoutError::InsufficientStock { .. } => "insufficient_stock",
            CheckoutError::NotCancellable { .. } => "not_cancellable",
            CheckoutError::VersionMismatch { .. } => "version_mismatch",
            CheckoutError::PaymentOutcomeUnknown { .. } => "payment_outcome_unknown",
            CheckoutError::GatewayUnavailable(_) => "gateway_unavailable",
            CheckoutError::DependencyUnavailable { .. } => "dependency_unavailable",
            CheckoutError::CompensationFailed { .. } => "compensation_failed",
            CheckoutError::InvariantViolation(_) | CheckoutError::Domain(_) => "invariant",
            CheckoutError::Serialization(_) => "serialization",
            CheckoutError::Store(e) if e.is_conflict() => "concurrency_conflict",
            CheckoutError::Store(_) => "store",
        }
    }
}

impl From<OrderError> for CheckoutError {
    fn from(e: OrderError) -> Self {
        CheckoutError::Domain(e.into())
    }
}

impl From<InventoryError> for CheckoutError {
    fn from(e: InventoryError) -> Self {
        CheckoutError::Domain(e.into())
    }
}

impl From<PaymentError> for CheckoutError {
    fn from(e: PaymentError) -> Self {
        CheckoutError::Domain(e.into())
    }
}

impl From<ProcessError> for CheckoutError {
    fn from(e: ProcessError) -> Self {
        CheckoutError::Domain(e.into())
    }
}

impl From<DiscountError> for CheckoutError {
    fn from(e: DiscountError) -> Self {
        match e {
            DiscountError::Unavailable(reason) => CheckoutError::DependencyUnavailable {
                service: "discount evaluator",
                reason,
            },
            other => CheckoutError::InvalidDiscount(other.to_string()),
        }
    }
}

impl From<ShippingError> for CheckoutError {
    fn from(e: ShippingError) -> Self {
        match e {
            ShippingError::UnknownMethod(id) => CheckoutError::ShippingUnavailable(id),
            ShippingError::Unavailable(reason) => CheckoutError::DependencyUnavailable {
                service: "shipping evaluator",
                reason,
            },
        }
    }
}

/// Convenience type alias for checkout results.
pub type Result<T> = std::result::Result<T, CheckoutError>;
