//! Domain error types.

use thiserror::Error;

use crate::cart::AddressError;
use crate::inventory::InventoryError;
use crate::order::OrderError;
use crate::payment::PaymentError;
use crate::process::ProcessError;

/// Any error raised by the domain layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
