//! Order aggregate, line-item snapshots and the status state machine.

mod aggregate;
mod state;
mod value_objects;

pub use aggregate::{AppliedDiscount, NewOrder, Order, OrderParts};
pub use state::{Guard, OrderStateMachine, OrderStatus, OrderTrigger, TRANSITIONS, TransitionRule};
pub use value_objects::{ItemSnapshot, OrderItem};

use thiserror::Error;

use crate::money::Money;

/// Why the state machine refused a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    /// No rule exists for the `(state, trigger)` pair.
    NoRule,
    /// A rule exists but its guard rejected the order.
    GuardRejected(Guard),
    /// The order is in a terminal state.
    TerminalState,
}

impl std::fmt::Display for TransitionRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionRejection::NoRule => write!(f, "no transition rule"),
            TransitionRejection::GuardRejected(guard) => write!(f, "guard {guard:?} rejected"),
            TransitionRejection::TerminalState => write!(f, "state is terminal"),
        }
    }
}

/// Errors that can occur during order operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderError {
    #[error("Invalid transition: cannot {trigger} from {from} ({reason})")]
    InvalidTransition {
        from: OrderStatus,
        trigger: OrderTrigger,
        reason: TransitionRejection,
    },

    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    #[error("Invalid price: {price} (must not be negative)")]
    InvalidPrice { price: Money },

    /// Selling price may never be persisted below purchase price.
    #[error("Selling price {selling} is below purchase price {purchase} for {sku}")]
    SellingBelowPurchase {
        sku: String,
        selling: Money,
        purchase: Money,
    },

    #[error("Order has no items")]
    NoItems,

    #[error("Idempotency key is required")]
    MissingIdempotencyKey,

    #[error("{field} must not be negative, got {amount}")]
    NegativeAmount { field: &'static str, amount: Money },

    #[error("Order in {status} state is not terminal")]
    NotTerminal { status: OrderStatus },

    #[error("Order is already deleted")]
    AlreadyDeleted,
}
