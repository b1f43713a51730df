//! Domain layer for the checkout saga.
//!
//! Plain data and pure decision logic, with no I/O:
//! - Order aggregate with its table-driven state machine
//! - Inventory reservation engine and the append-only stock ledger
//! - Payment attempts and durable checkout process state
//! - Cart lines, addresses and outbox rows for the search index

pub mod cart;
pub mod error;
pub mod inventory;
pub mod money;
pub mod order;
pub mod outbox;
pub mod payment;
pub mod process;

pub use cart::{Address, AddressError, CartLine, NewAddress};
pub use error::DomainError;
pub use inventory::{
    Actor, BatchFailure, BatchFailureReason, InventoryEngine, InventoryError,
    InventoryTransaction, StockLedger, StockLine, StockOutcome, TransactionKind, Variant,
};
pub use money::{Money, PriceSnapshot};
pub use order::{
    AppliedDiscount, Guard, ItemSnapshot, NewOrder, Order, OrderError, OrderItem, OrderParts,
    OrderStateMachine, OrderStatus, OrderTrigger, TransitionRejection, TransitionRule,
};
pub use outbox::{OutboxMessage, SearchCommand};
pub use payment::{PaymentError, PaymentStatus, PaymentTransaction, VerificationDetails};
pub use process::{OrderProcessState, ProcessError, ProcessStep};
