//! Shared types for the checkout backend.

mod types;
mod version;

pub use types::{
    AddressId, LedgerEntryId, OrderId, OrderItemId, OutboxMessageId, PaymentId, ProductId,
    ShippingMethodId, UserId, VariantId,
};
pub use version::Version;
