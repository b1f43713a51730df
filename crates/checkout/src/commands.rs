//! Inputs and results of the checkout operations.

use std::collections::HashMap;

use common::{AddressId, OrderId, ShippingMethodId, UserId, VariantId, Version};
use domain::{Money, NewAddress, OrderStatus};
use serde::{Deserialize, Serialize};

/// Delivery address for a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSelection {
    /// A saved address of the user.
    Existing(AddressId),
    /// An inline address. It is saved with the order.
    New(NewAddress),
}

/// Places an order from the user's cart.
#[derive(Debug, Clone)]
pub struct CheckoutFromCart {
    pub user_id: UserId,
    pub shipping_method_id: ShippingMethodId,
    pub address: AddressSelection,
    pub discount_code: Option<String>,
    /// Selling price the client displayed for every cart variant.
    pub expected_prices: HashMap<VariantId, Money>,
    pub idempotency_key: String,
    pub payer_contact: Option<String>,
}

/// What a successful checkout returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutReceipt {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub final_amount: Money,
    pub payment_url: String,
    pub authority: String,
    /// True when an earlier checkout with the same key was returned.
    pub replayed: bool,
}

/// Payer-side result reported by the gateway callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOK")]
    Nok,
}

impl CallbackStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OK" => Some(CallbackStatus::Ok),
            "NOK" => Some(CallbackStatus::Nok),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyPayment {
    pub order_id: OrderId,
    pub authority: String,
    pub status: CallbackStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Payment verified; reservations confirmed and the order is paid.
    Verified {
        order_id: OrderId,
        reference_id: Option<String>,
    },
    /// The order was paid before this call.
    AlreadyPaid { order_id: OrderId },
    /// Payment failed; reservations released.
    Failed { order_id: OrderId },
    /// Verification could not complete. Retried by the sweeper.
    Pending { order_id: OrderId },
}

impl PaymentOutcome {
    pub fn order_id(&self) -> OrderId {
        match self {
            PaymentOutcome::Verified { order_id, .. }
            | PaymentOutcome::AlreadyPaid { order_id }
            | PaymentOutcome::Failed { order_id }
            | PaymentOutcome::Pending { order_id } => *order_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    /// Version the caller last saw.
    pub expected_version: Version,
    pub reason: Option<String>,
}
