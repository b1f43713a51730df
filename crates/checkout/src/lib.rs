//! Checkout saga for order fulfillment.
//!
//! This crate turns a cart into a paid order:
//! 1. Validate the cart against live prices and stock
//! 2. Reserve inventory and create the order
//! 3. Start the gateway payment
//! 4. Confirm or release the reservations once the payment resolves
//!
//! Failed payments, cancellations and expiries all release stock through the
//! same compensation path. The [`ReconciliationSweeper`] resolves payments the
//! callback never reported and expires orders whose payment window elapsed.

pub mod commands;
pub mod compensation;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod services;
mod stock;
pub mod sweeper;

pub use commands::{
    AddressSelection, CallbackStatus, CancelOrder, CheckoutFromCart, CheckoutReceipt,
    PaymentOutcome, VerifyPayment,
};
pub use compensation::{ReleaseSummary, release_order_reservations};
pub use config::CheckoutConfig;
pub use error::{CheckoutError, ErrorKind, Result};
pub use orchestrator::CheckoutOrchestrator;
pub use services::{
    Alert, AlertSeverity, AlertSink, AuditEvent, AuditSink, Collaborators, DiscountApplication,
    DiscountError, DiscountEvaluator, DiscountRule, GatewayError, InMemoryAlertSink,
    InMemoryAuditSink, InMemoryCollaborators, InMemoryDiscountEvaluator, InMemoryNotificationSink,
    InMemoryPaymentGateway, InMemoryShippingEvaluator, Notification, NotificationSink,
    PaymentGateway, PaymentInitiation, PaymentRequest, PaymentVerification, ShippingError,
    ShippingEvaluator, ShippingMethod, SinkError, TracingAlertSink, TracingAuditSink,
    TracingNotificationSink,
};
pub use stock::StockCorrection;
pub use sweeper::{ReconciliationSweeper, SweepReport, SweeperConfig};
