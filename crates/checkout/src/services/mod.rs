//! External collaborator traits and in-memory implementations.

pub mod alert;
pub mod audit;
pub mod discount;
pub mod notification;
pub mod payment_gateway;
pub mod shipping;

use std::sync::Arc;

use thiserror::Error;

pub use alert::{Alert, AlertSeverity, AlertSink, InMemoryAlertSink, TracingAlertSink};
pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use discount::{
    DiscountApplication, DiscountError, DiscountEvaluator, DiscountRule, InMemoryDiscountEvaluator,
};
pub use notification::{
    InMemoryNotificationSink, Notification, NotificationSink, TracingNotificationSink,
};
pub use payment_gateway::{
    GatewayError, InMemoryPaymentGateway, PaymentGateway, PaymentInitiation, PaymentRequest,
    PaymentVerification,
};
pub use shipping::{InMemoryShippingEvaluator, ShippingError, ShippingEvaluator, ShippingMethod};

/// Failure of a best-effort sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Sink error: {0}")]
pub struct SinkError(pub String);

/// Everything the orchestrator talks to besides the store.
#[derive(Clone)]
pub struct Collaborators {
    pub payment_gateway: Arc<dyn PaymentGateway>,
    pub discounts: Arc<dyn DiscountEvaluator>,
    pub shipping: Arc<dyn ShippingEvaluator>,
    pub notifications: Arc<dyn NotificationSink>,
    pub audit: Arc<dyn AuditSink>,
    pub alerts: Arc<dyn AlertSink>,
}

/// In-memory collaborators with handles kept for inspection and failure
/// injection.
#[derive(Clone, Default)]
pub struct InMemoryCollaborators {
    pub payment_gateway: InMemoryPaymentGateway,
    pub discounts: InMemoryDiscountEvaluator,
    pub shipping: InMemoryShippingEvaluator,
    pub notifications: InMemoryNotificationSink,
    pub audit: InMemoryAuditSink,
    pub alerts: InMemoryAlertSink,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares the in-memory services as trait objects.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            payment_gateway: Arc::new(self.payment_gateway.clone()),
            discounts: Arc::new(self.discounts.clone()),
            shipping: Arc::new(self.shipping.clone()),
            notifications: Arc::new(self.notifications.clone()),
            audit: Arc::new(self.audit.clone()),
            alerts: Arc::new(self.alerts.clone()),
        }
    }
}
