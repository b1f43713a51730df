//! User notifications. Delivery is best effort.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{OrderId, UserId};
use domain::Money;

use super::SinkError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    OrderCreated {
        order_id: OrderId,
        user_id: UserId,
        final_amount: Money,
    },
    PaymentSucceeded {
        order_id: OrderId,
        user_id: UserId,
    },
    PaymentFailed {
        order_id: OrderId,
        user_id: UserId,
    },
    OrderCancelled {
        order_id: OrderId,
        user_id: UserId,
    },
    OrderExpired {
        order_id: OrderId,
        user_id: UserId,
    },
}

impl Notification {
    pub fn order_id(&self) -> OrderId {
        match self {
            Notification::OrderCreated { order_id, .. }
            | Notification::PaymentSucceeded { order_id, .. }
            | Notification::PaymentFailed { order_id, .. }
            | Notification::OrderCancelled { order_id, .. }
            | Notification::OrderExpired { order_id, .. } => *order_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::OrderCreated { .. } => "order_created",
            Notification::PaymentSucceeded { .. } => "payment_succeeded",
            Notification::PaymentFailed { .. } => "payment_failed",
            Notification::OrderCancelled { .. } => "order_cancelled",
            Notification::OrderExpired { .. } => "order_expired",
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), SinkError>;
}

/// Logs notifications instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<(), SinkError> {
        tracing::info!(
            order_id = %notification.order_id(),
            kind = notification.kind(),
            "notification sent"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: Vec<Notification>,
    fail_on_notify: bool,
}

/// In-memory notification sink for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationSink {
    state: Arc<RwLock<InMemoryNotificationState>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_notify(&self, fail: bool) {
        self.state.write().unwrap().fail_on_notify = fail;
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.state.read().unwrap().sent.clone()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<(), SinkError> {
        let mut state = self.state.write().unwrap();
        if state.fail_on_notify {
            return Err(SinkError("smtp relay unreachable".to_string()));
        }
        state.sent.push(notification);
        Ok(())
    }
}
