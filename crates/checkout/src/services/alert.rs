//! Operator alerts.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::OrderId;

use super::SinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub severity: AlertSeverity,
    /// Component raising the alert.
    pub source: &'static str,
    pub message: String,
    pub order_id: Option<OrderId>,
}

impl Alert {
    pub fn critical(source: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Critical,
            source,
            message: message.into(),
            order_id: None,
        }
    }

    pub fn warning(source: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            source,
            message: message.into(),
            order_id: None,
        }
    }

    pub fn for_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert) -> Result<(), SinkError>;
}

/// Logs alerts at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: Alert) -> Result<(), SinkError> {
        tracing::error!(
            severity = ?alert.severity,
            source = alert.source,
            order_id = ?alert.order_id,
            "ALERT: {}",
            alert.message
        );
        Ok(())
    }
}

/// In-memory alert sink for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAlertSink {
    raised: Arc<RwLock<Vec<Alert>>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raised(&self) -> Vec<Alert> {
        self.raised.read().unwrap().clone()
    }

    pub fn count_from(&self, source: &str) -> usize {
        self.raised
            .read()
            .unwrap()
            .iter()
            .filter(|a| a.source == source)
            .count()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn raise(&self, alert: Alert) -> Result<(), SinkError> {
        self.raised.write().unwrap().push(alert);
        Ok(())
    }
}
