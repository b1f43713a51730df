//! Structured audit log of order lifecycle actions.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use domain::Actor;
use serde_json::Value;

use super::SinkError;

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    /// Dotted action name, e.g. `order.created`.
    pub action: &'static str,
    pub order_id: OrderId,
    pub actor: Actor,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &'static str, order_id: OrderId, actor: &Actor, detail: Value) -> Self {
        Self {
            action,
            order_id,
            actor: actor.clone(),
            detail,
            at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError>;
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError> {
        tracing::info!(
            target: "audit",
            action = event.action,
            order_id = %event.order_id,
            actor = %event.actor,
            detail = %event.detail,
            "audit"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryAuditState {
    events: Vec<AuditEvent>,
    fail_on_record: bool,
}

/// In-memory audit sink for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditSink {
    state: Arc<RwLock<InMemoryAuditState>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_record(&self, fail: bool) {
        self.state.write().unwrap().fail_on_record = fail;
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.state.read().unwrap().events.clone()
    }

    pub fn actions_for(&self, order_id: OrderId) -> Vec<&'static str> {
        self.state
            .read()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.order_id == order_id)
            .map(|e| e.action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError> {
        let mut state = self.state.write().unwrap();
        if state.fail_on_record {
            return Err(SinkError("audit log full".to_string()));
        }
        state.events.push(event);
        Ok(())
    }
}
