//! Transactional outbox rows destined for the search index.

use chrono::{DateTime, Utc};
use common::OutboxMessageId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inventory::Variant;
use crate::order::Order;

pub const PRODUCTS_INDEX: &str = "products";
pub const ORDERS_INDEX: &str = "orders";

/// Instruction for the search index, stored as the outbox payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SearchCommand {
    IndexDocument {
        index: String,
        document_id: String,
        document: serde_json::Value,
    },
    DeleteDocument {
        index: String,
        document_id: String,
    },
}

impl SearchCommand {
    /// Availability document for a variant. Soft-deleted variants are removed.
    pub fn for_variant(variant: &Variant) -> Self {
        let document_id = variant.id.to_string();
        if variant.is_deleted {
            return SearchCommand::DeleteDocument {
                index: PRODUCTS_INDEX.to_string(),
                document_id,
            };
        }

        SearchCommand::IndexDocument {
            index: PRODUCTS_INDEX.to_string(),
            document_id,
            document: serde_json::json!({
                "variant_id": variant.id,
                "product_id": variant.product_id,
                "product_name": variant.product_name,
                "sku": variant.sku,
                "selling_price": variant.prices.selling,
                "available": variant.available(),
                "unlimited": variant.unlimited,
                "in_stock": variant.unlimited || variant.available() > 0,
                "is_active": variant.is_active,
            }),
        }
    }

    /// Status document for an order.
    pub fn for_order(order: &Order) -> Self {
        SearchCommand::IndexDocument {
            index: ORDERS_INDEX.to_string(),
            document_id: order.id().to_string(),
            document: serde_json::json!({
                "order_id": order.id(),
                "user_id": order.user_id(),
                "status": order.status(),
                "final_amount": order.final_amount(),
                "is_paid": order.is_paid(),
                "item_count": order.items().len(),
                "updated_at": order.updated_at(),
            }),
        }
    }

    pub fn index(&self) -> &str {
        match self {
            SearchCommand::IndexDocument { index, .. } | SearchCommand::DeleteDocument { index, .. } => index,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            SearchCommand::IndexDocument { document_id, .. }
            | SearchCommand::DeleteDocument { document_id, .. } => document_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            SearchCommand::IndexDocument { .. } => "IndexDocument",
            SearchCommand::DeleteDocument { .. } => "DeleteDocument",
        }
    }
}

/// One outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: OutboxMessageId,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub parked_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        command: &SearchCommand,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: OutboxMessageId::new(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: command.event_type().to_string(),
            payload: serde_json::to_value(command)?,
            created_at: now,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            parked_at: None,
        })
    }

    pub fn for_variant(variant: &Variant, now: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Self::new("Variant", variant.id.as_uuid(), &SearchCommand::for_variant(variant), now)
    }

    pub fn for_order(order: &Order, now: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Self::new("Order", order.id().as_uuid(), &SearchCommand::for_order(order), now)
    }

    /// Decodes the payload.
    pub fn command(&self) -> Result<SearchCommand, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Returns true while the relay should still pick the row up.
    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none() && self.parked_at.is_none()
    }

    pub fn mark_processed(&mut self, now: DateTime<Utc>) {
        self.processed_at = Some(now);
    }

    /// Records a failed delivery. Returns true if the row is now parked.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> bool {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        if self.retry_count >= max_retries {
            self.parked_at = Some(now);
        }
        self.parked_at.is_some()
    }
}
