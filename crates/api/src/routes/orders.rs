//! Order lookup and cancellation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use ::checkout::CancelOrder;
use chrono::{DateTime, Utc};
use common::{OrderId, UserId, Version};
use domain::{Money, Order, OrderItem, OrderStatus};
use serde::{Deserialize, Serialize};
use store::{OrderQuery, Page, Store};

use super::{AppState, CurrentUser, parse_id};
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// Version of the order the caller last saw.
    pub expected_version: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub status: Option<OrderStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: OrderId,
    pub user_id: UserId,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub subtotal: Money,
    pub shipping_cost: Money,
    pub discount_amount: Money,
    pub final_amount: Money,
    pub is_paid: bool,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id(),
            user_id: order.user_id(),
            status: order.status(),
            items: order.items().to_vec(),
            subtotal: order.subtotal(),
            shipping_cost: order.shipping_cost(),
            discount_amount: order.discount_amount(),
            final_amount: order.final_amount(),
            is_paid: order.is_paid(),
            version: order.version(),
            created_at: order.created_at(),
            updated_at: order.updated_at(),
        }
    }
}

// -- Handlers --

/// GET /orders/{id}: one of the caller's orders.
#[tracing::instrument(skip(state))]
pub async fn get<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_id(&id, "order id")?;
    let order = state
        .orchestrator
        .get_order_by_id(order_id, Some(user.0))
        .await?;
    Ok(Json(OrderResponse::from(&order)))
}

/// GET /orders: the caller's orders, newest first.
#[tracing::instrument(skip(state))]
pub async fn list<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    user: CurrentUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Page<OrderResponse>>, ApiError> {
    let mut query = OrderQuery::for_user(user.0);
    query.status = params.status;
    query.from = params.from;
    query.to = params.to;
    let query = query.page(
        params.page.unwrap_or(1),
        params.page_size.unwrap_or(store::query::DEFAULT_PAGE_SIZE),
    );

    let page = state.orchestrator.get_orders(&query).await?;
    Ok(Json(page.map(|order| OrderResponse::from(&order))))
}

/// POST /orders/{id}/cancel: cancels an unpaid order and releases its stock.
#[tracing::instrument(skip(state, req))]
pub async fn cancel<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_id(&id, "order id")?;
    let order = state
        .orchestrator
        .cancel_order(CancelOrder {
            order_id,
            user_id: user.0,
            expected_version: Version::new(req.expected_version),
            reason: req.reason,
        })
        .await?;
    Ok(Json(OrderResponse::from(&order)))
}
