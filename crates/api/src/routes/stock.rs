//! Stock correction endpoints for warehouse staff.

use std::sync::Arc;

use ::checkout::StockCorrection;
use axum::Json;
use axum::extract::{Path, State};
use domain::{Actor, InventoryTransaction};
use store::Store;

use super::{AppState, CurrentUser, parse_id};
use crate::error::ApiError;

/// POST /variants/{id}/stock-corrections: records a return, adjustment or
/// damage write-off. Answers with the ledger row, `null` for an unlimited
/// variant.
#[tracing::instrument(skip(state, correction))]
pub async fn correct<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(correction): Json<StockCorrection>,
) -> Result<Json<Option<InventoryTransaction>>, ApiError> {
    let variant_id = parse_id(&id, "variant id")?;
    let entry = state
        .orchestrator
        .correct_stock(variant_id, correction, Actor::User(user.0))
        .await?;
    Ok(Json(entry))
}

/// POST /variants/{id}/reconcile: repairs drift between the ledger and the
/// on-hand counter.
#[tracing::instrument(skip(state))]
pub async fn reconcile<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Option<InventoryTransaction>>, ApiError> {
    let variant_id = parse_id(&id, "variant id")?;
    let entry = state
        .orchestrator
        .reconcile_stock(variant_id, Actor::User(user.0))
        .await?;
    Ok(Json(entry))
}
