use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use ::checkout::{CallbackStatus, PaymentOutcome, VerifyPayment};
use serde::Deserialize;
use store::Store;

use super::{AppState, parse_id};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub order_id: String,
    pub authority: String,
    pub status: String,
}

/// GET /payments/callback: the gateway redirects the payer here.
#[tracing::instrument(skip(state))]
pub async fn callback<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<PaymentOutcome>, ApiError> {
    let order_id = parse_id(&params.order_id, "order_id")?;
    let status = CallbackStatus::parse(&params.status)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid status: {}", params.status)))?;

    let outcome = state
        .orchestrator
        .verify_and_process_payment(VerifyPayment {
            order_id,
            authority: params.authority,
            status,
        })
        .await?;

    Ok(Json(outcome))
}
