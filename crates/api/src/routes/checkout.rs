//! Checkout endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use ::checkout::{AddressSelection, CheckoutFromCart, CheckoutReceipt};
use common::{ShippingMethodId, VariantId};
use domain::Money;
use serde::Deserialize;
use store::Store;

use super::{AppState, CurrentUser, IDEMPOTENCY_KEY_HEADER};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub shipping_method_id: ShippingMethodId,
    pub address: AddressSelection,
    #[serde(default)]
    pub discount_code: Option<String>,
    /// Selling price shown to the user per variant, in minor units.
    pub expected_prices: HashMap<VariantId, Money>,
    #[serde(default)]
    pub payer_contact: Option<String>,
}

/// POST /checkout: turns the caller's cart into an order awaiting payment.
///
/// Answers `201 Created` for a new order and `200 OK` when the
/// `Idempotency-Key` replays an earlier checkout.
#[tracing::instrument(skip(state, headers, req), fields(user_id = %user.0))]
pub async fn checkout<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutReceipt>), ApiError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let receipt = state
        .orchestrator
        .checkout_from_cart(CheckoutFromCart {
            user_id: user.0,
            shipping_method_id: req.shipping_method_id,
            address: req.address,
            discount_code: req.discount_code,
            expected_prices: req.expected_prices,
            idempotency_key,
            payer_contact: req.payer_contact,
        })
        .await?;

    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt)))
}
