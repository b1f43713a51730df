pub mod checkout;
pub mod ops;
pub mod orders;
pub mod payments;
pub mod stock;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use ::checkout::CheckoutOrchestrator;
use common::UserId;
use store::Store;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Shared application state accessible from all handlers.
pub struct AppState<S: Store> {
    pub orchestrator: Arc<CheckoutOrchestrator<S>>,
}

/// The caller, taken from the `X-User-Id` header.
///
/// Authentication happens in front of this service.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::BadRequest("Missing X-User-Id header".to_string()))?;
        let user_id = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ApiError::BadRequest("Invalid X-User-Id header".to_string()))?;
        Ok(CurrentUser(user_id))
    }
}

pub(crate) fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid {what}: {raw}")))
}
