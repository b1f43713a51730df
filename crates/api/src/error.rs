//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::{CheckoutError, ErrorKind};

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request (headers, path or query).
    BadRequest(String),
    /// Resource not found.
    NotFound(String),
    /// Checkout operation error.
    Checkout(CheckoutError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Checkout(err) => checkout_status(err),
        }
    }
}

fn checkout_status(err: &CheckoutError) -> StatusCode {
    match err.kind() {
        ErrorKind::Validation => match err {
            CheckoutError::MissingIdempotencyKey => StatusCode::BAD_REQUEST,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        },
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Invariant | ErrorKind::Compensation => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => {
                serde_json::json!({ "error": msg })
            }
            ApiError::Checkout(err) => {
                if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
                    tracing::error!(error = %err, "internal server error");
                }
                let mut body = serde_json::json!({
                    "error": err.to_string(),
                    "code": err.reason(),
                });
                if let Some(order_id) = err.order_id() {
                    body["order_id"] = serde_json::json!(order_id);
                }
                body
            }
        };

        metrics::counter!("http_errors_total", "status" => status.as_u16().to_string())
            .increment(1);
        (status, axum::Json(body)).into_response()
    }
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::OrderNotFound(id) => {
                ApiError::NotFound(format!("Order {id} not found"))
            }
            other => ApiError::Checkout(other),
        }
    }
}
