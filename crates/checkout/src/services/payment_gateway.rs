//! Payment gateway trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common::OrderId;
use domain::Money;
use thiserror::Error;

/// A request to start a payment for an order.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_id: OrderId,
    pub amount: Money,
    pub description: String,
    pub callback_url: String,
    pub payer_contact: Option<String>,
}

/// Where to send the payer, and the token naming the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentInitiation {
    pub redirect_url: String,
    pub authority: String,
}

/// Result of asking the gateway whether a payment went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentVerification {
    pub verified: bool,
    pub reference_id: Option<String>,
    pub card_mask: Option<String>,
    pub fee: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The gateway refused the request.
    #[error("Payment gateway rejected the request: {0}")]
    Rejected(String),

    /// The gateway could not be reached or answered with a server error.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
}

/// Trait for the external payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Starts a payment and returns the redirect URL and authority.
    async fn request_payment(&self, request: PaymentRequest) -> Result<PaymentInitiation, GatewayError>;

    /// Asks whether the payment named by `authority` was completed for `amount`.
    async fn verify_payment(
        &self,
        amount: Money,
        authority: &str,
    ) -> Result<PaymentVerification, GatewayError>;
}

#[derive(Debug)]
struct InMemoryGatewayState {
    issued: HashMap<String, (OrderId, Money)>,
    next_id: u32,
    fail_on_request: bool,
    reject_requests: bool,
    fail_on_verify: bool,
    verify_succeeds: bool,
    request_delay: Option<Duration>,
    verify_delay: Option<Duration>,
    verify_calls: u32,
}

impl Default for InMemoryGatewayState {
    fn default() -> Self {
        Self {
            issued: HashMap::new(),
            next_id: 0,
            fail_on_request: false,
            reject_requests: false,
            fail_on_verify: false,
            verify_succeeds: true,
            request_delay: None,
            verify_delay: None,
            verify_calls: 0,
        }
    }
}

/// In-memory payment gateway for testing.
///
/// Payments verify successfully by default; see
/// [`set_verify_succeeds`](Self::set_verify_succeeds).
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<RwLock<InMemoryGatewayState>>,
}

impl InMemoryPaymentGateway {
    /// Creates a new in-memory payment gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `request_payment` fail as unavailable.
    pub fn set_fail_on_request(&self, fail: bool) {
        self.state.write().unwrap().fail_on_request = fail;
    }

    /// Makes `request_payment` fail as rejected.
    pub fn set_reject_requests(&self, reject: bool) {
        self.state.write().unwrap().reject_requests = reject;
    }

    /// Makes `verify_payment` fail as unavailable.
    pub fn set_fail_on_verify(&self, fail: bool) {
        self.state.write().unwrap().fail_on_verify = fail;
    }

    /// Sets whether known authorities verify as paid.
    pub fn set_verify_succeeds(&self, succeeds: bool) {
        self.state.write().unwrap().verify_succeeds = succeeds;
    }

    /// Delays every `request_payment` call.
    pub fn set_request_delay(&self, delay: Option<Duration>) {
        self.state.write().unwrap().request_delay = delay;
    }

    /// Delays every `verify_payment` call.
    pub fn set_verify_delay(&self, delay: Option<Duration>) {
        self.state.write().unwrap().verify_delay = delay;
    }

    /// Returns the number of payments started.
    pub fn request_count(&self) -> usize {
        self.state.read().unwrap().issued.len()
    }

    /// Returns the number of verification calls.
    pub fn verify_count(&self) -> u32 {
        self.state.read().unwrap().verify_calls
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn request_payment(&self, request: PaymentRequest) -> Result<PaymentInitiation, GatewayError> {
        let delay = self.state.read().unwrap().request_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().unwrap();

        if state.fail_on_request {
            return Err(GatewayError::Unavailable("connection refused".to_string()));
        }
        if state.reject_requests {
            return Err(GatewayError::Rejected("merchant not allowed".to_string()));
        }

        state.next_id += 1;
        let authority = format!("A{:09}", state.next_id);
        state
            .issued
            .insert(authority.clone(), (request.order_id, request.amount));

        Ok(PaymentInitiation {
            redirect_url: format!("https://gateway.test/pay/{authority}"),
            authority,
        })
    }

    async fn verify_payment(
        &self,
        amount: Money,
        authority: &str,
    ) -> Result<PaymentVerification, GatewayError> {
        let delay = self.state.read().unwrap().verify_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().unwrap();
        state.verify_calls += 1;

        if state.fail_on_verify {
            return Err(GatewayError::Unavailable("verification timed out".to_string()));
        }

        let verified = state.verify_succeeds
            && state
                .issued
                .get(authority)
                .is_some_and(|(_, issued)| *issued == amount);

        if !verified {
            return Ok(PaymentVerification {
                verified: false,
                reference_id: None,
                card_mask: None,
                fee: None,
            });
        }

        Ok(PaymentVerification {
            verified: true,
            reference_id: Some(format!("REF-{authority}")),
            card_mask: Some("6037-99**-****-1234".to_string()),
            fee: Some(Money::from_cents(amount.cents() / 100)),
        })
    }
}
