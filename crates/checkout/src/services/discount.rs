//! Discount evaluator trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::UserId;
use domain::Money;
use thiserror::Error;

/// A discount accepted for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountApplication {
    pub discount_id: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscountError {
    #[error("Unknown discount code: {0}")]
    UnknownCode(String),

    #[error("Discount {code} does not apply: {reason}")]
    NotApplicable { code: String, reason: String },

    #[error("Discount service unavailable: {0}")]
    Unavailable(String),
}

/// Trait for validating and applying discount codes.
#[async_trait]
pub trait DiscountEvaluator: Send + Sync {
    async fn validate_and_apply(
        &self,
        code: &str,
        order_total: Money,
        user_id: UserId,
    ) -> Result<DiscountApplication, DiscountError>;
}

/// How a discount code reduces the order total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountRule {
    /// Whole percent of the order total.
    Percent(u32),
    Fixed(Money),
}

#[derive(Debug, Default)]
struct InMemoryDiscountState {
    codes: HashMap<String, (DiscountRule, Money)>,
    fail_on_evaluate: bool,
}

/// In-memory discount evaluator for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDiscountEvaluator {
    state: Arc<RwLock<InMemoryDiscountState>>,
}

impl InMemoryDiscountEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a code usable on orders of at least `min_order_total`.
    pub fn add_code(&self, code: impl Into<String>, rule: DiscountRule, min_order_total: Money) {
        self.state
            .write()
            .unwrap()
            .codes
            .insert(code.into(), (rule, min_order_total));
    }

    pub fn set_fail_on_evaluate(&self, fail: bool) {
        self.state.write().unwrap().fail_on_evaluate = fail;
    }
}

#[async_trait]
impl DiscountEvaluator for InMemoryDiscountEvaluator {
    async fn validate_and_apply(
        &self,
        code: &str,
        order_total: Money,
        _user_id: UserId,
    ) -> Result<DiscountApplication, DiscountError> {
        let state = self.state.read().unwrap();

        if state.fail_on_evaluate {
            return Err(DiscountError::Unavailable("discount store offline".to_string()));
        }

        let (rule, min_total) = state
            .codes
            .get(code)
            .copied()
            .ok_or_else(|| DiscountError::UnknownCode(code.to_string()))?;

        if order_total < min_total {
            return Err(DiscountError::NotApplicable {
                code: code.to_string(),
                reason: format!("order total {order_total} is below {min_total}"),
            });
        }

        let amount = match rule {
            DiscountRule::Percent(percent) => {
                Money::from_cents(order_total.cents() * i64::from(percent.min(100)) / 100)
            }
            DiscountRule::Fixed(amount) => amount.min(order_total),
        };

        Ok(DiscountApplication {
            discount_id: code.to_string(),
            amount,
        })
    }
}
