//! Shipping evaluator trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::ShippingMethodId;
use domain::{CartLine, Money};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShippingError {
    #[error("Unknown shipping method: {0}")]
    UnknownMethod(ShippingMethodId),

    #[error("Shipping service unavailable: {0}")]
    Unavailable(String),
}

/// Trait for pricing and availability of shipping methods.
#[async_trait]
pub trait ShippingEvaluator: Send + Sync {
    async fn get_cost(
        &self,
        method_id: ShippingMethodId,
        lines: &[CartLine],
    ) -> Result<Money, ShippingError>;

    async fn is_available(
        &self,
        method_id: ShippingMethodId,
        order_total: Money,
    ) -> Result<bool, ShippingError>;
}

/// A flat-plus-per-unit shipping method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingMethod {
    pub base_cost: Money,
    pub per_unit: Money,
    /// Orders above this total cannot use the method.
    pub max_order_total: Option<Money>,
    pub enabled: bool,
}

impl ShippingMethod {
    pub fn flat(cost: Money) -> Self {
        Self {
            base_cost: cost,
            per_unit: Money::zero(),
            max_order_total: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    methods: HashMap<ShippingMethodId, ShippingMethod>,
    fail_on_evaluate: bool,
}

/// In-memory shipping evaluator for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingEvaluator {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a method under a fresh id and returns the id.
    pub fn add_method(&self, method: ShippingMethod) -> ShippingMethodId {
        let id = ShippingMethodId::new();
        self.state.write().unwrap().methods.insert(id, method);
        id
    }

    pub fn set_fail_on_evaluate(&self, fail: bool) {
        self.state.write().unwrap().fail_on_evaluate = fail;
    }

    fn method(&self, method_id: ShippingMethodId) -> Result<ShippingMethod, ShippingError> {
        let state = self.state.read().unwrap();
        if state.fail_on_evaluate {
            return Err(ShippingError::Unavailable("carrier API down".to_string()));
        }
        state
            .methods
            .get(&method_id)
            .copied()
            .ok_or(ShippingError::UnknownMethod(method_id))
    }
}

#[async_trait]
impl ShippingEvaluator for InMemoryShippingEvaluator {
    async fn get_cost(
        &self,
        method_id: ShippingMethodId,
        lines: &[CartLine],
    ) -> Result<Money, ShippingError> {
        let method = self.method(method_id)?;
        let units: u32 = lines.iter().map(|line| line.quantity).sum();
        Ok(method.base_cost + method.per_unit.multiply(units))
    }

    async fn is_available(
        &self,
        method_id: ShippingMethodId,
        order_total: Money,
    ) -> Result<bool, ShippingError> {
        let method = self.method(method_id)?;
        Ok(method.enabled && method.max_order_total.is_none_or(|max| order_total <= max))
    }
}
