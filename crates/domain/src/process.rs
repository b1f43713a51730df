//! Durable checkout process state.

use chrono::{DateTime, Utc};
use common::{OrderId, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The step a checkout process has reached.
///
/// ```text
/// Created ─► InventoryReserving ─► InventoryReserved ─► PaymentPending ─► PaymentSucceeded ─► Completed
///    └──────────────┴──────────────────────┴──────────────────┴─► Compensating ─┬─► Compensated
///                                                                               └─► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProcessStep {
    #[default]
    Created,
    InventoryReserving,
    InventoryReserved,
    PaymentPending,
    PaymentSucceeded,
    Completed,
    Compensating,
    Compensated,
    Failed,
}

impl ProcessStep {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStep::Completed | ProcessStep::Compensated | ProcessStep::Failed
        )
    }

    /// Returns true if `next` is a legal successor of this step.
    pub fn can_advance_to(&self, next: ProcessStep) -> bool {
        use ProcessStep::*;

        match (*self, next) {
            (Created, InventoryReserving)
            | (InventoryReserving, InventoryReserved)
            | (InventoryReserved, PaymentPending)
            | (PaymentPending, PaymentSucceeded)
            | (PaymentSucceeded, Completed)
            | (Compensating, Compensated)
            | (Compensating, Failed) => true,
            (from, Compensating) => !from.is_terminal() && from != Compensating,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStep::Created => "Created",
            ProcessStep::InventoryReserving => "InventoryReserving",
            ProcessStep::InventoryReserved => "InventoryReserved",
            ProcessStep::PaymentPending => "PaymentPending",
            ProcessStep::PaymentSucceeded => "PaymentSucceeded",
            ProcessStep::Completed => "Completed",
            ProcessStep::Compensating => "Compensating",
            ProcessStep::Compensated => "Compensated",
            ProcessStep::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        use ProcessStep::*;

        [
            Created,
            InventoryReserving,
            InventoryReserved,
            PaymentPending,
            PaymentSucceeded,
            Completed,
            Compensating,
            Compensated,
            Failed,
        ]
        .into_iter()
        .find(|step| step.as_str() == s)
    }
}

impl std::fmt::Display for ProcessStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Process for order {order_id} cannot move from {from} to {to}")]
pub struct ProcessError {
    pub order_id: OrderId,
    pub from: ProcessStep,
    pub to: ProcessStep,
}

/// Saga progress record for one order, kept apart from the order status so a
/// crash mid-checkout can be resumed or compensated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderProcessState {
    pub order_id: OrderId,
    pub step: ProcessStep,
    pub retry_count: u32,
    pub correlation_id: Uuid,
    pub last_error: Option<String>,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderProcessState {
    pub fn new(order_id: OrderId, now: DateTime<Utc>) -> Self {
        Self {
            order_id,
            step: ProcessStep::Created,
            retry_count: 0,
            correlation_id: Uuid::new_v4(),
            last_error: None,
            version: Version::initial(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next`. Advancing to the current step is a no-op.
    pub fn advance(&mut self, next: ProcessStep, now: DateTime<Utc>) -> Result<(), ProcessError> {
        if self.step == next {
            return Ok(());
        }
        if !self.step.can_advance_to(next) {
            return Err(ProcessError {
                order_id: self.order_id,
                from: self.step,
                to: next,
            });
        }
        self.step = next;
        self.updated_at = now;
        Ok(())
    }

    /// Records a failed attempt at the current step.
    pub fn record_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_step_is_created() {
        assert_eq!(ProcessStep::default(), ProcessStep::Created);
    }

    #[test]
    fn test_forward_path() {
        let mut state = OrderProcessState::new(OrderId::new(), Utc::now());
        for step in [
            ProcessStep::InventoryReserving,
            ProcessStep::InventoryReserved,
            ProcessStep::PaymentPending,
            ProcessStep::PaymentSucceeded,
            ProcessStep::Completed,
        ] {
            state.advance(step, Utc::now()).unwrap();
        }
        assert!(state.step.is_terminal());
        assert!(state.advance(ProcessStep::Compensating, Utc::now()).is_err());
    }

    #[test]
    fn test_compensation_from_any_open_step() {
        for step in [
            ProcessStep::Created,
            ProcessStep::InventoryReserved,
            ProcessStep::PaymentPending,
            ProcessStep::PaymentSucceeded,
        ] {
            assert!(step.can_advance_to(ProcessStep::Compensating));
        }
        assert!(!ProcessStep::Compensating.can_advance_to(ProcessStep::Compensating));
        assert!(ProcessStep::Compensating.can_advance_to(ProcessStep::Compensated));
    }

    #[test]
    fn test_cannot_skip_steps() {
        assert!(!ProcessStep::Created.can_advance_to(ProcessStep::PaymentPending));
        assert!(!ProcessStep::Compensated.can_advance_to(ProcessStep::Completed));
    }

    #[test]
    fn test_record_failure() {
        let mut state = OrderProcessState::new(OrderId::new(), Utc::now());
        state.record_failure("timeout", Utc::now());
        state.record_failure("timeout again", Utc::now());
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.last_error.as_deref(), Some("timeout again"));
    }

    #[test]
    fn test_step_names_round_trip() {
        assert_eq!(
            ProcessStep::parse(ProcessStep::PaymentPending.as_str()),
            Some(ProcessStep::PaymentPending)
        );
    }
}
