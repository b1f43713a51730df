//! Order state machine.
//!
//! Every legal status change is a row in [`TRANSITIONS`]. A trigger fires only
//! when a rule for `(state, trigger)` exists and its guard accepts the order.
//!
//! ```text
//! Created ─► Reserved ─► Pending ─► Paid ─► Processing ─► Shipped ─► Delivered
//!    │           │          │        │          │            │
//!    │           │          │        └──────────┴─► Refunded └─► Returned ─► Refunded
//!    ├───────────┴──────────┴─► Cancelled | Expired | Failed ─► Cancelled
//! ```

use serde::{Deserialize, Serialize};

use super::{Order, OrderError, TransitionRejection};

/// The status of an order in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Order row written, stock not yet reserved.
    #[default]
    Created,
    /// Stock reserved for every item.
    Reserved,
    /// Payment initiated, waiting for the gateway.
    Pending,
    /// Payment verified, stock committed.
    Paid,
    Processing,
    Shipped,
    /// Terminal.
    Delivered,
    /// Terminal.
    Cancelled,
    /// Payment failed; reservations released.
    Failed,
    /// Terminal. Payment window elapsed without a resolution.
    Expired,
    /// Terminal.
    Refunded,
    Returned,
}

impl OrderStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [OrderStatus; 12] = [
        OrderStatus::Created,
        OrderStatus::Reserved,
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
        OrderStatus::Failed,
        OrderStatus::Expired,
        OrderStatus::Refunded,
        OrderStatus::Returned,
    ];

    /// Returns true if no trigger may fire from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Refunded
        )
    }

    /// Returns true while the order waits for a payment outcome.
    pub fn awaits_payment(&self) -> bool {
        matches!(
            self,
            OrderStatus::Created | OrderStatus::Reserved | OrderStatus::Pending
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "Created",
            OrderStatus::Reserved => "Reserved",
            OrderStatus::Pending => "Pending",
            OrderStatus::Paid => "Paid",
            OrderStatus::Processing => "Processing",
            OrderStatus::Shipped => "Shipped",
            OrderStatus::Delivered => "Delivered",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Failed => "Failed",
            OrderStatus::Expired => "Expired",
            OrderStatus::Refunded => "Refunded",
            OrderStatus::Returned => "Returned",
        }
    }

    /// Parses a status name as produced by [`OrderStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Something that happened to an order and may move it to a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderTrigger {
    Reserve,
    AwaitPayment,
    ConfirmPayment,
    FailPayment,
    StartProcessing,
    Ship,
    Deliver,
    Cancel,
    Expire,
    Refund,
    Return,
}

impl OrderTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderTrigger::Reserve => "Reserve",
            OrderTrigger::AwaitPayment => "AwaitPayment",
            OrderTrigger::ConfirmPayment => "ConfirmPayment",
            OrderTrigger::FailPayment => "FailPayment",
            OrderTrigger::StartProcessing => "StartProcessing",
            OrderTrigger::Ship => "Ship",
            OrderTrigger::Deliver => "Deliver",
            OrderTrigger::Cancel => "Cancel",
            OrderTrigger::Expire => "Expire",
            OrderTrigger::Refund => "Refund",
            OrderTrigger::Return => "Return",
        }
    }
}

impl std::fmt::Display for OrderTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Predicate a transition rule evaluates against the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guard {
    Always,
    NotDeleted,
    /// Not deleted, not shipped, not delivered and not paid.
    CanCancel,
    Paid,
    NotPaid,
}

impl Guard {
    /// Evaluates the guard against an order.
    pub fn allows(&self, order: &Order) -> bool {
        match self {
            Guard::Always => true,
            Guard::NotDeleted => !order.is_deleted(),
            Guard::CanCancel => {
                !order.is_deleted()
                    && order.shipped_at().is_none()
                    && order.delivered_at().is_none()
                    && !order.is_paid()
            }
            Guard::Paid => order.is_paid(),
            Guard::NotPaid => !order.is_paid(),
        }
    }
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: OrderStatus,
    pub trigger: OrderTrigger,
    pub to: OrderStatus,
    pub guard: Guard,
}

const fn rule(
    from: OrderStatus,
    trigger: OrderTrigger,
    to: OrderStatus,
    guard: Guard,
) -> TransitionRule {
    TransitionRule {
        from,
        trigger,
        to,
        guard,
    }
}

use Guard::{Always, CanCancel, NotDeleted, NotPaid, Paid};
use OrderStatus as S;
use OrderTrigger as T;

/// The canonical transition table.
pub const TRANSITIONS: &[TransitionRule] = &[
    rule(S::Created, T::Reserve, S::Reserved, NotDeleted),
    rule(S::Created, T::Cancel, S::Cancelled, CanCancel),
    rule(S::Created, T::Expire, S::Expired, NotPaid),
    rule(S::Created, T::FailPayment, S::Failed, NotPaid),
    rule(S::Reserved, T::AwaitPayment, S::Pending, NotDeleted),
    rule(S::Reserved, T::Cancel, S::Cancelled, CanCancel),
    rule(S::Reserved, T::Expire, S::Expired, NotPaid),
    rule(S::Reserved, T::FailPayment, S::Failed, NotPaid),
    rule(S::Pending, T::ConfirmPayment, S::Paid, NotDeleted),
    rule(S::Pending, T::FailPayment, S::Failed, NotPaid),
    rule(S::Pending, T::Cancel, S::Cancelled, CanCancel),
    rule(S::Pending, T::Expire, S::Expired, NotPaid),
    rule(S::Paid, T::StartProcessing, S::Processing, Paid),
    rule(S::Paid, T::Refund, S::Refunded, Paid),
    rule(S::Processing, T::Ship, S::Shipped, Paid),
    rule(S::Processing, T::Refund, S::Refunded, Paid),
    rule(S::Shipped, T::Deliver, S::Delivered, Always),
    rule(S::Shipped, T::Return, S::Returned, Always),
    rule(S::Returned, T::Refund, S::Refunded, Paid),
    rule(S::Failed, T::Cancel, S::Cancelled, CanCancel),
];

/// Table-driven order state machine.
pub struct OrderStateMachine;

impl OrderStateMachine {
    /// Returns the full transition table.
    pub fn rules() -> &'static [TransitionRule] {
        TRANSITIONS
    }

    /// Looks up the rule for `(state, trigger)`, ignoring guards.
    pub fn find_rule(state: OrderStatus, trigger: OrderTrigger) -> Option<&'static TransitionRule> {
        TRANSITIONS
            .iter()
            .find(|r| r.from == state && r.trigger == trigger)
    }

    /// Resolves the target status of `trigger` fired from `state`.
    pub fn transition(
        state: OrderStatus,
        trigger: OrderTrigger,
        order: &Order,
    ) -> Result<OrderStatus, OrderError> {
        let rejection = |reason| OrderError::InvalidTransition {
            from: state,
            trigger,
            reason,
        };

        if state.is_terminal() {
            return Err(rejection(TransitionRejection::TerminalState));
        }

        let rule = Self::find_rule(state, trigger).ok_or(rejection(TransitionRejection::NoRule))?;

        if !rule.guard.allows(order) {
            return Err(rejection(TransitionRejection::GuardRejected(rule.guard)));
        }

        Ok(rule.to)
    }

    /// Non-failing probe for [`OrderStateMachine::transition`].
    pub fn can_transition(state: OrderStatus, trigger: OrderTrigger, order: &Order) -> bool {
        Self::transition(state, trigger, order).is_ok()
    }

    /// Triggers that would currently succeed for the order.
    pub fn permitted_triggers(state: OrderStatus, order: &Order) -> Vec<OrderTrigger> {
        TRANSITIONS
            .iter()
            .filter(|r| r.from == state)
            .filter(|r| !state.is_terminal() && r.guard.allows(order))
            .map(|r| r.trigger)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::order::tests_support::sample_order;

    #[test]
    fn test_default_status_is_created() {
        assert_eq!(OrderStatus::default(), OrderStatus::Created);
    }

    #[test]
    fn test_terminal_states_have_no_rules() {
        for rule in TRANSITIONS {
            assert!(
                !rule.from.is_terminal(),
                "rule leaves terminal state {}",
                rule.from
            );
        }
    }

    #[test]
    fn test_table_has_no_duplicate_keys() {
        let mut seen = HashSet::new();
        for rule in TRANSITIONS {
            assert!(seen.insert((rule.from, rule.trigger)));
        }
    }

    #[test]
    fn test_transition_not_in_table_is_rejected() {
        let order = sample_order();
        let err = OrderStateMachine::transition(
            OrderStatus::Created,
            OrderTrigger::Deliver,
            &order,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            OrderError::InvalidTransition {
                reason: TransitionRejection::NoRule,
                ..
            }
        ));
    }

    #[test]
    fn test_no_trigger_fires_from_terminal_state() {
        let order = sample_order();
        let triggers = [
            OrderTrigger::Reserve,
            OrderTrigger::AwaitPayment,
            OrderTrigger::ConfirmPayment,
            OrderTrigger::FailPayment,
            OrderTrigger::StartProcessing,
            OrderTrigger::Ship,
            OrderTrigger::Deliver,
            OrderTrigger::Cancel,
            OrderTrigger::Expire,
            OrderTrigger::Refund,
            OrderTrigger::Return,
        ];
        for state in OrderStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for trigger in triggers {
                assert!(!OrderStateMachine::can_transition(state, trigger, &order));
            }
            assert!(OrderStateMachine::permitted_triggers(state, &order).is_empty());
        }
    }

    #[test]
    fn test_guard_rejection_is_reported() {
        let order = sample_order();
        let err =
            OrderStateMachine::transition(OrderStatus::Paid, OrderTrigger::Refund, &order)
                .unwrap_err();
        assert!(matches!(
            err,
            OrderError::InvalidTransition {
                reason: TransitionRejection::GuardRejected(Guard::Paid),
                ..
            }
        ));
    }

    #[test]
    fn test_pending_permits_payment_outcomes() {
        let order = sample_order();
        let triggers = OrderStateMachine::permitted_triggers(OrderStatus::Pending, &order);
        assert!(triggers.contains(&OrderTrigger::ConfirmPayment));
        assert!(triggers.contains(&OrderTrigger::FailPayment));
        assert!(triggers.contains(&OrderTrigger::Cancel));
        assert!(triggers.contains(&OrderTrigger::Expire));
        assert!(!triggers.contains(&OrderTrigger::Ship));
    }

    #[test]
    fn test_status_round_trips_through_name() {
        for status in OrderStatus::ALL {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("Draft"), None);
    }
}
