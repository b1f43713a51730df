//! Append-only stock ledger rows.

use chrono::{DateTime, Utc};
use common::{LedgerEntryId, OrderItemId, UserId, VariantId};
use serde::{Deserialize, Serialize};

use super::InventoryError;

/// What a ledger row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// `+qty` to reserved.
    Reservation,
    /// `-qty` to both reserved and on-hand. The sale is final.
    ConfirmReservation,
    /// `-qty` to reserved.
    ReservationRollback,
    /// `+qty` to on-hand.
    Return,
    /// Signed delta to on-hand.
    Adjustment,
    /// `-qty` to on-hand.
    Damage,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Reservation => "Reservation",
            TransactionKind::ConfirmReservation => "ConfirmReservation",
            TransactionKind::ReservationRollback => "ReservationRollback",
            TransactionKind::Return => "Return",
            TransactionKind::Adjustment => "Adjustment",
            TransactionKind::Damage => "Damage",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InventoryError> {
        match s {
            "Reservation" => Ok(TransactionKind::Reservation),
            "ConfirmReservation" => Ok(TransactionKind::ConfirmReservation),
            "ReservationRollback" => Ok(TransactionKind::ReservationRollback),
            "Return" => Ok(TransactionKind::Return),
            "Adjustment" => Ok(TransactionKind::Adjustment),
            "Damage" => Ok(TransactionKind::Damage),
            other => Err(InventoryError::UnknownLedgerValue(other.to_string())),
        }
    }

    /// Returns true if rows of this kind move the on-hand counter.
    pub fn affects_on_hand(&self) -> bool {
        !matches!(
            self,
            TransactionKind::Reservation | TransactionKind::ReservationRollback
        )
    }

    /// Returns true if rows of this kind move the reserved counter.
    pub fn affects_reserved(&self) -> bool {
        matches!(
            self,
            TransactionKind::Reservation
                | TransactionKind::ReservationRollback
                | TransactionKind::ConfirmReservation
        )
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who caused a stock change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    User(UserId),
    /// A named background process, e.g. `"checkout"` or `"sweeper"`.
    System(String),
}

impl Actor {
    pub fn system(name: impl Into<String>) -> Self {
        Actor::System(name.into())
    }

    /// Parses the `user:<uuid>` / `system:<name>` form written by `Display`.
    pub fn parse(s: &str) -> Result<Self, InventoryError> {
        if let Some(id) = s.strip_prefix("user:") {
            return id
                .parse()
                .map(Actor::User)
                .map_err(|_| InventoryError::UnknownLedgerValue(s.to_string()));
        }
        s.strip_prefix("system:")
            .map(Actor::system)
            .ok_or_else(|| InventoryError::UnknownLedgerValue(s.to_string()))
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::System(name) => write!(f, "system:{name}"),
        }
    }
}

/// One immutable ledger row. Corrections are new rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTransaction {
    pub id: LedgerEntryId,
    pub variant_id: VariantId,
    pub kind: TransactionKind,
    pub quantity_delta: i64,
    /// On-hand before the change.
    pub stock_before: i64,
    /// Reserved before the change.
    pub reserved_before: i64,
    /// The order item a reservation, confirmation or rollback belongs to.
    pub correlation_id: Option<OrderItemId>,
    pub reference: Option<String>,
    pub reason: Option<String>,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
}

/// Folds of a variant's ledger.
pub struct StockLedger;

impl StockLedger {
    /// On-hand figure implied by the ledger.
    pub fn derived_on_hand(entries: &[InventoryTransaction]) -> i64 {
        entries
            .iter()
            .filter(|e| e.kind.affects_on_hand())
            .map(|e| e.quantity_delta)
            .sum()
    }

    /// Reserved figure implied by the ledger.
    pub fn derived_reserved(entries: &[InventoryTransaction]) -> i64 {
        entries
            .iter()
            .filter(|e| e.kind.affects_reserved())
            .map(|e| e.quantity_delta)
            .sum()
    }

    /// Returns true if a row of `kind` already exists for the order item.
    pub fn has_entry(
        entries: &[InventoryTransaction],
        kind: TransactionKind,
        correlation_id: OrderItemId,
    ) -> bool {
        entries
            .iter()
            .any(|e| e.kind == kind && e.correlation_id == Some(correlation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(kind: TransactionKind, delta: i64) -> InventoryTransaction {
        InventoryTransaction {
            id: LedgerEntryId::new(),
            variant_id: VariantId::new(),
            kind,
            quantity_delta: delta,
            stock_before: 0,
            reserved_before: 0,
            correlation_id: None,
            reference: None,
            reason: None,
            actor: Actor::system("test"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_derived_figures() {
        let entries = vec![
            row(TransactionKind::Adjustment, 10),
            row(TransactionKind::Reservation, 3),
            row(TransactionKind::ConfirmReservation, -2),
            row(TransactionKind::ReservationRollback, -1),
            row(TransactionKind::Damage, -1),
            row(TransactionKind::Return, 1),
        ];

        assert_eq!(StockLedger::derived_on_hand(&entries), 8);
        assert_eq!(StockLedger::derived_reserved(&entries), 0);
    }

    #[test]
    fn test_actor_round_trips_through_display() {
        let user = Actor::User(UserId::new());
        assert_eq!(Actor::parse(&user.to_string()).unwrap(), user);

        let system = Actor::system("sweeper");
        assert_eq!(system.to_string(), "system:sweeper");
        assert_eq!(Actor::parse("system:sweeper").unwrap(), system);
        assert!(Actor::parse("robot").is_err());
    }

    #[test]
    fn test_kind_parse_rejects_unknown() {
        assert_eq!(
            TransactionKind::parse("Damage").unwrap(),
            TransactionKind::Damage
        );
        assert!(TransactionKind::parse("Theft").is_err());
    }
}
