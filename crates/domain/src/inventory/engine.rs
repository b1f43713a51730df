//! Stateless stock decisions.
//!
//! Every operation takes the current variant snapshot, mutates its counters
//! only on success, and returns the ledger row the caller must persist in the
//! same unit of work.

use std::collections::HashMap;

use chrono::Utc;
use common::{LedgerEntryId, OrderItemId, VariantId};

use super::{Actor, InventoryError, InventoryTransaction, TransactionKind, Variant};

/// Result of a single stock operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockOutcome {
    /// Counters updated. `None` when nothing had to change (unlimited variant,
    /// nothing left to release, ledger already in line).
    Applied(Option<InventoryTransaction>),
    InsufficientStock {
        variant_id: VariantId,
        requested: i64,
        available: i64,
    },
    Failed {
        variant_id: VariantId,
        reason: String,
    },
}

impl StockOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, StockOutcome::Applied(_))
    }

    pub fn into_result(self) -> Result<Option<InventoryTransaction>, InventoryError> {
        match self {
            StockOutcome::Applied(entry) => Ok(entry),
            StockOutcome::InsufficientStock {
                variant_id,
                requested,
                available,
            } => Err(InventoryError::InsufficientStock {
                variant_id,
                requested,
                available,
            }),
            StockOutcome::Failed { variant_id, reason } => {
                Err(InventoryError::OperationFailed { variant_id, reason })
            }
        }
    }
}

/// One line of a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLine {
    pub variant_id: VariantId,
    pub quantity: u32,
    pub correlation_id: Option<OrderItemId>,
}

impl StockLine {
    pub fn new(variant_id: VariantId, quantity: u32) -> Self {
        Self {
            variant_id,
            quantity,
            correlation_id: None,
        }
    }

    pub fn for_item(variant_id: VariantId, quantity: u32, order_item_id: OrderItemId) -> Self {
        Self {
            variant_id,
            quantity,
            correlation_id: Some(order_item_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchFailureReason {
    UnknownVariant,
    /// `requested` is the total over every line naming the variant.
    InsufficientStock { requested: i64, available: i64 },
    Failed(String),
}

/// Why one line of a batch could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub variant_id: VariantId,
    pub correlation_id: Option<OrderItemId>,
    pub reason: BatchFailureReason,
}

impl std::fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            BatchFailureReason::UnknownVariant => write!(f, "{}: unknown variant", self.variant_id),
            BatchFailureReason::InsufficientStock {
                requested,
                available,
            } => write!(
                f,
                "{}: requested {requested}, available {available}",
                self.variant_id
            ),
            BatchFailureReason::Failed(reason) => write!(f, "{}: {reason}", self.variant_id),
        }
    }
}

/// Stateless inventory reservation engine.
pub struct InventoryEngine;

impl InventoryEngine {
    /// Holds `quantity` units for an order item.
    pub fn reserve(
        variant: &mut Variant,
        quantity: u32,
        order_item_id: OrderItemId,
        actor: &Actor,
    ) -> StockOutcome {
        let qty = i64::from(quantity);
        if qty == 0 {
            return failed(variant, "quantity must be positive");
        }
        if variant.unlimited {
            return StockOutcome::Applied(None);
        }
        if variant.available() < qty {
            return StockOutcome::InsufficientStock {
                variant_id: variant.id,
                requested: qty,
                available: variant.available(),
            };
        }

        let entry = entry(
            variant,
            TransactionKind::Reservation,
            qty,
            Some(order_item_id),
            None,
            actor,
        );
        variant.set_counters(variant.on_hand(), variant.reserved() + qty);
        StockOutcome::Applied(Some(entry))
    }

    /// Turns a reservation into a final sale: both counters drop by `quantity`.
    pub fn confirm_reservation(
        variant: &mut Variant,
        quantity: u32,
        order_item_id: OrderItemId,
        actor: &Actor,
    ) -> StockOutcome {
        let qty = i64::from(quantity);
        if qty == 0 {
            return failed(variant, "quantity must be positive");
        }
        if variant.unlimited {
            return StockOutcome::Applied(None);
        }
        if variant.reserved() < qty {
            return failed(
                variant,
                format!("reserved {} is less than {qty}", variant.reserved()),
            );
        }

        let entry = entry(
            variant,
            TransactionKind::ConfirmReservation,
            -qty,
            Some(order_item_id),
            None,
            actor,
        );
        variant.set_counters(variant.on_hand() - qty, variant.reserved() - qty);
        StockOutcome::Applied(Some(entry))
    }

    /// Releases up to `min(quantity, reserved)` units.
    pub fn rollback_reservation(
        variant: &mut Variant,
        quantity: u32,
        correlation_id: Option<OrderItemId>,
        actor: &Actor,
    ) -> StockOutcome {
        if variant.unlimited {
            return StockOutcome::Applied(None);
        }

        let release = i64::from(quantity).min(variant.reserved());
        if release <= 0 {
            tracing::debug!(variant_id = %variant.id, "Nothing reserved to release");
            return StockOutcome::Applied(None);
        }

        let entry = entry(
            variant,
            TransactionKind::ReservationRollback,
            -release,
            correlation_id,
            None,
            actor,
        );
        variant.set_counters(variant.on_hand(), variant.reserved() - release);
        StockOutcome::Applied(Some(entry))
    }

    /// Puts returned units back on hand.
    pub fn return_stock(
        variant: &mut Variant,
        quantity: u32,
        reason: &str,
        actor: &Actor,
    ) -> StockOutcome {
        if quantity == 0 {
            return failed(variant, "quantity must be positive");
        }
        Self::change_on_hand(
            variant,
            TransactionKind::Return,
            i64::from(quantity),
            reason,
            actor,
        )
    }

    /// Applies a signed manual correction to on-hand.
    pub fn adjust_stock(variant: &mut Variant, delta: i64, reason: &str, actor: &Actor) -> StockOutcome {
        if delta == 0 {
            return failed(variant, "adjustment must be non-zero");
        }
        Self::change_on_hand(variant, TransactionKind::Adjustment, delta, reason, actor)
    }

    /// Writes off damaged units.
    pub fn record_damage(
        variant: &mut Variant,
        quantity: u32,
        reason: &str,
        actor: &Actor,
    ) -> StockOutcome {
        if quantity == 0 {
            return failed(variant, "quantity must be positive");
        }
        Self::change_on_hand(
            variant,
            TransactionKind::Damage,
            -i64::from(quantity),
            reason,
            actor,
        )
    }

    /// Compares the ledger-derived on-hand figure with the live counter.
    ///
    /// On divergence emits an `Adjustment` row of `on_hand - calculated` so
    /// the ledger sums to the counter again. Counters are not moved.
    pub fn reconcile(variant: &Variant, calculated_on_hand: i64, actor: &Actor) -> StockOutcome {
        if variant.unlimited || calculated_on_hand == variant.on_hand() {
            return StockOutcome::Applied(None);
        }

        let delta = variant.on_hand() - calculated_on_hand;
        tracing::warn!(
            variant_id = %variant.id,
            on_hand = variant.on_hand(),
            calculated_on_hand,
            delta,
            "Ledger drift detected"
        );

        let mut entry = entry(
            variant,
            TransactionKind::Adjustment,
            delta,
            None,
            Some(format!(
                "reconciliation: ledger {calculated_on_hand}, counter {}",
                variant.on_hand()
            )),
            actor,
        );
        entry.reference = Some("reconciliation".to_string());
        StockOutcome::Applied(Some(entry))
    }

    /// Checks every line against current availability without mutating.
    ///
    /// Lines naming the same variant are checked against their combined
    /// quantity.
    pub fn validate_batch_availability(
        variants: &HashMap<VariantId, Variant>,
        lines: &[StockLine],
    ) -> Result<(), Vec<BatchFailure>> {
        let mut totals: HashMap<VariantId, i64> = HashMap::new();
        for line in lines {
            *totals.entry(line.variant_id).or_default() += i64::from(line.quantity);
        }

        let failures: Vec<BatchFailure> = lines
            .iter()
            .filter_map(|line| {
                let reason = match variants.get(&line.variant_id) {
                    None => BatchFailureReason::UnknownVariant,
                    Some(_) if line.quantity == 0 => {
                        BatchFailureReason::Failed("quantity must be positive".to_string())
                    }
                    Some(variant) => {
                        let requested = totals.get(&line.variant_id).copied().unwrap_or_default();
                        if variant.can_fulfil(requested) {
                            return None;
                        }
                        BatchFailureReason::InsufficientStock {
                            requested,
                            available: variant.available(),
                        }
                    }
                };
                Some(BatchFailure {
                    variant_id: line.variant_id,
                    correlation_id: line.correlation_id,
                    reason,
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }

    /// Reserves every line or none of them.
    pub fn reserve_batch(
        variants: &mut HashMap<VariantId, Variant>,
        lines: &[StockLine],
        actor: &Actor,
    ) -> Result<Vec<InventoryTransaction>, Vec<BatchFailure>> {
        Self::validate_batch_availability(variants, lines)?;

        Self::apply_batch(variants, lines, |variant, line| match line.correlation_id {
            Some(order_item_id) => Self::reserve(variant, line.quantity, order_item_id, actor),
            None => failed(variant, "reservation requires an order item id"),
        })
    }

    /// Confirms every line or none of them.
    pub fn confirm_batch(
        variants: &mut HashMap<VariantId, Variant>,
        lines: &[StockLine],
        actor: &Actor,
    ) -> Result<Vec<InventoryTransaction>, Vec<BatchFailure>> {
        Self::apply_batch(variants, lines, |variant, line| match line.correlation_id {
            Some(order_item_id) => {
                Self::confirm_reservation(variant, line.quantity, order_item_id, actor)
            }
            None => failed(variant, "confirmation requires an order item id"),
        })
    }

    /// Releases every line. Fails only when a variant is unknown.
    pub fn release_batch(
        variants: &mut HashMap<VariantId, Variant>,
        lines: &[StockLine],
        actor: &Actor,
    ) -> Result<Vec<InventoryTransaction>, Vec<BatchFailure>> {
        Self::apply_batch(variants, lines, |variant, line| {
            Self::rollback_reservation(variant, line.quantity, line.correlation_id, actor)
        })
    }

    fn change_on_hand(
        variant: &mut Variant,
        kind: TransactionKind,
        delta: i64,
        reason: &str,
        actor: &Actor,
    ) -> StockOutcome {
        if reason.trim().is_empty() {
            return failed(variant, "a reason is required");
        }
        if variant.unlimited {
            return StockOutcome::Applied(None);
        }

        let on_hand = variant.on_hand() + delta;
        if on_hand < 0 {
            return failed(variant, format!("on-hand would become {on_hand}"));
        }
        if on_hand < variant.reserved() {
            return failed(
                variant,
                format!(
                    "on-hand {on_hand} would drop below reserved {}",
                    variant.reserved()
                ),
            );
        }

        let entry = entry(variant, kind, delta, None, Some(reason.to_string()), actor);
        variant.set_counters(on_hand, variant.reserved());
        StockOutcome::Applied(Some(entry))
    }

    /// Runs `op` over working copies and writes them back only if every line
    /// applied.
    fn apply_batch<F>(
        variants: &mut HashMap<VariantId, Variant>,
        lines: &[StockLine],
        mut op: F,
    ) -> Result<Vec<InventoryTransaction>, Vec<BatchFailure>>
    where
        F: FnMut(&mut Variant, &StockLine) -> StockOutcome,
    {
        let mut working: HashMap<VariantId, Variant> = lines
            .iter()
            .filter_map(|line| variants.get(&line.variant_id))
            .map(|variant| (variant.id, variant.clone()))
            .collect();

        let mut entries = Vec::new();
        let mut failures = Vec::new();

        for line in lines {
            let Some(variant) = working.get_mut(&line.variant_id) else {
                failures.push(BatchFailure {
                    variant_id: line.variant_id,
                    correlation_id: line.correlation_id,
                    reason: BatchFailureReason::UnknownVariant,
                });
                continue;
            };

            let reason = match op(variant, line) {
                StockOutcome::Applied(entry) => {
                    entries.extend(entry);
                    continue;
                }
                StockOutcome::InsufficientStock {
                    requested,
                    available,
                    ..
                } => BatchFailureReason::InsufficientStock {
                    requested,
                    available,
                },
                StockOutcome::Failed { reason, .. } => BatchFailureReason::Failed(reason),
            };
            failures.push(BatchFailure {
                variant_id: line.variant_id,
                correlation_id: line.correlation_id,
                reason,
            });
        }

        if !failures.is_empty() {
            return Err(failures);
        }

        variants.extend(working);
        Ok(entries)
    }
}

fn failed(variant: &Variant, reason: impl Into<String>) -> StockOutcome {
    StockOutcome::Failed {
        variant_id: variant.id,
        reason: reason.into(),
    }
}

fn entry(
    variant: &Variant,
    kind: TransactionKind,
    quantity_delta: i64,
    correlation_id: Option<OrderItemId>,
    reason: Option<String>,
    actor: &Actor,
) -> InventoryTransaction {
    InventoryTransaction {
        id: LedgerEntryId::new(),
        variant_id: variant.id,
        kind,
        quantity_delta,
        stock_before: variant.on_hand(),
        reserved_before: variant.reserved(),
        correlation_id,
        reference: None,
        reason,
        actor: actor.clone(),
        created_at: Utc::now(),
    }
}
