//! Reservation release for failed, cancelled and expired orders.
//!
//! Payment failure, cancellation and expiry all release stock through
//! [`release_order_reservations`]. An item is released only if its
//! reservation exists in the ledger and was neither confirmed nor rolled
//! back, so running it twice for the same order releases nothing the second
//! time.

use chrono::{DateTime, Utc};
use domain::{Actor, InventoryEngine, Order, StockLine, TransactionKind};
use store::UnitOfWork;

use crate::stock::{lock_variant_map, persist_stock_changes};
use crate::{CheckoutError, Result};

/// What a release pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    /// Items whose reservation was released.
    pub items_released: usize,
    /// Units returned to availability.
    pub units_released: i64,
}

/// Releases every outstanding reservation of `order` inside `uow`.
#[tracing::instrument(skip(uow, order, actor), fields(order_id = %order.id()))]
pub async fn release_order_reservations<U: UnitOfWork>(
    uow: &mut U,
    order: &Order,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<ReleaseSummary> {
    let mut lines = Vec::new();

    for item in order.items() {
        let settled = uow
            .ledger_has_entry(TransactionKind::ReservationRollback, item.id())
            .await?
            || uow
                .ledger_has_entry(TransactionKind::ConfirmReservation, item.id())
                .await?;
        if settled {
            continue;
        }

        if !uow
            .ledger_has_entry(TransactionKind::Reservation, item.id())
            .await?
        {
            continue;
        }

        lines.push(StockLine::for_item(
            item.variant_id(),
            item.quantity(),
            item.id(),
        ));
    }

    if lines.is_empty() {
        tracing::debug!("no outstanding reservations");
        return Ok(ReleaseSummary::default());
    }

    let mut variants = lock_variant_map(uow, lines.iter().map(|l| l.variant_id)).await?;

    let entries = InventoryEngine::release_batch(&mut variants, &lines, actor).map_err(|failures| {
        let reason = failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        tracing::error!(%reason, "reservation release failed");
        CheckoutError::CompensationFailed {
            order_id: order.id(),
            reason,
        }
    })?;

    persist_stock_changes(uow, &mut variants, &entries, now).await?;

    let summary = ReleaseSummary {
        items_released: entries.len(),
        units_released: entries.iter().map(|e| -e.quantity_delta).sum(),
    };
    metrics::counter!("reservations_released_total").increment(summary.items_released as u64);
    tracing::info!(
        items = summary.items_released,
        units = summary.units_released,
        "reservations released"
    );

    Ok(summary)
}
