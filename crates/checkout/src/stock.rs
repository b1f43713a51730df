//! Loading and persisting variants around inventory engine calls.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use common::VariantId;
use domain::{
    Actor, InventoryEngine, InventoryTransaction, OutboxMessage, StockLedger, StockOutcome,
    Variant,
};
use serde::{Deserialize, Serialize};
use store::UnitOfWork;

use crate::{CheckoutError, Result};

/// A manual change to a variant's on-hand stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StockCorrection {
    /// Returned units go back on hand.
    Return { quantity: u32, reason: String },
    /// Signed correction after a stock count.
    Adjust { delta: i64, reason: String },
    /// Damaged units are written off.
    Damage { quantity: u32, reason: String },
}

impl StockCorrection {
    fn apply(&self, variant: &mut Variant, actor: &Actor) -> StockOutcome {
        match self {
            StockCorrection::Return { quantity, reason } => {
                InventoryEngine::return_stock(variant, *quantity, reason, actor)
            }
            StockCorrection::Adjust { delta, reason } => {
                InventoryEngine::adjust_stock(variant, *delta, reason, actor)
            }
            StockCorrection::Damage { quantity, reason } => {
                InventoryEngine::record_damage(variant, *quantity, reason, actor)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StockCorrection::Return { .. } => "return",
            StockCorrection::Adjust { .. } => "adjust",
            StockCorrection::Damage { .. } => "damage",
        }
    }
}

/// Locks the variants (ascending id order) and keys them by id.
pub(crate) async fn lock_variant_map<U: UnitOfWork>(
    uow: &mut U,
    ids: impl IntoIterator<Item = VariantId>,
) -> Result<HashMap<VariantId, Variant>> {
    let ids: Vec<VariantId> = ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
    Ok(uow
        .lock_variants(&ids)
        .await?
        .into_iter()
        .map(|v| (v.id, v))
        .collect())
}

/// Writes the variants named by `entries`, appends the entries to the ledger
/// and queues an availability update for each changed variant.
pub(crate) async fn persist_stock_changes<U: UnitOfWork>(
    uow: &mut U,
    variants: &mut HashMap<VariantId, Variant>,
    entries: &[InventoryTransaction],
    now: DateTime<Utc>,
) -> Result<()> {
    let touched: BTreeSet<VariantId> = entries.iter().map(|e| e.variant_id).collect();

    for id in touched {
        let Some(variant) = variants.get_mut(&id) else {
            continue;
        };
        uow.update_variant(variant).await?;
        uow.enqueue_outbox(&OutboxMessage::for_variant(variant, now)?)
            .await?;
    }

    uow.append_ledger(entries).await?;
    Ok(())
}

async fn lock_one<U: UnitOfWork>(uow: &mut U, variant_id: VariantId) -> Result<Variant> {
    uow.lock_variants(&[variant_id])
        .await?
        .into_iter()
        .next()
        .ok_or(CheckoutError::VariantNotFound(variant_id))
}

fn rejected(outcome: StockOutcome, variant_id: VariantId) -> CheckoutError {
    let reason = match outcome {
        StockOutcome::Failed { reason, .. } => reason,
        StockOutcome::InsufficientStock {
            requested,
            available,
            ..
        } => format!("requested {requested}, available {available}"),
        StockOutcome::Applied(_) => "not applied".to_string(),
    };
    CheckoutError::StockCorrectionRejected { variant_id, reason }
}

/// Applies `correction` to the locked variant inside `uow`.
///
/// Returns the ledger row written, or `None` for an unlimited variant.
pub(crate) async fn apply_correction<U: UnitOfWork>(
    uow: &mut U,
    variant_id: VariantId,
    correction: &StockCorrection,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Option<InventoryTransaction>> {
    let mut variant = lock_one(uow, variant_id).await?;

    let entry = match correction.apply(&mut variant, actor) {
        StockOutcome::Applied(entry) => entry,
        outcome => return Err(rejected(outcome, variant_id)),
    };
    let Some(entry) = entry else {
        return Ok(None);
    };

    let mut variants = HashMap::from([(variant_id, variant)]);
    persist_stock_changes(uow, &mut variants, std::slice::from_ref(&entry), now).await?;
    Ok(Some(entry))
}

/// Compares the variant's ledger with its on-hand counter and appends the
/// correcting `Adjustment` row on drift. Counters are left as they are.
pub(crate) async fn reconcile_variant<U: UnitOfWork>(
    uow: &mut U,
    variant_id: VariantId,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Option<InventoryTransaction>> {
    let variant = lock_one(uow, variant_id).await?;
    let ledger = uow.ledger_for_variant(variant_id).await?;
    let derived = StockLedger::derived_on_hand(&ledger);

    let entry = match InventoryEngine::reconcile(&variant, derived, actor) {
        StockOutcome::Applied(Some(entry)) => entry,
        StockOutcome::Applied(None) => return Ok(None),
        outcome => return Err(rejected(outcome, variant_id)),
    };

    uow.append_ledger(std::slice::from_ref(&entry)).await?;
    uow.enqueue_outbox(&OutboxMessage::for_variant(&variant, now)?)
        .await?;
    Ok(Some(entry))
}
