//! Payment reconciliation sweeper.
//!
//! A background task that finds payments the gateway callback never resolved
//! and orders whose payment window elapsed. Stuck payments are re-verified;
//! overdue orders are expired and their stock released through the shared
//! compensation path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use store::{OrderRepository, PaymentRepository, Store};
use tokio_util::sync::CancellationToken;

use crate::commands::{CallbackStatus, PaymentOutcome};
use crate::orchestrator::{CheckoutOrchestrator, SWEEPER_ACTOR, VerificationOrigin};
use crate::services::Alert;
use crate::Result;

/// Sweeper settings.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Pause between sweeps while they succeed.
    pub interval: Duration,
    /// Unresolved payments older than this are re-verified.
    pub stuck_payment_timeout: chrono::Duration,
    /// Unpaid orders older than this are expired.
    pub payment_window: chrono::Duration,
    /// Consecutive failed sweeps before an operator alert.
    pub error_threshold: u32,
    /// Upper bound of the backoff between failed sweeps.
    pub max_backoff: Duration,
    /// Rows loaded per sweep for each of the two passes.
    pub batch_size: u32,
    /// Automatic retries of one order after a concurrency conflict.
    pub conflict_retries: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_payment_timeout: chrono::Duration::minutes(5),
            payment_window: chrono::Duration::minutes(20),
            error_threshold: 5,
            max_backoff: Duration::from_secs(15 * 60),
            batch_size: 100,
            conflict_retries: 3,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub payments_checked: usize,
    pub payments_confirmed: usize,
    pub orders_expired: usize,
    /// Orders that could not be processed. They are picked up again next run.
    pub failures: usize,
}

pub struct ReconciliationSweeper<S: Store> {
    orchestrator: Arc<CheckoutOrchestrator<S>>,
    config: SweeperConfig,
}

impl<S: Store> ReconciliationSweeper<S> {
    pub fn new(orchestrator: Arc<CheckoutOrchestrator<S>>, config: SweeperConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Runs both passes once.
    ///
    /// Only failing to list candidates fails the sweep. A single order that
    /// cannot be processed is counted in [`SweepReport::failures`].
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        // 1. Re-verify payments stuck without a callback
        let stuck = {
            let mut uow = self.orchestrator.store().begin().await?;
            uow.unresolved_payments(now - self.config.stuck_payment_timeout, self.config.batch_size)
                .await?
        };

        for payment in &stuck {
            report.payments_checked += 1;
            let resolved = self
                .retry_on_conflict(|| {
                    self.orchestrator.resolve_payment(
                        payment.order_id,
                        &payment.authority,
                        CallbackStatus::Ok,
                        VerificationOrigin::Sweeper,
                    )
                })
                .await;

            match resolved {
                Ok(PaymentOutcome::Verified { .. }) => report.payments_confirmed += 1,
                Ok(outcome) => {
                    tracing::debug!(order_id = %payment.order_id, ?outcome, "stuck payment checked")
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(
                        order_id = %payment.order_id,
                        error = %e,
                        "stuck payment not resolved"
                    );
                }
            }
        }

        // 2. Expire orders whose payment window elapsed
        let cutoff = now - self.config.payment_window;
        let overdue = {
            let mut uow = self.orchestrator.store().begin().await?;
            uow.orders_awaiting_payment(cutoff, self.config.batch_size)
                .await?
        };

        for order in &overdue {
            let order_id = order.id();
            match self
                .retry_on_conflict(|| self.orchestrator.expire_order(order_id, cutoff))
                .await
            {
                Ok(true) => report.orders_expired += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(%order_id, error = %e, "order not expired");
                }
            }
        }

        tracing::info!(
            payments_checked = report.payments_checked,
            payments_confirmed = report.payments_confirmed,
            orders_expired = report.orders_expired,
            failures = report.failures,
            "sweep finished"
        );
        Ok(report)
    }

    /// Sweeps once on start, then every `interval` until `shutdown` is
    /// cancelled.
    ///
    /// After a failed sweep the next one waits [`Self::backoff_delay`]. An
    /// alert is raised once when the failure streak reaches
    /// `error_threshold`.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "reconciliation sweeper started"
        );
        let mut consecutive_failures: u32 = 0;

        loop {
            metrics::counter!("sweeper_runs_total").increment(1);
            match self.sweep_once().await {
                Ok(_) => {
                    if consecutive_failures > 0 {
                        tracing::info!(consecutive_failures, "sweeper recovered");
                    }
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    metrics::counter!("sweeper_failures_total").increment(1);
                    tracing::warn!(error = %e, consecutive_failures, "sweep failed");

                    if consecutive_failures == self.config.error_threshold {
                        self.orchestrator
                            .alert(Alert::critical(
                                SWEEPER_ACTOR,
                                format!("{consecutive_failures} consecutive sweeps failed, last error: {e}"),
                            ))
                            .await;
                    }
                }
            }

            let delay = if consecutive_failures == 0 {
                self.config.interval
            } else {
                self.backoff_delay(consecutive_failures)
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("reconciliation sweeper stopped");
                    return;
                }
            }
        }
    }

    /// `interval * 2^(n-1)`, capped at `max_backoff`.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        self.config
            .interval
            .saturating_mul(1 << exponent)
            .min(self.config.max_backoff)
    }

    async fn retry_on_conflict<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_conflict() && attempt < self.config.conflict_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, "retrying after concurrency conflict");
                }
                other => return other,
            }
        }
    }
}
