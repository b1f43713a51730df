//! HTTP surface and background workers of the checkout backend.
//!
//! Provides the checkout, payment callback, order and stock correction
//! endpoints, with structured logging (tracing) and Prometheus metrics. The
//! reconciliation sweeper and the outbox relay run beside the server until
//! shutdown.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use checkout::{CheckoutOrchestrator, Collaborators, ReconciliationSweeper};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{OutboxRelay, SearchIndex};
use store::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Store>(state: Arc<AppState<S>>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::ops::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::ops::health::<S>))
        .route("/checkout", post(routes::checkout::checkout::<S>))
        .route("/payments/callback", get(routes::payments::callback::<S>))
        .route("/orders", get(routes::orders::list::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<S>))
        .route(
            "/variants/{id}/stock-corrections",
            post(routes::stock::correct::<S>),
        )
        .route("/variants/{id}/reconcile", post(routes::stock::reconcile::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the shared state around one orchestrator.
pub fn create_state<S: Store>(
    store: S,
    collaborators: Collaborators,
    config: &Config,
) -> Arc<AppState<S>> {
    let orchestrator = CheckoutOrchestrator::new(store, collaborators, config.checkout.clone());
    Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
    })
}

/// Starts the reconciliation sweeper and the outbox relay.
///
/// Both stop when `shutdown` is cancelled; await the handles to wait for
/// them.
pub fn spawn_workers<S: Store, I: SearchIndex + 'static>(
    state: &AppState<S>,
    index: I,
    config: &Config,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let sweeper = ReconciliationSweeper::new(state.orchestrator.clone(), config.sweeper.clone());
    let relay = OutboxRelay::new(
        state.orchestrator.store().clone(),
        index,
        config.relay.clone(),
    );

    let sweeper_shutdown = shutdown.clone();
    vec![
        tokio::spawn(async move { sweeper.run(sweeper_shutdown).await }),
        tokio::spawn(async move { relay.run(shutdown).await }),
    ]
}
