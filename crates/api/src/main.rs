//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use checkout::{
    Collaborators, InMemoryDiscountEvaluator, InMemoryPaymentGateway, InMemoryShippingEvaluator,
    ShippingMethod, TracingAlertSink, TracingAuditSink, TracingNotificationSink,
};
use domain::Money;
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::InMemorySearchIndex;
use sqlx::postgres::PgPoolOptions;
use store::{InMemoryStore, PostgresStore, Store};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let (json, pretty) = match config.log_format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .init();
}

/// Gateway, discount and shipping run in-process; sinks write to the log.
fn local_collaborators() -> Collaborators {
    let shipping = InMemoryShippingEvaluator::new();
    let standard = shipping.add_method(ShippingMethod::flat(Money::zero()));
    tracing::info!(shipping_method_id = %standard, "standard shipping method registered");

    Collaborators {
        payment_gateway: Arc::new(InMemoryPaymentGateway::new()),
        discounts: Arc::new(InMemoryDiscountEvaluator::new()),
        shipping: Arc::new(shipping),
        notifications: Arc::new(TracingNotificationSink),
        audit: Arc::new(TracingAuditSink),
        alerts: Arc::new(TracingAlertSink),
    }
}

async fn serve<S: Store>(store: S, config: Config, metrics_handle: PrometheusHandle) {
    // 4. Build state and start background workers
    let state = api::create_state(store, local_collaborators(), &config);
    let shutdown = CancellationToken::new();
    let workers = api::spawn_workers(&state, InMemorySearchIndex::new(), &config, shutdown.clone());

    // 5. Build the application
    let app = api::create_app(state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop workers
    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "background worker ended abnormally");
        }
    }

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env().expect("invalid configuration");
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the store
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to database");
            let store = PostgresStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL store");
            serve(store, config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            serve(InMemoryStore::new(), config, metrics_handle).await;
        }
    }
}
