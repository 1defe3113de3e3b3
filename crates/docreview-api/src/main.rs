//! Docreview API server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use docreview_api::config::AppConfig;
use docreview_api::error::AppError;
use docreview_api::routes;
use docreview_api::state::{ServiceSettings, Services, Storage};
use docreview_api::telemetry;
use docreview_core::clock::SystemClock;
use docreview_core::rng::SystemRng;
use docreview_event_store::{MIGRATOR, PgEventRepository, PgProjectionStore};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = AppConfig::from_env()?;
    let tracer_provider = telemetry::init(config.otlp_endpoint.as_deref())?;
    let result = run(config).await;
    if let Err(err) = &result {
        tracing::error!(error = %err, "server exited with error");
    }
    telemetry::shutdown(tracer_provider);
    result
}

async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting docreview API server");
    let metrics = telemetry::install_metrics()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    MIGRATOR.run(&pool).await?;
    tracing::info!("migrations applied");

    let events = Arc::new(PgEventRepository::new(pool.clone()));
    let storage = Storage {
        events: events.clone(),
        snapshots: events,
        projections: Arc::new(PgProjectionStore::new(pool)),
    };
    let settings = ServiceSettings {
        repository: config.repository,
        projections: config.projections,
        dispatch_mode: config.dispatch_mode,
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let services = Services::build(
        storage,
        Arc::new(SystemClock),
        Box::new(SystemRng),
        settings,
        shutdown_rx.clone(),
    )?;

    // In-memory read models are rebuilt and durable ones resume from their
    // checkpoints before traffic arrives.
    services.dispatcher.resume_all().await;

    let retry_worker = services.retry_worker;
    let worker_shutdown = shutdown_rx.clone();
    let worker = tokio::spawn(async move { retry_worker.run(worker_shutdown).await });

    let app = routes::app(services.state.with_metrics(metrics));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| AppError::Config(format!("invalid HOST:PORT combination: {e}")))?;
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await;

    for handle in services.lanes.into_iter().chain(std::iter::once(worker)) {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "background task did not stop cleanly");
        }
    }
    tracing::info!("server stopped");
    served.map_err(AppError::from)
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
    let _ = shutdown.send(true);
}
