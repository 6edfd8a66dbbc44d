use anyhow::{Context, Result};
use presenced::{
    build_router, sweeper, AppState, AttendanceService, Config, EngineHandle, Pipeline, SqliteStore, Sweeper,
    SystemClock,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "presenced starting");

    let config = Config::from_env().context("invalid configuration")?;
    let schedule = sweeper::parse_schedule(&config.sweep_schedule).context("invalid sweep schedule")?;

    let pipeline = Pipeline::load(&config.model_dir, config.detector)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    let engine = EngineHandle::new(pipeline);

    let store = Arc::new(
        SqliteStore::open(&config.credentials)
            .await
            .context("failed to open attendance store")?,
    );

    let clock = Arc::new(SystemClock);
    let writer = Arc::new(Mutex::new(()));

    let service = Arc::new(AttendanceService::new(
        Arc::new(engine),
        store.clone(),
        store.clone(),
        clock.clone(),
        config.window.clone(),
        config.present_policy,
        config.store_timeout,
        writer.clone(),
    ));

    let sweeper = Arc::new(Sweeper::new(
        store.clone(),
        store,
        clock,
        config.window.clone(),
        config.store_timeout,
        writer,
    ));
    let sweep_task = sweeper.spawn(schedule);

    let app = build_router(AppState { service }, config.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    tracing::info!(
        bind = %config.bind,
        schedule = %config.sweep_schedule,
        policy = ?config.present_policy,
        "presenced ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("HTTP server error")?;

    sweep_task.abort();
    tracing::info!("presenced shutting down");

    Ok(())
}
