use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use pipeline_orchestrator::api::{self, AppState};
use pipeline_orchestrator::config::ServiceConfig;
use pipeline_orchestrator::interrupt::{OsProcesses, ProcessControl};
use pipeline_orchestrator::queue::TaskQueue;
use pipeline_orchestrator::store::{LibSqlBackend, StateStore, TaskRecords, spawn_sweeper};
use pipeline_orchestrator::worker::{Executor, spawn_worker_pool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing();

    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    info!(version = env!("CARGO_PKG_VERSION"), "pipeline-orchestrator starting");

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let store: Arc<dyn StateStore> = backend.clone();
    let queue: Arc<dyn TaskQueue> = backend;
    let records = TaskRecords::new(Arc::clone(&store), config.retention);
    let processes: Arc<dyn ProcessControl> = Arc::new(OsProcesses::new());

    info!(
        db = %config.db_path.display(),
        workers = config.pool.workers,
        launcher = %config.executor.launcher,
        signature = %config.interrupt.signature,
        "Configuration loaded"
    );

    // ── Background tasks ─────────────────────────────────────────────────
    let _sweeper = spawn_sweeper(Arc::clone(&store), Arc::clone(&queue), config.retention);

    let executor = Arc::new(Executor::new(
        records.clone(),
        Arc::clone(&processes),
        config.executor.clone(),
    ));
    let (pool_handle, pool_shutdown) = spawn_worker_pool(Arc::clone(&queue), executor, config.pool);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let state = AppState::new(
        records,
        queue,
        processes,
        config.interrupt.clone(),
        config.executor.logs_dir.clone(),
    );
    let app = api::router(state, &config.cors_origins);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    // Workers finish the task they are running before stopping.
    pool_shutdown.store(true, Ordering::Relaxed);
    if let Err(e) = pool_handle.await {
        warn!(error = %e, "Worker pool did not stop cleanly");
    }

    info!("pipeline-orchestrator stopped");
    Ok(())
}

/// Console logging, plus a daily-rolling file when `PIPELINE_SERVICE_LOG_DIR`
/// is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("PIPELINE_SERVICE_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "pipeline-orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
        }
    };

    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
