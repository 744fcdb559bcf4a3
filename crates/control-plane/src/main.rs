// Runloop API server
// Decision: API, scheduler and run supervisor share one process
// Decision: On SIGINT/SIGTERM stop the scheduler, drain runs, then stop HTTP

use anyhow::{Context, Result};
use runloop_control_plane::config::DEFAULT_LOG_FILTER;
use runloop_control_plane::dev_driver::EchoDriver;
use runloop_control_plane::{app, AppState, ServerConfig};
use runloop_core::{LlmDriver, PriceTable, ToolRegistry};
use runloop_openai::OpenAiDriver;
use runloop_storage::StorageBackend;
use runloop_worker::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Grace period for open connections (WebSockets) after runs are drained
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "runloop-control-plane starting...");
    let config = ServerConfig::from_env();

    // Storage: PostgreSQL when configured, in-memory dev mode otherwise
    let storage = match &config.database_url {
        Some(url) => {
            let storage = StorageBackend::postgres(url, config.database_max_connections)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Connected to PostgreSQL");
            storage
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage (data is lost on restart)");
            StorageBackend::in_memory()
        }
    };

    let driver: Arc<dyn LlmDriver> = match &config.openai_api_key {
        Some(key) => {
            let driver = match &config.openai_base_url {
                Some(url) => OpenAiDriver::with_base_url(key.clone(), url.clone()),
                None => OpenAiDriver::new(key.clone()),
            };
            tracing::info!(api_url = driver.api_url(), "Using OpenAI driver");
            Arc::new(driver)
        }
        None => {
            tracing::warn!("OPENAI_API_KEY not set, using echo driver");
            Arc::new(EchoDriver)
        }
    };

    let mut prices = PriceTable::with_defaults();
    if let Some(path) = &config.price_table_path {
        let custom = PriceTable::from_file(path)
            .with_context(|| format!("Failed to load price table {}", path.display()))?;
        prices = prices.merge(custom);
        tracing::info!(path = %path.display(), "Price table loaded");
    }

    let tools = ToolRegistry::with_defaults().context("Failed to register built-in tools")?;
    tracing::info!(tools = ?tools.tool_names(), "Tools registered");

    let state = AppState::build(&storage, driver, prices, tools, &config.runtime);

    // Runs left behind by a previous process are not resumed
    let interrupted = state
        .machine()
        .fail_interrupted()
        .await
        .context("Failed to recover interrupted runs")?;
    if !interrupted.is_empty() {
        tracing::warn!(count = interrupted.len(), "Interrupted runs marked failed");
    }

    let scheduler = Scheduler::new(state.schedules.clone(), state.supervisor.clone())
        .with_tick_interval(config.runtime.scheduler_tick)
        .spawn();

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    tracing::info!("HTTP server listening on {}", config.bind_addr);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = axum::serve(listener, app(state.clone(), config.cors_allowed_origins.clone()))
        .with_graceful_shutdown(async move {
            let _ = stop_rx.changed().await;
        });
    let server = tokio::spawn(async move { server.await });

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    scheduler.shutdown().await;
    let report = state
        .supervisor
        .shutdown(config.runtime.shutdown_timeout)
        .await;
    tracing::info!(
        drained = report.drained,
        cancelled = report.cancelled,
        "Runs drained"
    );

    let _ = stop_tx.send(true);
    match tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, server).await {
        Ok(Ok(result)) => result.context("Server error")?,
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server task failed"),
        Err(_) => tracing::warn!("Open connections did not close in time"),
    }

    tracing::info!("runloop-control-plane stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
