//! voxrelay gateway binary
//!
//! Serves caller WebSockets, runs the inactivity reaper and drains every
//! session on SIGINT/SIGTERM within the configured hard ceiling.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxrelay_core::{
    InactivityReaper, KnowledgeBase, KnowledgeBaseTool, SessionRegistry, ShutdownCoordinator,
};
use voxrelay_gateway::{
    api::{build_router, AppState},
    config::{Config, LogFormat},
    engine::WebSocketConnector,
    knowledge::{HttpKnowledgeBase, NullKnowledgeBase},
};

/// Extra time the watchdog allows past the drain ceiling
const WATCHDOG_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "voxrelay.toml", env = "VOXRELAY_CONFIG")]
    config: PathBuf,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_missing = !args.config.exists();
    let mut config = Config::load(Some(&args.config)).context("loading configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("validating configuration")?;

    init_tracing(config.server.log_format);
    tracing::info!("Starting voxrelay gateway...");
    if config_missing {
        tracing::warn!("Config file {} not found, using defaults", args.config.display());
    }
    tracing::info!(
        "Configuration: bind={}, engine={}, inactivity_timeout={}s, reaper_interval={}s",
        config.server.bind_addr(),
        config.engine.url,
        config.reaper.inactivity_timeout_seconds,
        config.reaper.interval_seconds
    );
    let config = Arc::new(config);

    let registry = Arc::new(SessionRegistry::new());
    let connector = Arc::new(WebSocketConnector::new(
        config.engine.url.clone(),
        config.engine.connect_timeout(),
    ));
    let knowledge: Arc<dyn KnowledgeBase> = match &config.knowledge.url {
        Some(url) => Arc::new(HttpKnowledgeBase::new(
            url.clone(),
            config.knowledge.top_k,
            config.knowledge.timeout(),
        )?),
        None => {
            tracing::warn!("No knowledge service configured, lookups will find nothing");
            Arc::new(NullKnowledgeBase)
        }
    };
    let tools = Arc::new(KnowledgeBaseTool::new(knowledge.clone()));

    let reaper = InactivityReaper::new(registry.clone(), config.reaper.clone()).spawn();

    let state = AppState::new(registry.clone(), connector, knowledge, config.clone()).with_tools(tools);
    let router = build_router(state);

    let bind_addr = config.server.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining sessions...");

    // Last resort if the drain itself wedges the runtime
    let ceiling = config.shutdown.hard_ceiling();
    std::thread::spawn(move || {
        std::thread::sleep(ceiling + WATCHDOG_GRACE);
        eprintln!("[WATCHDOG] Shutdown did not finish in time, forcing exit");
        std::process::exit(1);
    });

    let report = ShutdownCoordinator::new(registry.clone(), config.shutdown.clone())
        .drain()
        .await;
    reaper.stop().await;

    let _ = stop_tx.send(());
    match tokio::time::timeout(WATCHDOG_GRACE, server).await {
        Ok(Ok(Err(e))) => tracing::error!("HTTP server error: {}", e),
        Ok(Err(e)) => tracing::error!("HTTP server task failed: {}", e),
        Err(_) => tracing::warn!("HTTP server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    if report.ceiling_exceeded {
        tracing::error!(
            abandoned = report.abandoned.len(),
            "Shutdown exceeded its ceiling, exiting with failure"
        );
        std::process::exit(report.exit_code());
    }

    tracing::info!("voxrelay gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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
