//! warden-scan - Scan service entry point
//!
//! Background half of the pipeline: ingests detector findings, schedules
//! cooldown-aware rescans, and runs the worker fleet that re-checks
//! flagged entities.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden_common::config::{resolve_root_folder, WardenToml};
use warden_common::db::init::init_database;
use warden_common::events::EventBus;
use warden_common::params::PolicyCache;
use warden_scan::detector::{Detector, NullDetector, RemoteDetector};
use warden_scan::{build_router, scheduler, worker, AppState};

/// Command-line arguments for warden-scan
#[derive(Parser, Debug)]
#[command(name = "warden-scan")]
#[command(about = "Scan service for the Warden moderation pipeline")]
#[command(version)]
struct Args {
    /// Port to listen on (default from warden.toml, then 7352)
    #[arg(short, long, env = "WARDEN_SCAN_PORT")]
    port: Option<u16>,

    /// Root folder holding warden.db and warden.toml
    #[arg(short, long)]
    root_folder: Option<String>,

    /// Log filter override (e.g. "warden_scan=debug")
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), "WARDEN_ROOT_FOLDER")
        .context("Failed to resolve root folder")?;
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;
    let config = WardenToml::load(&root_folder);

    // Filter priority: --log-level, then RUST_LOG, then warden.toml
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "Starting Warden Scan (warden-scan) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!("Root folder: {}", root_folder.display());

    let db_path = config.database_path(&root_folder);
    info!("Database path: {}", db_path.display());
    let pool = init_database(&db_path).await.context("Failed to initialize database")?;
    info!("✓ Database ready");

    let event_bus = EventBus::new(1000);
    let policy_cache = Arc::new(PolicyCache::new(pool.clone()));
    let policy = policy_cache.get().await.context("Failed to load policy settings")?;

    let detector: Arc<dyn Detector> = match &config.scan.detector_endpoint {
        Some(endpoint) => {
            info!("Detector endpoint: {}", endpoint);
            Arc::new(RemoteDetector::new(
                endpoint.clone(),
                config.scan.detector_api_key.clone(),
                Duration::from_secs(policy.detector_timeout_secs.max(1) as u64),
            ))
        }
        None => {
            info!("No detector endpoint configured, rescans record no new findings");
            Arc::new(NullDetector)
        }
    };

    let shutdown = CancellationToken::new();
    let mut tasks = scheduler::spawn(
        pool.clone(),
        policy_cache.clone(),
        event_bus.clone(),
        shutdown.clone(),
    );
    tasks.extend(worker::spawn_fleet(
        pool.clone(),
        policy_cache.clone(),
        event_bus.clone(),
        detector,
        policy.scan_worker_count,
        shutdown.clone(),
    ));
    info!("✓ Scheduler and {} worker(s) started", policy.scan_worker_count.max(1));

    let state = AppState::new(pool, event_bus);
    let app = build_router(state);

    let port = args.port.unwrap_or(config.scan.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("warden-scan listening on http://{}", addr);
    info!("Health check: http://127.0.0.1:{}/health", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop the background fleet before reporting shutdown
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
