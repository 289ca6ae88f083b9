//! warden-review - Review service entry point
//!
//! Reviewer-facing HTTP service: serves review targets, records votes,
//! accepts manual recheck requests, and reports worker fleet health.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden_common::audit::ActivityLogger;
use warden_common::config::{resolve_root_folder, WardenToml};
use warden_common::db::init::init_database;
use warden_common::events::EventBus;
use warden_common::params::PolicyCache;
use warden_review::{build_router, AppState};

/// Command-line arguments for warden-review
#[derive(Parser, Debug)]
#[command(name = "warden-review")]
#[command(about = "Review service for the Warden moderation pipeline")]
#[command(version)]
struct Args {
    /// Port to listen on (default from warden.toml, then 7351)
    #[arg(short, long, env = "WARDEN_REVIEW_PORT")]
    port: Option<u16>,

    /// Root folder holding warden.db and warden.toml
    #[arg(short, long)]
    root_folder: Option<String>,

    /// Log filter override (e.g. "warden_review=debug")
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
        "Starting Warden Review (warden-review) v{} [{}] built {} ({})",
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

    let (activity, activity_writer) =
        ActivityLogger::spawn(pool.clone(), policy.db_max_lock_wait_ms);

    let state = AppState::new(pool, event_bus, policy_cache, activity.clone());
    let app = build_router(state);

    let port = args.port.unwrap_or(config.review.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("warden-review listening on http://{}", addr);
    info!("Health check: http://127.0.0.1:{}/health", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drop the last logger handle so the writer drains and exits
    drop(activity);
    let _ = activity_writer.await;

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
