use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use system_restore::api;
use system_restore::backup::{BackupManager, JobKind};
use system_restore::utils;
use system_restore::web;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        // A missing .env is the normal case
        if !e.not_found() {
            eprintln!("Ignoring unreadable .env: {}", e);
        }
    }

    utils::logging::init_tracing();

    let config = utils::config::load_config()?;

    info!("Starting System Restore v{}", env!("CARGO_PKG_VERSION"));
    info!("Backups go to {}", config.backup_dir.display());
    info!("Test restores go under {}", config.restore_base_dir.display());

    let port = config.port;
    let backup_manager = BackupManager::new(config);

    match backup_manager.list_backups() {
        Ok(backups) => info!("Found {} existing backups", backups.len()),
        Err(e) => warn!("Could not list existing backups: {}", e),
    }

    let app = Router::new()
        .nest("/api", api::routes())
        .nest("/ws", web::websocket::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(backup_manager.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Give running jobs a moment to reach a checkpoint and clean up
    for kind in [JobKind::Backup, JobKind::Restore] {
        if backup_manager.cancel(kind).is_ok() {
            info!("Cancelled running {} on shutdown", kind);
        }
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while backup_manager.is_busy() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
