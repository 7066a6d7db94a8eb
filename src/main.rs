use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use devicelink::api::{self, AppState};
use devicelink::backup::{BackupManager, FsMirror, JobStatus, JobStore, Scheduler};
use devicelink::connection::{
    ConnectionHistory, Device, DeviceDirectory, HttpDeviceApi, PathResolver, SystemPathProbe,
};
use devicelink::overlay::{OverlayManager, SystemOverlayClient};
use devicelink::shares::{ShareRegistry, SmbClientBackend};
use devicelink::storage::{keys, Storage};
use devicelink::utils::{self, LogBuffer};
use devicelink::web;

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();

    let config = Arc::new(utils::config::load_config()?);

    info!("Starting DeviceLink v{}", env!("CARGO_PKG_VERSION"));
    info!("CPU cores available: {}", num_cpus::get());

    let storage = Storage::new(&config.database_url).await?;
    storage.run_migrations().await?;

    // Overlay client
    let overlay = OverlayManager::new(
        Arc::new(SystemOverlayClient::new(config.overlay.clone())),
        config.overlay.monitor_interval,
    );
    match overlay.refresh().await {
        Ok(state) if state.monitoring => {
            info!("Resuming overlay health monitor");
            if let Err(e) = overlay.start_monitor().await {
                warn!("Failed to resume overlay monitor: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Initial overlay refresh failed: {}", e),
    }

    // Device directory and connection paths
    let history = ConnectionHistory::new(config.connection.history_limit);
    history.restore(storage.load_recent_connections().await?);
    let device_api = HttpDeviceApi::new(config.connection.api_port, config.connection.probe_timeout)?;
    let devices = DeviceDirectory::new(
        Arc::new(device_api),
        history,
        config.connection.known_hosts.clone(),
    );
    if let Some(device) = storage.get::<Device>(keys::LAST_DEVICE).await? {
        info!("Restoring last device {}", device.id);
        if let Err(e) = devices.set_device(device) {
            warn!("Ignoring stored device: {}", e);
        }
    }
    let resolver = PathResolver::new(Arc::new(SystemPathProbe::new(config.connection.clone())));

    // Shares
    let shares = ShareRegistry::new(
        Arc::new(SmbClientBackend::new(config.shares.clone())),
        Arc::new(storage.clone()),
    );
    shares.restore(storage.load_pinned_shares().await?);

    // Backup engine. Runs do not survive a restart.
    let mut jobs = storage.load_jobs().await?;
    for job in jobs.iter_mut().filter(|job| job.status.is_active()) {
        info!("Job {} was {:?} at shutdown, marking stopped", job.id, job.status);
        job.status = JobStatus::Stopped;
        storage.save_job(job).await?;
    }
    let backups = BackupManager::new(
        config.backup.clone(),
        shares.clone(),
        Arc::new(FsMirror::new()),
        Arc::new(storage.clone()),
        LogBuffer::new(1000),
    );
    backups.restore(jobs);
    let scheduler = Scheduler::new(backups.clone(), config.backup.scheduler_tick).spawn();

    let state = AppState {
        config: config.clone(),
        overlay: overlay.clone(),
        devices,
        resolver,
        shares,
        backups: backups.clone(),
        storage,
    };

    let app = Router::new()
        .nest("/api", api::routes())
        .nest("/ws", web::websocket::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.abort();
    backups.stop_all().await;
    overlay.halt_monitor();

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
