//! Daemon mode — wires the health monitor, process supervisor, and status
//! API together for one service.
//!
//! 1. Loads and validates the service definition (fails fast on error)
//! 2. Starts the process supervisor
//! 3. Starts the health monitor with the restart enforcer
//! 4. Serves the status API until a shutdown signal arrives

use std::net::SocketAddr;
use std::path::Path;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use dinox_api::ApiState;
use dinox_core::ServiceConfig;
use dinox_health::{HealthMonitor, HttpProber, RestartEnforcer, StopFlag};

use crate::process::ProcessSupervisor;

/// Run the supervisor for the service described by `config_path`.
pub async fn run_daemon(config_path: &Path, status_addr: SocketAddr) -> anyhow::Result<()> {
    let config = ServiceConfig::from_file(config_path)?;
    config.validate()?;
    let spec = config.health_check()?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let service = config.service.name.clone();

    info!(%service, restart = %config.service.restart, "dinox supervisor starting");

    // ── Declared surface (informational) ─────────────────────────
    for port in config.ports()? {
        info!(%service, %port, "published port");
    }
    for volume in config.volumes()? {
        let source = base_dir.join(&volume.host);
        if source.exists() {
            debug!(%service, %volume, "volume mount");
        } else {
            warn!(%service, %volume, source = ?source, "volume source does not exist");
        }
    }

    // ── Shared state ─────────────────────────────────────────────
    let stop = StopFlag::new();
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Process supervisor ───────────────────────────────────────
    let supervisor = ProcessSupervisor::from_config(&config, base_dir, stop.clone());
    let (supervisor_done_tx, mut supervisor_done) = watch::channel(false);
    let supervisor_shutdown = shutdown_rx.clone();
    let supervisor_handle = tokio::spawn(async move {
        let result = supervisor.run(commands_rx, supervisor_shutdown).await;
        let _ = supervisor_done_tx.send(true);
        result
    });

    // ── Health monitor ───────────────────────────────────────────
    let enforcer = RestartEnforcer::new(config.service.restart, stop.clone(), commands_tx.clone());
    let monitor = HealthMonitor::new(spec.clone(), HttpProber::from_spec(&spec), enforcer);
    let status = monitor.status();
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));

    // ── Status API ───────────────────────────────────────────────
    let router = dinox_api::build_router(ApiState {
        service: service.clone(),
        status,
        stop,
        commands: commands_tx,
    });

    let listener = tokio::net::TcpListener::bind(status_addr).await?;
    info!(addr = %status_addr, "status API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => info!("shutdown signal received"),
                // A supervisor that failed at startup takes the daemon down.
                _ = supervisor_done.changed() => warn!("process supervisor exited"),
            }
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(e) = monitor_handle.await {
        error!(error = %e, "health monitor task failed");
    }
    let stats = supervisor_handle.await??;

    info!(%service, starts = stats.starts, restarts = stats.restarts, "dinox supervisor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
