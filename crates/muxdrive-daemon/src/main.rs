//! MuxDrive daemon
//!
//! Boots the document store, reconciles startup state (in-flight
//! transfers demote to paused, every enabled task gets a fresh
//! `next_run_at`), wires the engine components together, and runs the
//! gateway and scheduler until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use muxdrive_audit::AuditLog;
use muxdrive_core::ports::DriveBackend;
use muxdrive_drive::HttpDriveBackend;
use muxdrive_gateway::{ensure_admin_key, CommandContext, GatewayService};
use muxdrive_router::{NamespaceService, TenantRegistry};
use muxdrive_scheduler::Scheduler;
use muxdrive_store::Store;
use muxdrive_sync::SyncRunner;
use muxdrive_transfer::TransferEngine;

/// Federated cloud-drive sync daemon.
#[derive(Debug, Parser)]
#[command(name = "muxdrived", version, about)]
struct Args {
    /// Application data directory holding all JSON documents.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. `info` or `muxdrive=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local/share/muxdrive")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    info!(data_dir = %data_dir.display(), "Starting muxdrived");

    let store = Store::open(&data_dir)
        .await
        .context("Failed to open document store")?;
    let config = store.config.read().await.context("Failed to read config")?;

    if let Some(key) = ensure_admin_key(&store).await? {
        // Shown once so the operator can copy it; afterwards it is only
        // retrievable through the admin `get_admin_key` command.
        info!(api_key = %key, "Admin API key generated");
    }

    let backend: Arc<dyn DriveBackend> = Arc::new(
        HttpDriveBackend::new(&config.backend).context("Failed to build drive backend")?,
    );
    let registry = Arc::new(TenantRegistry::new(Arc::clone(&store), backend));
    let namespace = Arc::new(NamespaceService::new(Arc::clone(&registry)));
    let engine = TransferEngine::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        config.transfer.clone(),
    );

    let shutdown = CancellationToken::new();
    let runner = SyncRunner::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&engine),
        shutdown.clone(),
    );
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&runner) as _,
    ));

    let log_dir = config
        .logging
        .directory
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("api_logs"));
    let audit = Arc::new(AuditLog::new(log_dir, config.logging.clamped_max_mb()));

    // Startup reconcile: nothing resumes silently after a restart.
    let demoted = engine
        .reconcile_on_startup()
        .await
        .context("Transfer reconcile failed")?;
    if demoted > 0 {
        info!(count = demoted, "Paused transfers await explicit resume");
    }
    scheduler
        .reconcile()
        .await
        .context("Scheduler reconcile failed")?;

    tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));
    {
        let scheduler = Arc::clone(&scheduler);
        let token = shutdown.clone();
        tokio::spawn(async move { scheduler.run(token).await });
    }

    let ctx = Arc::new(CommandContext {
        store: Arc::clone(&store),
        registry,
        namespace,
        engine,
        runner,
        audit,
    });
    let gateway = GatewayService::new(ctx, Arc::clone(&store));
    if config.service.autostart {
        gateway.start().await.context("Failed to start API gateway")?;
    } else {
        info!("Gateway autostart disabled; use the start_service command");
    }

    wait_for_shutdown().await;
    info!("Shutdown signal received, draining");
    let _ = gateway.stop().await;
    shutdown.cancel();
    // Give in-flight block writes a moment to reach their next boundary.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("muxdrived stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable, relying on ctrl-c");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
