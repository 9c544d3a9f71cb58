//! Chronosync Daemon - Background synchronization service
//!
//! This binary runs as a user service and handles:
//! - Periodic draining of the offline sync queue
//! - Connectivity probing and drain-on-reconnect
//! - Queue depth reporting for diagnostics
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon loads configuration, opens the SQLite state database, and
//! wires the offline service to a connectivity monitor, a dispatcher, and
//! a tokio-backed scheduler. It then runs two loops until shutdown: a
//! connectivity probe that feeds the monitor, and a status loop that logs
//! queue depth transitions. Shutdown is controlled by a
//! `CancellationToken` that is triggered on receipt of SIGTERM or SIGINT.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use chronosync_cache::{DatabasePool, SqliteStateRepository};
use chronosync_core::config::Config;
use chronosync_core::ports::{
    IConnectivityMonitor, IRemoteClient, IStateRepository, ISyncScheduler,
};
use chronosync_sync::connectivity::{ChannelConnectivityMonitor, ConnectivityHandle};
use chronosync_sync::dispatcher::SyncDispatcher;
use chronosync_sync::remote::LoopbackRemoteClient;
use chronosync_sync::scheduler::TokioSyncScheduler;
use chronosync_sync::service::OfflineActivityService;

/// How long a single connectivity probe may take before counting as down
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// DaemonService struct
// ============================================================================

/// Main daemon service that owns the offline engine's lifecycle
struct DaemonService {
    /// Application configuration loaded from YAML
    config: Config,
    /// SQLite state repository (activity cache + sync queue)
    repository: Arc<SqliteStateRepository>,
    /// The write/read orchestrator
    service: OfflineActivityService,
    /// Producer side of the connectivity monitor, fed by the probe loop
    handle: ConnectivityHandle,
    /// Token for signalling graceful shutdown to all async tasks
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Creates a new DaemonService
    ///
    /// Loads configuration, opens the database, and wires the engine:
    /// repository, connectivity monitor, dispatcher, scheduler, service.
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let pool = DatabasePool::new(&config.database.path)
            .await
            .context("Failed to open database")?;
        let repository = Arc::new(
            SqliteStateRepository::new(pool.pool().clone())
                .await
                .context("Failed to initialize state repository")?,
        );

        // Start pessimistic; the first probe flips the state and, through
        // the scheduler's connectivity watcher, triggers the startup drain
        // of any queue carried over from a previous run.
        let (monitor, handle) = ChannelConnectivityMonitor::new(false);
        let monitor: Arc<dyn IConnectivityMonitor> = Arc::new(monitor);

        // No remote transport is wired in this build; the loopback client
        // keeps the engine fully functional for local-only operation.
        let remote: Arc<dyn IRemoteClient> = Arc::new(LoopbackRemoteClient::new());

        let dispatcher = Arc::new(SyncDispatcher::new(
            Arc::clone(&repository) as Arc<dyn IStateRepository>,
            Arc::clone(&remote),
            Arc::clone(&monitor),
        ));

        let scheduler = TokioSyncScheduler::new(dispatcher, Arc::clone(&monitor));
        scheduler.watch_connectivity();
        let scheduler: Arc<dyn ISyncScheduler> = Arc::new(scheduler);

        let service = OfflineActivityService::new(
            Arc::clone(&repository) as Arc<dyn IStateRepository>,
            remote,
            monitor,
            scheduler,
        );

        Ok(Self {
            config,
            repository,
            service,
            handle,
            shutdown,
        })
    }

    /// Runs the daemon until a shutdown signal arrives
    async fn run(&self) -> Result<()> {
        self.service
            .init(Duration::from_secs(self.config.sync.poll_interval));

        tokio::join!(self.probe_loop(), self.status_loop());

        self.service.shutdown().await;
        Ok(())
    }

    // ========================================================================
    // Connectivity probing
    // ========================================================================

    /// Feeds the connectivity monitor from periodic reachability probes
    ///
    /// A probe is a TCP connect to the configured address with a short
    /// timeout. The handle deduplicates repeated identical results, so
    /// only real transitions reach the engine.
    async fn probe_loop(&self) {
        let address = self.config.sync.probe_address.clone();
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sync.probe_interval));

        info!(
            %address,
            interval_secs = self.config.sync.probe_interval,
            "Starting connectivity probe"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let reachable = probe(&address).await;
                    debug!(reachable, "Connectivity probe completed");
                    self.handle.set_available(reachable);
                }
            }
        }

        debug!("Probe loop terminated");
    }

    // ========================================================================
    // Queue depth reporting
    // ========================================================================

    /// Logs queue depth transitions and stuck-operation counts
    ///
    /// Purely observational; the drain itself is driven by the scheduler.
    async fn status_loop(&self) {
        let mut pending = self.service.pending_count_stream();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = pending.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let count = *pending.borrow_and_update();
                    match self.repository.exhausted_count().await {
                        Ok(stuck) if stuck > 0 => {
                            warn!(pending = count, stuck, "Sync queue depth changed");
                        }
                        Ok(_) => info!(pending = count, "Sync queue depth changed"),
                        Err(err) => {
                            warn!(pending = count, error = %err, "Sync queue depth changed");
                        }
                    }
                }
            }
        }

        debug!("Status loop terminated");
    }
}

/// Attempts a TCP connect to `address`, bounded by [`PROBE_TIMEOUT`]
async fn probe(address: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load_or_default(&config_path);

    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    info!(config_path = %config_path.display(), "Chronosync daemon starting (chronosyncd)");

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for error in &validation_errors {
            error!(%error, "Invalid configuration");
        }
        anyhow::bail!("Configuration is invalid ({} errors)", validation_errors.len());
    }

    let shutdown_token = CancellationToken::new();

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token.clone()).await?;

    let result = service.run().await;

    match &result {
        Ok(()) => info!("Chronosync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "Chronosync daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
