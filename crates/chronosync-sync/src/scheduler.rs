//! Tokio-backed sync scheduler
//!
//! Implements the [`ISyncScheduler`] port with plain tokio tasks: a
//! periodic interval for background drains, one-shot tasks for immediate
//! requests, and a connectivity subscription that fires a drain the moment
//! the network comes back.
//!
//! ## At-least-once firing
//!
//! Triggers are deliberately fire-and-forget and may overlap: an immediate
//! request can land while the periodic tick is mid-drain, and the
//! connectivity watcher can fire on top of both. The dispatcher's
//! single-flight guard makes every overlap collapse into a no-op, so this
//! adapter never tries to serialize its own triggers.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chronosync_core::ports::{
    connectivity::ConnectivityStatus, IConnectivityMonitor, ISyncScheduler,
};

use crate::dispatcher::SyncDispatcher;

/// Triggers queue drains from timers, demand, and connectivity transitions
pub struct TokioSyncScheduler {
    dispatcher: Arc<SyncDispatcher>,
    monitor: Arc<dyn IConnectivityMonitor>,
    shutdown: CancellationToken,
}

impl TokioSyncScheduler {
    /// Creates a new scheduler driving the given dispatcher
    pub fn new(dispatcher: Arc<SyncDispatcher>, monitor: Arc<dyn IConnectivityMonitor>) -> Self {
        Self {
            dispatcher,
            monitor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns the connectivity-regained trigger
    ///
    /// Subscribes to the monitor's transition stream and requests a drain
    /// on every `Available` emission (including the initial one when the
    /// process starts online, which flushes a queue carried over from a
    /// previous run).
    pub fn watch_connectivity(&self) {
        let mut stream = self.monitor.status_stream();
        let dispatcher = Arc::clone(&self.dispatcher);
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    status = stream.next() => match status {
                        Some(ConnectivityStatus::Available) => {
                            info!("Connectivity available, triggering drain");
                            run_dispatch(&dispatcher).await;
                        }
                        Some(ConnectivityStatus::Unavailable) => {
                            debug!("Connectivity lost");
                        }
                        None => break,
                    },
                }
            }
        });
    }
}

impl ISyncScheduler for TokioSyncScheduler {
    fn schedule_periodic(&self, min_interval: Duration, require_network: bool) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let monitor = Arc::clone(&self.monitor);
        let token = self.shutdown.clone();

        info!(
            interval_secs = min_interval.as_secs(),
            require_network, "Scheduling periodic drain"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(min_interval);
            // The immediate first tick duplicates the startup drain the
            // connectivity watcher already performs; skip it.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if require_network && !monitor.is_available() {
                            debug!("Periodic drain skipped: network unavailable");
                            continue;
                        }
                        run_dispatch(&dispatcher).await;
                    }
                }
            }
        });
    }

    fn schedule_immediate(&self, require_network: bool) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let monitor = Arc::clone(&self.monitor);
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            if token.is_cancelled() {
                return;
            }
            if require_network && !monitor.is_available() {
                debug!("Immediate drain skipped: network unavailable");
                return;
            }
            run_dispatch(&dispatcher).await;
        });
    }

    fn cancel_all(&self) {
        info!("Cancelling all scheduled drains");
        self.shutdown.cancel();
    }
}

async fn run_dispatch(dispatcher: &SyncDispatcher) {
    match dispatcher.dispatch().await {
        Ok(outcome) => debug!(?outcome, "Dispatch finished"),
        Err(err) => warn!(error = %err, "Dispatch failed"),
    }
}
