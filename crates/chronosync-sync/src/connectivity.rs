//! Channel-based connectivity monitor
//!
//! Implements the [`IConnectivityMonitor`] port on top of a latest-value
//! channel. Platform reachability detection (a netlink listener, an OS
//! callback, a periodic probe) pushes transitions through a
//! [`ConnectivityHandle`]; consumers observe them through the port's
//! deduplicated stream.
//!
//! ## Flow
//!
//! ```text
//! platform callback ──► ConnectivityHandle::set_available (non-blocking)
//!                              │
//!                        watch channel (latest value, deduplicated)
//!                              │
//! dispatcher / scheduler ◄── ConnectivityStream::next (suspends consumer)
//! ```
//!
//! The handle side never blocks: a store into an atomic plus a watch-send
//! is all that happens on the platform's thread. Rapid flapping coalesces
//! to the latest state, which consumers must tolerate anyway.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::watch;
use tracing::debug;

use chronosync_core::ports::connectivity::{
    ConnectivityStatus, ConnectivityStream, IConnectivityMonitor,
};

/// Producer side of the monitor, handed to platform integration code
#[derive(Clone)]
pub struct ConnectivityHandle {
    available: Arc<AtomicBool>,
    tx: Arc<watch::Sender<ConnectivityStatus>>,
}

impl ConnectivityHandle {
    /// Reports the current reachability state
    ///
    /// Safe to call from any thread and never blocks. Repeated reports of
    /// the same state are absorbed here and produce no stream emission.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);

        let status = if available {
            ConnectivityStatus::Available
        } else {
            ConnectivityStatus::Unavailable
        };

        let changed = self.tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });

        if changed {
            debug!(?status, "Connectivity transition");
        }
    }
}

/// Consumer side of the monitor, implementing the connectivity port
pub struct ChannelConnectivityMonitor {
    available: Arc<AtomicBool>,
    tx: Arc<watch::Sender<ConnectivityStatus>>,
}

impl ChannelConnectivityMonitor {
    /// Creates a monitor/handle pair with the given initial state
    pub fn new(initially_available: bool) -> (Self, ConnectivityHandle) {
        let status = if initially_available {
            ConnectivityStatus::Available
        } else {
            ConnectivityStatus::Unavailable
        };

        let available = Arc::new(AtomicBool::new(initially_available));
        let (tx, _rx) = watch::channel(status);
        let tx = Arc::new(tx);

        let handle = ConnectivityHandle {
            available: Arc::clone(&available),
            tx: Arc::clone(&tx),
        };

        (Self { available, tx }, handle)
    }
}

impl IConnectivityMonitor for ChannelConnectivityMonitor {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn status_stream(&self) -> ConnectivityStream {
        ConnectivityStream::new(self.tx.subscribe())
    }
}
