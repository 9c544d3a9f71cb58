//! Connectivity monitor port (driven/secondary port)
//!
//! This module defines the interface for observing network reachability.
//! The platform-specific detection mechanism (netlink, a reachability
//! callback, a periodic probe) lives in an adapter; the engine consumes a
//! point-in-time check plus a deduplicated stream of transitions.
//!
//! ## Design Notes
//!
//! - The stream blocks the *consumer's* iteration, never the monitor's
//!   internal callback registration: adapters funnel transitions through
//!   a latest-value channel so the platform callback only performs a
//!   non-blocking store.
//! - Rapid flapping may coalesce to the latest state; consumers only need
//!   transitions, not the full flap history.

use tokio::sync::watch;

// ============================================================================
// ConnectivityStatus
// ============================================================================

/// Reachability of the remote store at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    /// The remote store is believed reachable
    Available,
    /// The remote store is believed unreachable
    Unavailable,
}

impl ConnectivityStatus {
    /// Returns true for [`ConnectivityStatus::Available`]
    pub fn is_available(&self) -> bool {
        matches!(self, ConnectivityStatus::Available)
    }
}

// ============================================================================
// ConnectivityStream
// ============================================================================

/// A deduplicated stream of connectivity transitions
///
/// The first item reflects the state at subscription time; subsequent
/// items are emitted only when the state actually changes (no repeated
/// identical consecutive values).
pub struct ConnectivityStream {
    rx: watch::Receiver<ConnectivityStatus>,
    last_seen: Option<ConnectivityStatus>,
}

impl ConnectivityStream {
    /// Wraps a watch receiver into a deduplicated stream
    pub fn new(rx: watch::Receiver<ConnectivityStatus>) -> Self {
        Self {
            rx,
            last_seen: None,
        }
    }

    /// Waits for the next status
    ///
    /// Returns `None` when the monitor has been dropped.
    pub async fn next(&mut self) -> Option<ConnectivityStatus> {
        loop {
            let current = *self.rx.borrow_and_update();
            match self.last_seen {
                // Initial emission: whatever the state is right now
                None => {
                    self.last_seen = Some(current);
                    return Some(current);
                }
                // Suppress duplicates; only a real transition is yielded
                Some(seen) if seen != current => {
                    self.last_seen = Some(current);
                    return Some(current);
                }
                Some(_) => {
                    if self.rx.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

// ============================================================================
// IConnectivityMonitor trait
// ============================================================================

/// Port trait for network reachability observation
pub trait IConnectivityMonitor: Send + Sync {
    /// Returns the reachability state at this instant
    fn is_available(&self) -> bool;

    /// Subscribes to the deduplicated stream of transitions
    ///
    /// The stream's first item is the state at subscription time.
    fn status_stream(&self) -> ConnectivityStream;
}
