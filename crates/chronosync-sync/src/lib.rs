//! Chronosync Sync - Offline synchronization engine
//!
//! Provides:
//! - Local-first writes with optimistic remote attempts
//! - A durable queue drain with tiered backoff and a single-flight guard
//! - Connectivity-aware dispatch triggers
//! - Tri-state local-first reads
//!
//! ## Modules
//!
//! - [`dispatcher`] - Drains the sync queue against the remote client
//! - [`service`] - The write/read orchestrator exposed to callers
//! - [`connectivity`] - Channel-based connectivity monitor implementation
//! - [`scheduler`] - Tokio-backed scheduler adapter and connectivity trigger
//! - [`timer`] - Per-ongoing-activity elapsed timers
//! - [`remote`] - In-process loopback remote client

pub mod connectivity;
pub mod dispatcher;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod timer;

use thiserror::Error;

use chronosync_core::domain::errors::DomainError;
use chronosync_core::ports::RemoteError;

/// Errors surfaced by the orchestrator
///
/// Domain errors (invariant violations, unknown records) are non-retryable
/// and reported synchronously; storage errors mean the local write itself
/// failed. Remote failures never surface from a write call - the write
/// path absorbs them by enqueuing the operation for replay - but cache
/// warm-up reads propagate them.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A non-retryable domain rule rejected the write
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The local store could not complete the write
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// A remote read failed (cache warm-up only)
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}
