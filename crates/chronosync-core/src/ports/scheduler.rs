//! Scheduler port (driven/secondary port)
//!
//! This module defines the interface for the deferred-task scheduler that
//! triggers queue drains. The backend (an OS job scheduler, a tokio task,
//! a thread-pool timer) lives in an adapter.
//!
//! ## Design Notes
//!
//! - Scheduling is fire-and-forget from the caller's perspective; the
//!   methods return immediately and the trigger runs concurrently.
//! - Firing is at-least-once: backends may invoke the same trigger twice
//!   or fire while a previous drain is still running. The dispatcher's
//!   single-flight guard makes this harmless, which is why that guard is
//!   mandatory rather than an optimization.

use std::time::Duration;

/// Port trait for triggering queue drains
pub trait ISyncScheduler: Send + Sync {
    /// Arranges a recurring drain trigger at most every `min_interval`
    ///
    /// When `require_network` is true, a firing with no connectivity is a
    /// no-op instead of a dispatch attempt.
    fn schedule_periodic(&self, min_interval: Duration, require_network: bool);

    /// Arranges a one-shot drain trigger as soon as possible
    ///
    /// Used after enqueuing an operation and on demand from callers.
    fn schedule_immediate(&self, require_network: bool);

    /// Cancels every pending and recurring trigger
    fn cancel_all(&self);
}
