//! Per-ongoing-activity elapsed timers
//!
//! While an activity is ongoing, callers often display a live elapsed
//! duration. The [`ElapsedTimer`] publishes that duration on a watch
//! channel, ticking on a fixed interval, and is cancelled through a
//! [`CancellationToken`] the moment the record ends, is superseded, or the
//! owning service shuts down. A timer must never keep ticking against a
//! stale record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Publishes the elapsed time of one ongoing activity
pub struct ElapsedTimer {
    token: CancellationToken,
    rx: watch::Receiver<chrono::Duration>,
}

impl ElapsedTimer {
    /// Starts a timer for an activity that began at `start_time`
    ///
    /// The timer ticks every `tick` and stops on cancellation or when the
    /// parent token is cancelled.
    pub fn start(start_time: DateTime<Utc>, tick: Duration, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let (tx, rx) = watch::channel(Utc::now() - start_time);

        let task_token = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!("Elapsed timer cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        if tx.send(Utc::now() - start_time).is_err() {
                            // No subscribers left and the handle is gone
                            break;
                        }
                    }
                }
            }
        });

        Self { token, rx }
    }

    /// Subscribes to the published elapsed duration
    pub fn elapsed(&self) -> watch::Receiver<chrono::Duration> {
        self.rx.clone()
    }

    /// Stops the timer
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for ElapsedTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
