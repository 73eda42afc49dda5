//! Periodic sweep driver for long-running processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use super::sweep::Sweeper;
use crate::error::Result;
use crate::store::Store;

/// Shortest period the loop will tick at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Runs the sweeper every `interval` until shut down.
pub struct SweepLoop<S: Store> {
    sweeper: Sweeper<S>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl<S: Store> Clone for SweepLoop<S> {
    fn clone(&self) -> Self {
        Self {
            sweeper: self.sweeper.clone(),
            interval: self.interval,
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<S: Store> SweepLoop<S> {
    /// `interval` is raised to [`MIN_INTERVAL`] if shorter.
    pub fn new(sweeper: Sweeper<S>, interval: Duration) -> Self {
        Self {
            sweeper,
            interval: interval.max(MIN_INTERVAL),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the loop to stop. A sweep in progress finishes first.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Sweep once immediately, then on every tick until shutdown. A failed
    /// sweep is logged and retried on the next tick.
    pub async fn run(&self) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "sweep loop started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("sweep loop shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sweeper.run().await {
                error!("sweep failed: {e}");
            }
        }
    }
}
