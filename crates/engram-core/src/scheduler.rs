//! Cancellable schedule for the background consolidation job

use crate::consolidation::ConsolidationEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodic driver for the consolidation engine
///
/// Each run is awaited inline in the schedule loop, so runs never overlap.
/// Shutdown cancels the schedule; an in-flight run finishes its current
/// item-level step, and mutations already committed are not rolled back.
pub struct ConsolidationScheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConsolidationScheduler {
    /// Start the schedule with the given interval
    pub fn start(engine: Arc<ConsolidationEngine>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the schedule
            // starts one full interval after startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("consolidation schedule cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let stats = engine.run().await;
                        debug!(merged = stats.duplicates_merged, "scheduled consolidation run finished");
                    }
                }
            }
        });

        info!(interval_secs = interval.as_secs(), "consolidation schedule started");
        Self { cancel, handle }
    }

    /// Whether the schedule has been shut down
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the schedule and wait for the loop to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        // Join failure here means the loop panicked; there is nothing left
        // to clean up either way.
        let _ = self.handle.await;
        info!("consolidation schedule stopped");
    }
}
