//! Periodic driver that refreshes feeds whose update interval has elapsed.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};

use super::SyncEngine;

/// Running scheduler. Dropping the handle leaves the task running; call
/// [`SchedulerHandle::stop`] to shut it down.
pub struct SchedulerHandle {
    cancel_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the loop to exit. Syncs already started
    /// finish on their own tasks.
    pub async fn stop(self) -> Result<(), JoinError> {
        let _ = self.cancel_tx.send(());
        self.join.await
    }
}

/// Every `interval`, refresh the feeds due at that moment. The first pass
/// runs immediately; ticks missed during a long pass are skipped.
pub fn spawn_scheduler(engine: SyncEngine, interval: Duration) -> SchedulerHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel_rx.recv() => break,
                        outcome = engine.refresh_due(Utc::now().timestamp()) => match outcome {
                            Ok(summary) if summary.total_feeds > 0 => {
                                tracing::debug!(
                                    feeds = summary.total_feeds,
                                    new = summary.total_new_articles,
                                    "Scheduled refresh pass done"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "Failed to load due feeds"),
                        },
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
    });

    SchedulerHandle { cancel_tx, join }
}
