//! Per-feed table of syncs running in this process.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use super::{RefreshError, SyncPhase, SyncResult};

pub(crate) type SyncFuture = Shared<BoxFuture<'static, Result<SyncResult, RefreshError>>>;

struct InflightEntry {
    future: SyncFuture,
    phase: watch::Receiver<SyncPhase>,
}

/// At most one entry per feed. Entries are removed when the sync's
/// [`PhaseTracker`] is dropped, i.e. when the sync task ends.
#[derive(Default)]
pub(crate) struct InflightSyncs {
    entries: Mutex<HashMap<i64, InflightEntry>>,
}

impl InflightSyncs {
    /// Join the sync running for `feed_id`, or start one.
    ///
    /// `start` runs under the table lock and must hand the tracker to a
    /// spawned task rather than drop it. The bool is `true` when this call
    /// started the sync.
    pub(crate) fn join_or_start<F>(self: &Arc<Self>, feed_id: i64, start: F) -> (SyncFuture, bool)
    where
        F: FnOnce(PhaseTracker) -> BoxFuture<'static, Result<SyncResult, RefreshError>>,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(&feed_id) {
            return (entry.future.clone(), false);
        }

        let (tx, rx) = watch::channel(SyncPhase::Idle);
        let tracker = PhaseTracker {
            feed_id,
            phase: tx,
            table: Arc::clone(self),
        };
        let future = start(tracker).shared();
        entries.insert(
            feed_id,
            InflightEntry {
                future: future.clone(),
                phase: rx,
            },
        );
        (future, true)
    }

    pub(crate) fn phase(&self, feed_id: i64) -> Option<SyncPhase> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&feed_id).map(|entry| *entry.phase.borrow())
    }

    pub(crate) fn watch(&self, feed_id: i64) -> Option<watch::Receiver<SyncPhase>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&feed_id).map(|entry| entry.phase.clone())
    }

    fn remove(&self, feed_id: i64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&feed_id);
    }
}

/// Owned by the sync task; publishes its phase and frees the table slot on drop.
pub(crate) struct PhaseTracker {
    feed_id: i64,
    phase: watch::Sender<SyncPhase>,
    table: Arc<InflightSyncs>,
}

impl PhaseTracker {
    pub(crate) fn set(&self, phase: SyncPhase) {
        tracing::trace!(feed_id = self.feed_id, phase = ?phase, "Sync phase");
        self.phase.send_replace(phase);
    }
}

impl Drop for PhaseTracker {
    fn drop(&mut self) {
        self.table.remove(self.feed_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_result(feed_id: i64) -> Result<SyncResult, RefreshError> {
        Ok(SyncResult::success(feed_id, 1, 1, 0))
    }

    #[tokio::test]
    async fn test_second_caller_joins_running_sync() {
        let table = Arc::new(InflightSyncs::default());
        let starts = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let counter = starts.clone();
        let (first, started) = table.join_or_start(7, move |tracker| {
            counter.fetch_add(1, Ordering::SeqCst);
            let handle = tokio::spawn(async move {
                tracker.set(SyncPhase::Fetching);
                let _ = release_rx.await;
                drop(tracker);
                ok_result(7)
            });
            async move { handle.await.unwrap_or_else(|e| Err(RefreshError::Aborted(e.to_string()))) }.boxed()
        });
        assert!(started);

        let counter = starts.clone();
        let (second, started) = table.join_or_start(7, move |_tracker| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { ok_result(7) }.boxed()
        });
        assert!(!started);

        tokio::task::yield_now().await;
        let _ = release_tx.send(());
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a, b);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_removed_when_tracker_dropped() {
        let table = Arc::new(InflightSyncs::default());
        let (fut, _) = table.join_or_start(1, |tracker| {
            let handle = tokio::spawn(async move {
                tracker.set(SyncPhase::Persisting);
                ok_result(1)
            });
            async move { handle.await.unwrap_or_else(|e| Err(RefreshError::Aborted(e.to_string()))) }.boxed()
        });

        fut.await.unwrap();
        // The task has finished, so its tracker is gone
        assert_eq!(table.phase(1), None);
        assert!(table.watch(1).is_none());
    }
}
