//! Per-consumer binding to the sync status.
//!
//! A `SyncStatusView` is what a UI component holds while it is mounted: it
//! subscribes on [`mount`](SyncStatusView::mount), keeps the latest
//! snapshot, exposes the two sync actions, and unsubscribes when dropped.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    state::{notifier::Subscription, status::SyncStatus},
    sync::engine::{SyncEngine, SyncRequester},
};

/// Mounted consumer of sync status snapshots.
#[derive(Debug)]
pub struct SyncStatusView {
    /// Latest snapshot seen by this consumer.
    latest: Arc<RwLock<SyncStatus>>,
    /// Handle for the sync actions.
    requester: SyncRequester,
    /// Live registration; dropped on unmount.
    subscription: Subscription,
}

impl SyncStatusView {
    /// Mounts a consumer that only tracks the latest snapshot.
    pub fn mount(engine: &SyncEngine) -> Self {
        Self::mount_with(engine, |_| {})
    }

    /// Mounts a consumer and calls `on_change` with every new snapshot.
    ///
    /// `on_change` runs on the publishing thread after the view's own
    /// snapshot has been updated.
    pub fn mount_with<F>(engine: &SyncEngine, on_change: F) -> Self
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let latest = Arc::new(RwLock::new(SyncStatus::default()));
        let sink = latest.clone();
        let subscription = engine.on_status_change(move |status| {
            *sink.write() = status.clone();
            on_change(status);
        });

        // Read after subscribing so a snapshot published in between is not lost.
        let current = engine.status();
        {
            let mut latest = latest.write();
            if current.revision >= latest.revision {
                *latest = current;
            }
        }

        Self {
            latest,
            requester: engine.requester(),
            subscription,
        }
    }

    /// The latest snapshot delivered to this consumer.
    pub fn status(&self) -> SyncStatus {
        self.latest.read().clone()
    }

    /// Requests that all pending local changes be pushed.
    pub fn sync(&self) {
        self.requester.sync_all();
    }

    /// Requests that one entry be pushed. Unknown keys are a no-op.
    pub fn force_sync_item(&self, key: &str) {
        self.requester.force_sync_item(key);
    }

    /// Whether this view still receives snapshots.
    pub fn is_mounted(&self) -> bool {
        self.subscription.is_active()
    }

    /// Tears the consumer down. Equivalent to dropping it.
    pub fn unmount(self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use serde_json::json;

    use crate::{
        remote::MemoryRemote,
        state::status_view::SyncStatusView,
        store::LocalStore,
        sync::{config::SyncEngineConfig, engine::SyncEngine, entry::RemoteTable},
    };

    async fn engine() -> SyncEngine {
        SyncEngine::new(
            LocalStore::open_in_memory().await.unwrap(),
            Arc::new(MemoryRemote::new()),
            SyncEngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_mount_reads_current_status() {
        let engine = engine().await;
        engine
            .record_change(RemoteTable::Cards, "card-1", json!({}))
            .await
            .unwrap();

        let view = SyncStatusView::mount(&engine);
        assert_eq!(view.status().pending, 1);
        assert!(view.is_mounted());
        assert_eq!(engine.notifier().subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_view_tracks_updates_until_unmounted() {
        let engine = engine().await;
        let renders = Arc::new(AtomicUsize::new(0));
        let seen = renders.clone();
        let view = SyncStatusView::mount_with(&engine, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        engine
            .record_change(RemoteTable::Cards, "card-1", json!({}))
            .await
            .unwrap();
        assert_eq!(view.status().pending, 1);
        assert_eq!(renders.load(Ordering::SeqCst), 1);

        view.unmount();
        assert_eq!(engine.notifier().subscriber_count(), 0);

        engine
            .record_change(RemoteTable::Cards, "card-2", json!({}))
            .await
            .unwrap();
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_unmounts() {
        let engine = engine().await;
        {
            let _view = SyncStatusView::mount(&engine);
            assert_eq!(engine.notifier().subscriber_count(), 1);
        }
        assert_eq!(engine.notifier().subscriber_count(), 0);
    }
}
