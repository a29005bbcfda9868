//! Sync status notifier with an observer registry and a broadcast channel.
//!
//! The notifier owns the current [`SyncStatus`] snapshot. Only the sync
//! engine publishes; consumers read the snapshot and register callbacks
//! through [`StatusNotifier::on_status_change`], which hands back a
//! [`Subscription`] that removes the callback when dropped.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt::{Debug, Formatter, Result as FmtResult},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    parking_lot::{Mutex, ReentrantMutex, RwLock},
    tokio::sync::broadcast::{Receiver, Sender, channel},
    tracing::{error, trace},
};

use crate::state::status::SyncStatus;

/// Capacity of the broadcast channel handed out by [`StatusNotifier::subscribe`].
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Callback invoked with every new snapshot.
pub type StatusCallback = Box<dyn Fn(&SyncStatus) + Send + Sync>;

struct Registration {
    id: u64,
    callback: StatusCallback,
    /// Held while the callback runs, so `unsubscribe` waits out an in-flight delivery.
    active: ReentrantMutex<Cell<bool>>,
}

impl Registration {
    /// Runs the callback if still registered. A panicking callback is
    /// logged and does not affect delivery to other subscribers.
    fn deliver(&self, status: &SyncStatus) {
        let active = self.active.lock();
        if active.get() && catch_unwind(AssertUnwindSafe(|| (self.callback)(status))).is_err() {
            error!(
                id = self.id,
                revision = status.revision,
                "Status subscriber panicked"
            );
        }
    }
}

#[derive(Default)]
struct DeliveryQueue {
    queued: VecDeque<SyncStatus>,
    draining: bool,
}

/// Central holder of the current sync snapshot.
///
/// Snapshots are delivered to callbacks and channel receivers in the order
/// they were published. A callback may publish, read the status, or
/// unsubscribe from within its own invocation.
pub struct StatusNotifier {
    /// The current snapshot.
    current: RwLock<SyncStatus>,
    /// Live callback registrations.
    subscribers: Mutex<Vec<Arc<Registration>>>,
    /// Serializes publishers; re-entrant publishes are queued behind the running delivery.
    delivery: ReentrantMutex<RefCell<DeliveryQueue>>,
    next_id: AtomicU64,
    /// Broadcast channel for async consumers.
    status_tx: Sender<SyncStatus>,
}

impl Debug for StatusNotifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("StatusNotifier")
            .field("current", &*self.current.read())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusNotifier {
    /// Creates a notifier whose current snapshot has no work.
    #[must_use]
    pub fn new() -> Self {
        let (status_tx, _) = channel(STATUS_CHANNEL_CAPACITY);

        Self {
            current: RwLock::new(SyncStatus::default()),
            subscribers: Mutex::new(Vec::new()),
            delivery: ReentrantMutex::new(RefCell::new(DeliveryQueue::default())),
            next_id: AtomicU64::new(1),
            status_tx,
        }
    }

    /// Returns the current snapshot.
    pub fn status(&self) -> SyncStatus {
        self.current.read().clone()
    }

    /// Registers `callback` for every future snapshot.
    ///
    /// The callback is not invoked with the current snapshot; read
    /// [`status`](Self::status) for that. Dropping or unsubscribing the
    /// returned handle removes the registration.
    pub fn on_status_change<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let registration = Arc::new(Registration {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            callback: Box::new(callback),
            active: ReentrantMutex::new(Cell::new(true)),
        });
        self.subscribers.lock().push(registration.clone());
        trace!(id = registration.id, "Status subscriber registered");

        Subscription {
            notifier: Arc::downgrade(self),
            registration,
        }
    }

    /// Subscribes to snapshots over a broadcast channel.
    pub fn subscribe(&self) -> Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Number of live callback registrations.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Builds, stores and delivers a new snapshot.
    ///
    /// `build` runs under the publish lock so that concurrent publishers
    /// cannot deliver an older aggregate after a newer one. The notifier
    /// assigns the revision.
    pub fn publish_with<F>(&self, build: F) -> SyncStatus
    where
        F: FnOnce() -> SyncStatus,
    {
        let delivery = self.delivery.lock();

        let mut status = build();
        {
            let mut current = self.current.write();
            status.revision = current.revision + 1;
            *current = status.clone();
        }
        delivery.borrow_mut().queued.push_back(status.clone());

        if delivery.borrow().draining {
            return status;
        }
        delivery.borrow_mut().draining = true;

        loop {
            let next = delivery.borrow_mut().queued.pop_front();
            let Some(snapshot) = next else {
                break;
            };
            let subscribers: Vec<Arc<Registration>> = self.subscribers.lock().clone();
            for registration in subscribers {
                registration.deliver(&snapshot);
            }
            let _ = self.status_tx.send(snapshot);
        }

        delivery.borrow_mut().draining = false;
        status
    }

    fn remove(&self, id: u64) {
        self.subscribers.lock().retain(|r| r.id != id);
        trace!(id, "Status subscriber removed");
    }
}

/// Handle to one callback registration.
///
/// Unsubscribing is idempotent. Once [`unsubscribe`](Self::unsubscribe)
/// returns, the callback will not run again. Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    notifier: Weak<StatusNotifier>,
    registration: Arc<Registration>,
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Subscription")
            .field("id", &self.registration.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    /// Registration id, unique per notifier.
    pub fn id(&self) -> u64 {
        self.registration.id
    }

    /// Whether the callback can still be invoked.
    pub fn is_active(&self) -> bool {
        self.registration.active.lock().get()
    }

    /// Removes the registration. Further calls do nothing.
    pub fn unsubscribe(&self) {
        let active = self.registration.active.lock();
        if !active.replace(false) {
            return;
        }
        drop(active);

        if let Some(notifier) = self.notifier.upgrade() {
            notifier.remove(self.registration.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;

    use crate::state::{notifier::StatusNotifier, status::SyncStatus};

    fn counting(notifier: &Arc<StatusNotifier>) -> (Arc<AtomicUsize>, super::Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let subscription = notifier.on_status_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, subscription)
    }

    fn pending(n: usize) -> SyncStatus {
        SyncStatus {
            pending: n,
            ..SyncStatus::default()
        }
    }

    #[test]
    fn test_initial_status_is_empty() {
        let notifier = StatusNotifier::new();
        let status = notifier.status();
        assert_eq!(status, SyncStatus::default());
        assert!(!status.has_pending_work());
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_updates_status_and_revision() {
        let notifier = StatusNotifier::new();
        let first = notifier.publish_with(|| pending(3));
        let second = notifier.publish_with(|| pending(2));

        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert_eq!(notifier.status(), second);
    }

    #[test]
    fn test_no_delivery_after_unsubscribe() {
        let notifier = Arc::new(StatusNotifier::new());
        let (count, subscription) = counting(&notifier);

        notifier.publish_with(|| pending(1));
        subscription.unsubscribe();
        notifier.publish_with(|| pending(0));
        notifier.publish_with(|| pending(0));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_double_unsubscribe_leaves_others_alone() {
        let notifier = Arc::new(StatusNotifier::new());
        let (first_count, first) = counting(&notifier);
        let (second_count, _second) = counting(&notifier);

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(notifier.subscriber_count(), 1);

        notifier.publish_with(|| pending(1));
        assert_eq!(first_count.load(Ordering::SeqCst), 0);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let notifier = Arc::new(StatusNotifier::new());
        let (count, subscription) = counting(&notifier);
        drop(subscription);

        notifier.publish_with(|| pending(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_interleaved_subscriptions_never_see_late_snapshots() {
        let notifier = Arc::new(StatusNotifier::new());
        let mut live = Vec::new();
        let mut retired = Vec::new();

        for round in 0..20 {
            live.push(counting(&notifier));
            notifier.publish_with(|| pending(round));
            if round % 3 == 0 {
                let (count, subscription) = live.remove(0);
                subscription.unsubscribe();
                retired.push((count.load(Ordering::SeqCst), count, subscription));
            }
        }
        notifier.publish_with(|| pending(0));

        for (at_unsubscribe, count, _) in &retired {
            assert_eq!(count.load(Ordering::SeqCst), *at_unsubscribe);
        }
        assert_eq!(notifier.subscriber_count(), live.len());
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let notifier = Arc::new(StatusNotifier::new());
        let slot: Arc<Mutex<Option<super::Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let inner_slot = slot.clone();
        let seen = count.clone();
        let subscription = notifier.on_status_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            if let Some(own) = inner_slot.lock().as_ref() {
                own.unsubscribe();
            }
        });
        *slot.lock() = Some(subscription);

        notifier.publish_with(|| pending(1));
        notifier.publish_with(|| pending(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_publish_keeps_order() {
        let notifier = Arc::new(StatusNotifier::new());
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

        let republisher = Arc::downgrade(&notifier);
        let _first = notifier.on_status_change(move |status| {
            if status.revision == 1
                && let Some(notifier) = republisher.upgrade()
            {
                notifier.publish_with(|| pending(9));
            }
        });
        let log = seen.clone();
        let _second = notifier.on_status_change(move |status| {
            log.lock().push(status.revision);
        });

        notifier.publish_with(|| pending(1));
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(notifier.status().pending, 9);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_delivery() {
        let notifier = Arc::new(StatusNotifier::new());
        let mut receiver = notifier.subscribe();
        let (count, _good) = counting(&notifier);
        let faulty = notifier.on_status_change(|status| {
            if status.revision == 1 {
                panic!("render failed");
            }
        });

        notifier.publish_with(|| pending(1));
        assert!(faulty.is_active());
        drop(faulty);
        notifier.publish_with(|| pending(2));
        notifier.publish_with(|| pending(3));

        assert_eq!(count.load(Ordering::SeqCst), 3);
        let revisions: Vec<u64> = std::iter::from_fn(|| receiver.try_recv().ok())
            .map(|status| status.revision)
            .collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_channel_receives_published_snapshots() {
        let notifier = StatusNotifier::new();
        let mut receiver = notifier.subscribe();

        notifier.publish_with(|| pending(4));
        let status = receiver.recv().await.unwrap();
        assert_eq!(status.pending, 4);
        assert_eq!(status.revision, 1);
    }
}
