//! Sync engine that pushes locally tracked entries to the remote store.
//!
//! The engine is an explicitly constructed service. `start` loads the
//! persisted entries and spawns a single worker task; `stop` drains the
//! worker. Requests (`sync_all`, `force_sync_item`) are queued on an
//! `async-channel` and return immediately; their outcome is visible only
//! through the snapshots published on the [`StatusNotifier`].

use std::{
    collections::BTreeMap,
    future::pending,
    iter,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use {
    anyhow::Error,
    async_channel::{Receiver, Sender, unbounded},
    parking_lot::{Mutex, RwLock},
    serde_json::Value,
    tokio::{
        select,
        sync::{Mutex as AsyncMutex, broadcast},
        task::JoinHandle,
        time::{Instant as TokioInstant, MissedTickBehavior, interval, sleep_until},
    },
    tracing::{debug, info, warn},
};

use crate::{
    error::{ErrorReporter, RemoteError, SyncError},
    remote::RemoteStore,
    state::{
        notifier::{StatusNotifier, Subscription},
        status::SyncStatus,
    },
    store::LocalStore,
    sync::{
        config::SyncEngineConfig,
        entry::{EntryState, LocalEntry, RemoteTable, unix_millis},
    },
};

/// Requests processed by the worker, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Push every entry that is due.
    SyncAll,
    /// Push one entry now.
    ForceSync(String),
    /// Delete the remote row of an entry that stopped being tracked.
    Delete { table: RemoteTable, key: String },
    /// Finish the current command and exit.
    Shutdown,
}

/// Cheap, cloneable handle for queuing sync requests.
#[derive(Debug, Clone)]
pub struct SyncRequester {
    control_tx: Sender<SyncCommand>,
}

impl SyncRequester {
    /// Requests that all pending local changes be pushed.
    pub fn sync_all(&self) {
        self.send(SyncCommand::SyncAll);
    }

    /// Requests that the entry with `key` be pushed.
    ///
    /// Unknown keys are ignored by the worker.
    pub fn force_sync_item(&self, key: &str) {
        self.send(SyncCommand::ForceSync(key.to_string()));
    }

    fn send(&self, command: SyncCommand) {
        if let Err(e) = self.control_tx.try_send(command) {
            debug!("SyncRequester: failed to queue command: {e}");
        }
    }
}

/// Worker-side bookkeeping that is not derived from entries.
#[derive(Debug, Default)]
struct Activity {
    is_syncing: bool,
    last_error: Option<String>,
    last_synced_at: Option<SystemTime>,
}

/// A remote write captured at the moment its entry entered `syncing`.
struct PushJob {
    key: String,
    table: RemoteTable,
    payload: Value,
    revision: u64,
    token: u64,
}

impl PushJob {
    fn begin(entry: &mut LocalEntry, token: u64) -> Self {
        let revision = entry.begin_sync(token);
        Self {
            key: entry.key.clone(),
            table: entry.table,
            payload: entry.payload.clone(),
            revision,
            token,
        }
    }
}

/// State shared between the engine handle and its worker.
struct EngineCore {
    entries: RwLock<BTreeMap<String, LocalEntry>>,
    activity: RwLock<Activity>,
    notifier: Arc<StatusNotifier>,
    store: LocalStore,
    /// Serializes store writes so the last write always carries the latest entry.
    store_lock: AsyncMutex<()>,
    remote: Arc<dyn RemoteStore>,
    config: SyncEngineConfig,
    /// Source of write tokens; never reused, even for a re-created key.
    next_write_token: AtomicU64,
}

/// Pushes local edits to the remote store and publishes sync snapshots.
pub struct SyncEngine {
    core: Arc<EngineCore>,
    requester: SyncRequester,
    control_rx: Receiver<SyncCommand>,
    /// Held for the whole of `start` and `stop`.
    lifecycle: AsyncMutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Creates a stopped engine.
    ///
    /// # Arguments
    ///
    /// * `store` - Local entry store.
    /// * `remote` - Remote backend.
    /// * `config` - Worker and retry configuration.
    #[must_use]
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, config: SyncEngineConfig) -> Self {
        let (control_tx, control_rx) = unbounded();

        Self {
            core: Arc::new(EngineCore {
                entries: RwLock::new(BTreeMap::new()),
                activity: RwLock::new(Activity::default()),
                notifier: Arc::new(StatusNotifier::new()),
                store,
                store_lock: AsyncMutex::new(()),
                remote,
                config,
                next_write_token: AtomicU64::new(1),
            }),
            requester: SyncRequester { control_tx },
            control_rx,
            lifecycle: AsyncMutex::new(()),
            worker: Mutex::new(None),
        }
    }

    /// Loads persisted entries and spawns the worker.
    ///
    /// Entries left in `syncing` by an interrupted run go back to `pending`.
    /// A worker that exited on its own (for example after a panic) is
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::AlreadyRunning` if the engine is running, or a
    /// store error if the entries cannot be loaded.
    pub async fn start(&self) -> Result<(), SyncError> {
        let _lifecycle = self.lifecycle.lock().await;

        let exited = {
            let mut worker = self.worker.lock();
            if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return Err(SyncError::AlreadyRunning);
            }
            worker.take()
        };
        if let Some(handle) = exited {
            warn!("Sync worker exited without stop; restarting");
            if let Err(e) = handle.await {
                ErrorReporter::error(&Error::from(e), "sync worker");
            }
        }
        self.discard_stale_shutdowns();

        self.core.load().await?;
        self.core.publish();

        let core = self.core.clone();
        let control_rx = self.control_rx.clone();
        let handle = tokio::spawn(async move {
            core.run(control_rx).await;
        });
        *self.worker.lock() = Some(handle);

        info!(
            entries = self.core.entries.read().len(),
            "Sync engine started"
        );
        Ok(())
    }

    /// Stops the worker after its current command. In-flight writes finish.
    ///
    /// Does nothing if the engine is not running. Concurrent calls stop the
    /// worker once.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if !handle.is_finished()
            && let Err(e) = self.requester.control_tx.send(SyncCommand::Shutdown).await
        {
            debug!("SyncEngine: failed to queue shutdown: {e}");
        }
        if let Err(e) = handle.await {
            ErrorReporter::error(&Error::from(e), "sync worker");
        }

        info!("Sync engine stopped");
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Drops `Shutdown` commands no worker consumed, keeping the rest in order.
    fn discard_stale_shutdowns(&self) {
        let queued: Vec<SyncCommand> = iter::from_fn(|| self.control_rx.try_recv().ok()).collect();
        for command in queued {
            if command == SyncCommand::Shutdown {
                debug!("Discarding stale shutdown command");
            } else {
                self.requester.send(command);
            }
        }
    }

    /// Returns the current snapshot.
    pub fn status(&self) -> SyncStatus {
        self.core.notifier.status()
    }

    /// Registers a callback for every future snapshot.
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.core.notifier.on_status_change(callback)
    }

    /// Subscribes to snapshots over a broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatus> {
        self.core.notifier.subscribe()
    }

    /// The notifier snapshots are published on.
    pub fn notifier(&self) -> &Arc<StatusNotifier> {
        &self.core.notifier
    }

    /// A cloneable handle for queuing sync requests.
    pub fn requester(&self) -> SyncRequester {
        self.requester.clone()
    }

    /// Requests that all pending local changes be pushed.
    pub fn sync_all(&self) {
        self.requester.sync_all();
    }

    /// Requests that one entry be pushed. Unknown keys are a no-op.
    pub fn force_sync_item(&self, key: &str) {
        self.requester.force_sync_item(key);
    }

    /// Records a local edit of the row `key` in `table`.
    ///
    /// The entry becomes `pending` (or stays `syncing` and returns to
    /// `pending` once the in-flight write completes).
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidKey` for a blank key, or a store error if
    /// the edit cannot be persisted.
    pub async fn record_change(
        &self,
        table: RemoteTable,
        key: &str,
        payload: Value,
    ) -> Result<(), SyncError> {
        if key.trim().is_empty() {
            return Err(SyncError::InvalidKey {
                reason: "key is empty".to_string(),
            });
        }

        {
            let mut entries = self.core.entries.write();
            match entries.get_mut(key) {
                Some(entry) => entry.record_edit(table, payload),
                None => {
                    entries.insert(key.to_string(), LocalEntry::new(table, key, payload));
                }
            }
        }
        debug!(key, %table, "Recorded local change");

        self.core.persist(key).await?;
        self.core.publish();
        Ok(())
    }

    /// Stops tracking an entry. Returns `false` for unknown keys.
    ///
    /// The worker then deletes the remote row, unless the key has been
    /// recorded again by the time it gets to it. A write of the entry that is
    /// still in flight is discarded when it returns.
    ///
    /// # Errors
    ///
    /// Returns a store error if the row cannot be deleted.
    pub async fn remove_entry(&self, key: &str) -> Result<bool, SyncError> {
        let removed = self.core.entries.write().remove(key);
        let Some(entry) = removed else {
            return Ok(false);
        };

        self.core.persist(key).await?;
        self.core.publish();
        self.requester.send(SyncCommand::Delete {
            table: entry.table,
            key: entry.key,
        });
        Ok(true)
    }

    /// Returns a copy of the entry with `key`.
    pub fn entry(&self, key: &str) -> Option<LocalEntry> {
        self.core.entries.read().get(key).cloned()
    }

    /// Returns copies of all tracked entries, ordered by key.
    pub fn entries(&self) -> Vec<LocalEntry> {
        self.core.entries.read().values().cloned().collect()
    }

    /// Gets the engine configuration.
    pub fn config(&self) -> &SyncEngineConfig {
        &self.core.config
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

/// Tokio instant for the Unix-millis time `at`; times in the past map to now.
fn instant_at(at: i64) -> TokioInstant {
    let wait = u64::try_from(at.saturating_sub(unix_millis())).unwrap_or(0);
    TokioInstant::now() + Duration::from_millis(wait)
}

impl EngineCore {
    /// Replaces the in-memory entries with the persisted ones.
    async fn load(&self) -> Result<(), SyncError> {
        self.activity.write().is_syncing = false;
        let mut loaded = self.store.load_entries().await?;

        for entry in &mut loaded {
            if entry.state == EntryState::Syncing {
                entry.recover_interrupted();
                self.store.update_state(entry).await?;
                debug!(key = %entry.key, "Recovered interrupted entry");
            }
        }

        *self.entries.write() = loaded
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        Ok(())
    }

    /// Worker loop: commands, auto-sync ticks and retry wake-ups.
    async fn run(&self, control_rx: Receiver<SyncCommand>) {
        let mut ticker = self.config.auto_sync_interval.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            let next_retry = self.next_retry_at();
            let tick = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => pending::<()>().await,
                }
            };
            let retry = async {
                match next_retry {
                    Some(at) => sleep_until(instant_at(at)).await,
                    None => pending::<()>().await,
                }
            };

            let command = select! {
                command = control_rx.recv() => command,
                () = tick => Ok(SyncCommand::SyncAll),
                () = retry => Ok(SyncCommand::SyncAll),
            };

            match command {
                Ok(SyncCommand::SyncAll) => self.sync_due().await,
                Ok(SyncCommand::ForceSync(key)) => self.force_sync(&key).await,
                Ok(SyncCommand::Delete { table, key }) => self.delete_remote(table, &key).await,
                Ok(SyncCommand::Shutdown) => break,
                Err(e) => {
                    debug!("Sync command channel closed: {e}");
                    break;
                }
            }
        }
    }

    /// Pushes every due entry, batch by batch.
    async fn sync_due(&self) {
        loop {
            let now = unix_millis();
            let jobs: Vec<PushJob> = {
                let mut entries = self.entries.write();
                entries
                    .values_mut()
                    .filter(|entry| entry.is_due(now))
                    .take(self.config.batch_size)
                    .map(|entry| PushJob::begin(entry, self.write_token()))
                    .collect()
            };
            if jobs.is_empty() {
                break;
            }

            debug!("Pushing batch of {} entries", jobs.len());
            self.run_batch(jobs).await;
        }
    }

    /// Pushes one entry if it is `pending` or `failed`.
    async fn force_sync(&self, key: &str) {
        let job = {
            let mut entries = self.entries.write();
            match entries.get_mut(key) {
                None => {
                    debug!(key, "Ignoring forced sync of unknown entry");
                    return;
                }
                Some(entry) if !entry.is_forceable() => {
                    debug!(key, state = %entry.state, "Ignoring forced sync");
                    return;
                }
                Some(entry) => {
                    entry.reset_attempts();
                    PushJob::begin(entry, self.write_token())
                }
            }
        };

        self.run_batch(vec![job]).await;
    }

    async fn run_batch(&self, jobs: Vec<PushJob>) {
        for job in &jobs {
            self.persist_or_report(&job.key).await;
        }
        self.activity.write().is_syncing = true;
        self.publish();

        for job in jobs {
            self.push(job).await;
        }

        self.activity.write().is_syncing = false;
        self.publish();
    }

    async fn push(&self, job: PushJob) {
        let result = self
            .remote
            .upsert(job.table, &job.key, &job.payload)
            .await;

        let applied = {
            let mut entries = self.entries.write();
            match entries.get_mut(&job.key) {
                Some(entry) if entry.owns_write(job.token) => {
                    match &result {
                        Ok(()) => entry.complete(job.revision),
                        Err(e) => entry.fail(job.revision, e, &self.config),
                    }
                    true
                }
                _ => false,
            }
        };
        if !applied {
            debug!(key = %job.key, "Discarding result of superseded write");
            return;
        }

        match result {
            Ok(()) => {
                debug!(key = %job.key, "Remote write confirmed");
                self.activity.write().last_synced_at = Some(SystemTime::now());
            }
            Err(e) => self.record_failure(&job.key, e),
        }

        self.persist_or_report(&job.key).await;
        self.publish();
    }

    /// Deletes the remote row of an untracked entry. Failures are reported
    /// but not retried.
    async fn delete_remote(&self, table: RemoteTable, key: &str) {
        if self.entries.read().contains_key(key) {
            debug!(key, "Skipping remote delete of re-recorded entry");
            return;
        }

        match self.remote.delete(table, key).await {
            Ok(()) => debug!(key, %table, "Remote row deleted"),
            Err(e) => {
                self.record_failure(key, e);
                self.publish();
            }
        }
    }

    fn record_failure(&self, key: &str, error: RemoteError) {
        let error = Error::from(error);
        self.activity.write().last_error = Some(ErrorReporter::to_user_message(&error));
        let context = format!("remote call for {key}");
        ErrorReporter::warn(&error, &context);
    }

    fn write_token(&self) -> u64 {
        self.next_write_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Earliest retry time (Unix millis) among failed, retryable entries.
    fn next_retry_at(&self) -> Option<i64> {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.state == EntryState::Failed && !entry.terminal)
            .filter_map(|entry| entry.retry_at)
            .min()
    }

    /// Writes the current in-memory version of `key` to the store, or
    /// deletes the row if the entry is no longer tracked.
    async fn persist(&self, key: &str) -> Result<(), SyncError> {
        let _guard = self.store_lock.lock().await;
        let entry = self.entries.read().get(key).cloned();
        match entry {
            Some(entry) => self.store.upsert_entry(&entry).await?,
            None => {
                self.store.delete_entry(key).await?;
            }
        }
        Ok(())
    }

    async fn persist_or_report(&self, key: &str) {
        if let Err(e) = self.persist(key).await {
            let context = format!("persisting {key}");
            ErrorReporter::error(&Error::from(e), &context);
        }
    }

    fn publish(&self) -> SyncStatus {
        self.notifier.publish_with(|| {
            let activity = self.activity.read();
            let entries = self.entries.read();
            SyncStatus {
                is_syncing: activity.is_syncing,
                last_error: activity.last_error.clone(),
                last_synced_at: activity.last_synced_at,
                ..SyncStatus::from_entries(entries.values())
            }
        })
    }
}
