//! Locally tracked entries and their per-entry sync state machine.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::{error::domain::RemoteError, sync::config::SyncEngineConfig};

/// Sync state of a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Confirmed written to the remote store.
    Clean,
    /// Edited locally, waiting to be pushed.
    #[default]
    Pending,
    /// A remote write is in flight.
    Syncing,
    /// The last remote write failed.
    Failed,
}

impl EntryState {
    /// Column value used by the local store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Failed => "failed",
        }
    }
}

impl Display for EntryState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean" => Ok(Self::Clean),
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown entry state '{other}'")),
        }
    }
}

/// Hosted table an entry is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTable {
    /// User profiles.
    Profiles,
    /// Card designs.
    Cards,
    /// Uploaded artwork and other media.
    MediaAssets,
    /// User card collections.
    Collections,
}

impl RemoteTable {
    /// Table name on the backend.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Cards => "cards",
            Self::MediaAssets => "media_assets",
            Self::Collections => "collections",
        }
    }
}

impl Display for RemoteTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profiles" => Ok(Self::Profiles),
            "cards" => Ok(Self::Cards),
            "media_assets" => Ok(Self::MediaAssets),
            "collections" => Ok(Self::Collections),
            other => Err(format!("unknown remote table '{other}'")),
        }
    }
}

/// One locally tracked unit of data awaiting confirmation against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntry {
    /// Opaque key, unique across tables.
    pub key: String,
    /// Destination table.
    pub table: RemoteTable,
    /// Row contents to write.
    pub payload: Value,
    /// Current sync state.
    pub state: EntryState,
    /// Failed remote writes since the last success or edit.
    pub attempts: u32,
    /// Message of the most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set when the entry must not be retried until edited or forced.
    pub terminal: bool,
    /// Local edit counter; bumped on every edit.
    pub revision: u64,
    /// Unix milliseconds of the last state change.
    pub updated_at: i64,
    /// Unix milliseconds before which a failed entry is not retried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<i64>,
    /// Token of the remote write in flight, if any.
    #[serde(skip)]
    pub write_token: Option<u64>,
}

impl LocalEntry {
    /// Creates a freshly edited entry in `pending`.
    pub fn new(table: RemoteTable, key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            table,
            payload,
            state: EntryState::Pending,
            attempts: 0,
            last_error: None,
            terminal: false,
            revision: 1,
            updated_at: unix_millis(),
            retry_at: None,
            write_token: None,
        }
    }

    /// Applies a local edit.
    ///
    /// An entry with a write in flight stays `syncing`; the bumped revision
    /// sends it back to `pending` when that write completes.
    pub fn record_edit(&mut self, table: RemoteTable, payload: Value) {
        self.table = table;
        self.payload = payload;
        self.revision += 1;
        self.updated_at = unix_millis();
        if self.state != EntryState::Syncing {
            self.mark_pending();
        }
    }

    /// Whether `sync_all` should pick this entry up at `now` (Unix millis).
    #[must_use]
    pub fn is_due(&self, now: i64) -> bool {
        match self.state {
            EntryState::Pending => true,
            EntryState::Failed => !self.terminal && self.retry_at.is_none_or(|at| at <= now),
            EntryState::Clean | EntryState::Syncing => false,
        }
    }

    /// Whether `force_sync_item` may push this entry.
    #[must_use]
    pub fn is_forceable(&self) -> bool {
        matches!(self.state, EntryState::Pending | EntryState::Failed)
    }

    /// Moves the entry to `syncing` under the write `token` and returns the
    /// revision being pushed.
    ///
    /// Tokens must be unique for the lifetime of the engine; only the write
    /// holding the current token may settle the entry.
    pub fn begin_sync(&mut self, token: u64) -> u64 {
        self.state = EntryState::Syncing;
        self.write_token = Some(token);
        self.updated_at = unix_millis();
        self.revision
    }

    /// Whether the write identified by `token` is the one in flight.
    #[must_use]
    pub fn owns_write(&self, token: u64) -> bool {
        self.state == EntryState::Syncing && self.write_token == Some(token)
    }

    /// Clears the retry budget ahead of a forced push.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
        self.terminal = false;
        self.retry_at = None;
    }

    /// Records a successful write of `pushed_revision`.
    pub fn complete(&mut self, pushed_revision: u64) {
        self.write_token = None;
        if self.revision == pushed_revision {
            self.state = EntryState::Clean;
            self.attempts = 0;
            self.last_error = None;
            self.terminal = false;
            self.retry_at = None;
            self.updated_at = unix_millis();
        } else {
            self.mark_pending();
        }
    }

    /// Records a failed write of `pushed_revision`.
    pub fn fail(&mut self, pushed_revision: u64, error: &RemoteError, config: &SyncEngineConfig) {
        self.write_token = None;
        if self.revision != pushed_revision {
            self.mark_pending();
            return;
        }

        self.attempts = self.attempts.saturating_add(1);
        self.state = EntryState::Failed;
        self.last_error = Some(error.to_string());
        self.terminal = !error.is_retryable() || self.attempts >= config.max_attempts;
        let now = unix_millis();
        self.retry_at = (!self.terminal)
            .then(|| now.saturating_add(duration_millis(config.retry_delay(self.attempts))));
        self.updated_at = now;
    }

    /// Puts an entry interrupted mid-write back in the queue.
    pub fn recover_interrupted(&mut self) {
        self.write_token = None;
        if self.state == EntryState::Syncing {
            self.state = EntryState::Pending;
        }
    }

    fn mark_pending(&mut self) {
        self.state = EntryState::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.terminal = false;
        self.retry_at = None;
        self.updated_at = unix_millis();
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, duration_millis)
}

/// Whole milliseconds in `duration`, saturating at `i64::MAX`.
#[must_use]
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
