//! Aggregate sync status snapshots.

use std::time::SystemTime;

use serde::Serialize;

use crate::sync::entry::{EntryState, LocalEntry};

/// Immutable snapshot of outstanding synchronization work.
///
/// Built from the union of all per-entry states at one instant. Subscribers
/// receive their own clone; a delivered snapshot is never modified.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SyncStatus {
    /// Entries waiting to be pushed.
    pub pending: usize,
    /// Entries with a write in flight.
    pub syncing: usize,
    /// Entries whose last write failed.
    pub failed: usize,
    /// Entries confirmed written.
    pub clean: usize,
    /// Whether the worker is processing a batch.
    pub is_syncing: bool,
    /// Keys of failed entries, sorted.
    pub failed_keys: Vec<String>,
    /// Message of the most recent failed write.
    pub last_error: Option<String>,
    /// Wall-clock time of the most recent successful write.
    pub last_synced_at: Option<SystemTime>,
    /// Snapshot sequence number.
    pub revision: u64,
}

impl SyncStatus {
    /// Aggregates a set of entries into a snapshot (revision left at 0).
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LocalEntry>) -> Self {
        let mut status = Self::default();
        for entry in entries {
            match entry.state {
                EntryState::Pending => status.pending += 1,
                EntryState::Syncing => status.syncing += 1,
                EntryState::Clean => status.clean += 1,
                EntryState::Failed => {
                    status.failed += 1;
                    status.failed_keys.push(entry.key.clone());
                }
            }
        }
        status.failed_keys.sort_unstable();
        status
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.syncing + self.failed + self.clean
    }

    /// Whether anything is still waiting for or undergoing a write.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        self.pending > 0 || self.syncing > 0
    }

    /// Whether every tracked entry is confirmed written.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !self.has_pending_work() && !self.is_syncing
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        state::status::SyncStatus,
        sync::entry::{EntryState, LocalEntry, RemoteTable},
    };

    #[test]
    fn test_default_status_has_no_work() {
        let status = SyncStatus::default();
        assert_eq!(status.total(), 0);
        assert!(!status.has_pending_work());
        assert!(status.is_settled());
        assert!(status.failed_keys.is_empty());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_status_counts_every_state() {
        let mut entries: Vec<LocalEntry> = ["d", "c", "b", "a", "e"]
            .iter()
            .map(|key| LocalEntry::new(RemoteTable::Cards, *key, json!({})))
            .collect();
        entries[0].state = EntryState::Failed;
        entries[1].state = EntryState::Failed;
        entries[2].state = EntryState::Syncing;
        entries[3].state = EntryState::Clean;

        let status = SyncStatus::from_entries(&entries);
        assert_eq!(status.pending, 1);
        assert_eq!(status.syncing, 1);
        assert_eq!(status.failed, 2);
        assert_eq!(status.clean, 1);
        assert_eq!(status.total(), entries.len());
        assert_eq!(status.failed_keys, vec!["c".to_string(), "d".to_string()]);
        assert!(status.has_pending_work());
    }
}
