//! Sync status snapshots and their delivery to consumers.
//!
//! This module provides the snapshot type, the notifier that owns the
//! current snapshot and its subscribers, and the per-consumer view.

pub mod notifier;
pub mod status;
pub mod status_view;

pub use {
    notifier::{StatusCallback, StatusNotifier, Subscription},
    status::SyncStatus,
    status_view::SyncStatusView,
};
