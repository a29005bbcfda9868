//! cardsync - offline-first sync core for the card studio client
//!
//! Local edits to profiles, cards, media assets and collections are tracked
//! as entries and pushed to the hosted backend by a [`SyncEngine`]. UI
//! consumers follow progress through immutable [`SyncStatus`] snapshots,
//! either with a callback [`Subscription`] or a mounted [`SyncStatusView`].

pub mod config;
pub mod error;
pub mod remote;
pub mod state;
pub mod store;
pub mod sync;

// Re-export key types for convenience
pub use {
    config::{SettingsManager, SyncSettings},
    error::{RemoteError, RemoteErrorKind, SyncError},
    remote::{MemoryRemote, RemoteStore},
    state::{StatusNotifier, Subscription, SyncStatus, SyncStatusView},
    store::LocalStore,
    sync::{EntryState, LocalEntry, RemoteTable, SyncEngine, SyncEngineConfig, SyncRequester},
};
