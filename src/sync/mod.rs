//! Offline-first synchronization of local edits.
//!
//! Local edits are tracked as entries with a per-entry state machine
//! (`pending`, `syncing`, `clean`, `failed`). The engine pushes them to the
//! remote store and publishes aggregate snapshots after every transition.

pub mod config;
pub mod engine;
pub mod entry;


pub use {
    config::SyncEngineConfig,
    engine::{SyncCommand, SyncEngine, SyncRequester},
    entry::{EntryState, LocalEntry, RemoteTable},
};
