//! Sync settings and persistent configuration.
//!
//! This module provides settings management with XDG Base Directory
//! compliance for the config file and the local entry database.

pub mod settings;

pub use settings::{SettingsError, SettingsManager, SyncSettings, get_cache_dir, get_config_path};
