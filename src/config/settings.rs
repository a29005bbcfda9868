//! Sync settings management with XDG Base Directory compliance.
//!
//! Settings live in `$XDG_CONFIG_HOME/cardsync/settings.json`; the local
//! entry database defaults to `$XDG_CACHE_HOME/cardsync/sync.db`.

use std::{
    env::var,
    fs::{create_dir_all, read_to_string, write},
    io::Error as StdError,
    path::PathBuf,
    time::Duration,
};

use {
    parking_lot::{RwLock, RwLockReadGuard},
    serde::{Deserialize, Serialize},
    serde_json::{Error as SerdeJsonError, from_str, to_string_pretty},
    thiserror::Error,
    tracing::debug,
};

/// Error type for settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Failed to read or write settings file.
    #[error("IO error: {0}")]
    IoError(#[from] StdError),
    /// Failed to serialize or deserialize settings.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] SerdeJsonError),
    /// Invalid settings value.
    #[error("Invalid settings value: {reason}")]
    InvalidValue { reason: String },
}

/// Serializable sync settings with default values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Path of the local entry database (None = cache directory).
    pub database_path: Option<String>,
    /// Remote write attempts before an entry is left in `failed`.
    pub max_attempts: u32,
    /// Backoff before the first retry, doubled per attempt.
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry backoff.
    pub retry_max_delay_ms: u64,
    /// Maximum entries pushed per worker batch.
    pub batch_size: usize,
    /// Period of automatic `sync_all` runs (0 = disabled).
    pub auto_sync_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            max_attempts: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            batch_size: 25,
            auto_sync_interval_ms: 0,
        }
    }
}

impl SyncSettings {
    /// Checks the settings for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::InvalidValue` describing the first bad field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_attempts == 0 {
            return Err(SettingsError::InvalidValue {
                reason: "max_attempts must be at least 1".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(SettingsError::InvalidValue {
                reason: "batch_size must be at least 1".to_string(),
            });
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(SettingsError::InvalidValue {
                reason: format!(
                    "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                    self.retry_base_delay_ms, self.retry_max_delay_ms
                ),
            });
        }
        Ok(())
    }

    /// Resolves the database location, falling back to the cache directory.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path.as_ref().map_or_else(
            || {
                let mut path = get_cache_dir();
                path.push("sync.db");
                path
            },
            PathBuf::from,
        )
    }

    /// Auto-sync period, if enabled.
    #[must_use]
    pub fn auto_sync_interval(&self) -> Option<Duration> {
        (self.auto_sync_interval_ms > 0).then(|| Duration::from_millis(self.auto_sync_interval_ms))
    }
}

/// Handles loading, saving, and validation of sync settings.
#[derive(Debug)]
pub struct SettingsManager {
    /// Thread-safe settings storage.
    settings: RwLock<SyncSettings>,
    /// Path to the configuration file on disk.
    config_path: PathBuf,
}

impl SettingsManager {
    /// Creates a new settings manager with the default config path.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if settings cannot be loaded or are invalid.
    pub fn new() -> Result<Self, SettingsError> {
        Self::with_config_path(get_config_path())
    }

    /// Creates a new settings manager with a custom config path (for testing).
    ///
    /// # Arguments
    ///
    /// * `config_path` - Custom path for the settings file
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if settings cannot be loaded or are invalid.
    pub fn with_config_path(config_path: PathBuf) -> Result<Self, SettingsError> {
        if let Some(parent) = config_path.parent() {
            create_dir_all(parent)?;
        }

        let settings: SyncSettings = if config_path.exists() {
            debug!("Loading settings from existing file: {:?}", config_path);
            let contents = read_to_string(&config_path)?;
            from_str(&contents)?
        } else {
            debug!("No settings file at {:?}, using defaults", config_path);
            SyncSettings::default()
        };
        settings.validate()?;

        Ok(SettingsManager {
            settings: RwLock::new(settings),
            config_path,
        })
    }

    /// Gets the current settings.
    pub fn get_settings(&self) -> RwLockReadGuard<'_, SyncSettings> {
        self.settings.read()
    }

    /// Gets the configuration file path.
    pub fn get_config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Validates, applies and saves new settings.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if the settings are invalid or cannot be saved.
    pub fn update_settings(&self, new_settings: SyncSettings) -> Result<(), SettingsError> {
        new_settings.validate()?;
        *self.settings.write() = new_settings;
        self.save_settings()
    }

    fn save_settings(&self) -> Result<(), SettingsError> {
        debug!("Saving settings to file: {:?}", self.config_path);
        let contents = to_string_pretty(&*self.settings.read())?;
        write(&self.config_path, contents)?;
        Ok(())
    }
}

/// Path of the settings file.
#[must_use]
pub fn get_config_path() -> PathBuf {
    let mut config_dir = xdg_dir("XDG_CONFIG_HOME", ".config");
    config_dir.push("cardsync");
    config_dir.push("settings.json");
    config_dir
}

/// Directory for the local entry database.
#[must_use]
pub fn get_cache_dir() -> PathBuf {
    let mut cache_dir = xdg_dir("XDG_CACHE_HOME", ".cache");
    cache_dir.push("cardsync");
    cache_dir
}

/// Resolves an XDG base directory, falling back to `$HOME/<fallback>`.
fn xdg_dir(env_key: &str, fallback: &str) -> PathBuf {
    if let Ok(dir) = var(env_key)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }

    if let Ok(home) = var("HOME") {
        let mut path = PathBuf::from(home);
        path.push(fallback);
        return path;
    }

    PathBuf::from(".")
}
