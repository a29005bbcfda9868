//! Configuration for the sync engine.

use std::time::Duration;

use crate::config::settings::SyncSettings;

/// Configuration for the sync engine worker and its retry policy.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Remote write attempts before an entry stays `failed`.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub retry_base_delay: Duration,
    /// Upper bound on the backoff.
    pub retry_max_delay: Duration,
    /// Maximum entries pushed per batch.
    pub batch_size: usize,
    /// Period of automatic sync runs, if any.
    pub auto_sync_interval: Option<Duration>,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for SyncEngineConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            retry_base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            batch_size: settings.batch_size.max(1),
            auto_sync_interval: settings.auto_sync_interval(),
        }
    }
}

impl SyncEngineConfig {
    /// Backoff after the given number of failed attempts.
    ///
    /// Doubles from `retry_base_delay` and saturates at `retry_max_delay`.
    #[must_use]
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.retry_base_delay
            .checked_mul(1 << exponent)
            .map_or(self.retry_max_delay, |delay| delay.min(self.retry_max_delay))
    }
}
