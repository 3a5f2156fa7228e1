//! Cleanup retention settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often cleanup runs and how long isolated batches are kept.
///
/// A batch directory is only eligible once it is older than the retention
/// window *and* carries merged output under `uploaded/`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupConfig {
    /// Whether the periodic sweep runs at all.
    pub enabled: bool,
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Minimum batch age, in seconds, before deletion.
    pub retention_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60 * 60,
            retention_secs: 30 * 24 * 60 * 60,
        }
    }
}

impl CleanupConfig {
    /// Sweep interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retention window.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Validates the settings.
    ///
    /// Returns an error message if validation fails.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        if self.interval_secs == 0 {
            return Some("cleanup intervalSecs must be at least 1".to_string());
        }
        if self.retention_secs == 0 {
            return Some("cleanup retentionSecs must be at least 1".to_string());
        }
        None
    }
}
