use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Upper bound for configured TTLs, rolling windows and break intervals (one day)
pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Upper bound for the poller and tick periods (one hour)
const MAX_PERIOD_MS: u64 = 60 * 60 * 1000;

/// `secs` as a chrono duration, capped at [`MAX_INTERVAL_SECS`]
pub(crate) fn capped_seconds(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs.min(MAX_INTERVAL_SECS)).unwrap_or(0);
    chrono::Duration::seconds(secs)
}

/// Get the local data directory for nudgeflow.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push("nudgeflow");
    Ok(path)
}

/// Default location of the engine configuration file.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(CONFIG_FILE_NAME))
}

/// Engine configuration, persisted as TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub collector: CollectorConfig,
    pub classifier: ClassifierConfig,
    pub history: HistoryConfig,
    pub engine: LoopConfig,
}

/// Activity collector timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// How often each observed surface is checked for idleness
    pub poll_interval_ms: u64,
    /// Quiet time that closes a burst of keystrokes
    pub debounce_ms: u64,
    /// Idle windows reported for every observed surface
    pub idle_windows: Vec<IdleWindowConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleWindowConfig {
    pub min_secs: u64,
    #[serde(default)]
    pub max_secs: Option<u64>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            debounce_ms: 1500,
            idle_windows: vec![
                IdleWindowConfig {
                    min_secs: 6,
                    max_secs: Some(10),
                },
                IdleWindowConfig {
                    min_secs: 30,
                    max_secs: None,
                },
            ],
        }
    }
}

impl CollectorConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Thresholds for the nudge rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// TTL for toast-style nudges
    pub default_ttl_secs: u64,
    /// TTL for stall and micro-break nudges
    pub long_ttl_secs: u64,
    pub switch_window_secs: u64,
    /// Switches inside the window above this count are excessive
    pub switch_threshold: usize,
    /// Idle spans at least this long are stalls rather than hesitation
    pub stall_after_secs: u64,
    pub large_task_minutes: u64,
    pub over_edit_min_edits: u64,
    pub over_edit_deletion_ratio: f64,
    pub micro_break_after_mins: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 8,
            long_ttl_secs: 10,
            switch_window_secs: 600,
            switch_threshold: 3,
            stall_after_secs: 30,
            large_task_minutes: 60,
            over_edit_min_edits: 40,
            over_edit_deletion_ratio: 0.5,
            micro_break_after_mins: 50,
        }
    }
}

/// Recent-event buffer bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
    pub retention_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: crate::event::DEFAULT_HISTORY_CAPACITY,
            retention_secs: crate::event::DEFAULT_RETENTION_SECS,
        }
    }
}

impl HistoryConfig {
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Engine event loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Interval of ambient classification and expiry sweeps
    pub tick_interval_ms: u64,
    /// Forward classified signals to the telemetry sink
    pub telemetry: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            telemetry: true,
        }
    }
}

impl LoopConfig {
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or is invalid
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the file write fails
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |message: String| ConfigError::Write {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| write_err(e.to_string()))
    }

    /// Reject values that would make the engine misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending key
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        for (key, period) in [
            ("collector.poll_interval_ms", self.collector.poll_interval_ms),
            ("engine.tick_interval_ms", self.engine.tick_interval_ms),
        ] {
            if period == 0 || period > MAX_PERIOD_MS {
                return Err(invalid(key, "must be between 1 ms and one hour"));
            }
        }
        let classifier = &self.classifier;
        for (key, secs) in [
            ("classifier.default_ttl_secs", classifier.default_ttl_secs),
            ("classifier.long_ttl_secs", classifier.long_ttl_secs),
            ("classifier.switch_window_secs", classifier.switch_window_secs),
            (
                "classifier.micro_break_after_mins",
                classifier.micro_break_after_mins.saturating_mul(60),
            ),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(invalid(key, "must not exceed one day"));
            }
        }
        for window in &self.collector.idle_windows {
            if window.max_secs.is_some_and(|max| max < window.min_secs) {
                return Err(invalid(
                    "collector.idle_windows",
                    "max_secs must not be below min_secs",
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.classifier.over_edit_deletion_ratio) {
            return Err(invalid(
                "classifier.over_edit_deletion_ratio",
                "must be between 0 and 1",
            ));
        }
        if self.history.capacity == 0 {
            return Err(invalid("history.capacity", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r"
            [classifier]
            switch_threshold = 5
            ",
        )
        .unwrap();

        assert_eq!(config.classifier.switch_threshold, 5);
        assert_eq!(config.classifier.default_ttl_secs, 8);
        assert_eq!(config.collector.poll_interval_ms, 1000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = EngineConfig::default();
        config.history.capacity = 42;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_invalid_window_rejected() {
        let mut config = EngineConfig::default();
        config.collector.idle_windows = vec![IdleWindowConfig {
            min_secs: 10,
            max_secs: Some(5),
        }];

        let err = config.validate().unwrap_err();
        let ConfigError::InvalidValue { key, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(key, "collector.idle_windows");
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let config: EngineConfig = toml::from_str(
            r"
            [classifier]
            default_ttl_secs = 10000000000000
            ",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        let ConfigError::InvalidValue { key, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(key, "classifier.default_ttl_secs");

        let mut config = EngineConfig::default();
        config.classifier.micro_break_after_mins = 24 * 60 + 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.engine.tick_interval_ms = MAX_PERIOD_MS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capped_seconds() {
        assert_eq!(capped_seconds(90), chrono::Duration::seconds(90));
        assert_eq!(
            capped_seconds(u64::MAX),
            chrono::Duration::seconds(24 * 60 * 60)
        );
    }
}
