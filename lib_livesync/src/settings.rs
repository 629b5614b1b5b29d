//! # Sync Settings
//!
//! Everything a host needs to assemble the pipeline, loadable from a single
//! camelCase JSON document:
//!
//! ```json
//! {
//!   "source": { "endpoint": "ws://127.0.0.1:9003/ws", "heartbeatIntervalMs": 10000,
//!               "topics": ["price:AAPL", "news:GLOBAL"] },
//!   "backoff": { "baseMs": 1000, "capMs": 30000, "maxAttempts": 10, "jitter": true },
//!   "stale": { "defaultThresholdMs": 30000, "classThresholdsMs": { "news": 300000 } },
//!   "tickIntervalMs": 100
//! }
//! ```
//!
//! Missing fields fall back to their defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{BackoffPolicy, SourceConfig, StalePolicy, Topic};
use crate::errors::SettingsError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub source: SourceConfig,
    pub backoff: BackoffPolicy,
    pub stale: StalePolicy,
    /// Render tick; roughly one display frame at 60 Hz is 16 ms.
    pub tick_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            backoff: BackoffPolicy::default(),
            stale: StalePolicy::default(),
            tick_interval_ms: 100,
        }
    }
}

impl SyncSettings {
    pub fn from_json_str(text: &str) -> Result<Self, SettingsError> {
        let settings: SyncSettings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        log::debug!("Loaded sync settings from {}", path.display());
        Self::from_json_str(&text)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.source.endpoint.trim().is_empty() {
            return Err(SettingsError::Invalid("source.endpoint is empty".to_string()));
        }
        if self.tick_interval_ms == 0 {
            return Err(SettingsError::Invalid("tickIntervalMs must be positive".to_string()));
        }
        if self.backoff.base_ms == 0 || self.backoff.cap_ms < self.backoff.base_ms {
            return Err(SettingsError::Invalid(format!(
                "backoff requires 0 < baseMs <= capMs (got {} / {})",
                self.backoff.base_ms, self.backoff.cap_ms
            )));
        }
        if let Some(bad) = self.source.topics.iter().find(|t| t.trim().is_empty()) {
            return Err(SettingsError::Invalid(format!("blank topic {:?} in source.topics", bad)));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// The configured topic list as validated identifiers.
    pub fn topics(&self) -> Vec<Topic> {
        self.source
            .topics
            .iter()
            .filter_map(|name| Topic::new(name).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.tick_interval(), Duration::from_millis(100));
        assert_eq!(settings.backoff.max_attempts, 10);
        assert_eq!(settings.stale.default_threshold_ms, 30_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings = SyncSettings::from_json_str(
            r#"{
                "source": { "endpoint": "ws://feed.local/ws", "topics": ["price:AAPL", "news:GLOBAL"] },
                "stale": { "classThresholdsMs": { "news": 300000 } },
                "tickIntervalMs": 16
            }"#,
        )
        .unwrap();

        assert_eq!(settings.source.endpoint, "ws://feed.local/ws");
        assert_eq!(settings.source.heartbeat_interval_ms, 10_000);
        assert_eq!(settings.backoff, BackoffPolicy::default());
        assert_eq!(settings.tick_interval_ms, 16);
        assert_eq!(settings.topics().len(), 2);
        assert_eq!(settings.stale.threshold_for(&Topic::new("news:GLOBAL").unwrap()), 300_000);
        assert_eq!(settings.stale.threshold_for(&Topic::new("price:AAPL").unwrap()), 30_000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            SyncSettings::from_json_str(r#"{ "tickIntervalMs": 0 }"#),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            SyncSettings::from_json_str(r#"{ "backoff": { "baseMs": 5000, "capMs": 1000 } }"#),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            SyncSettings::from_json_str(r#"{ "source": { "topics": ["price:AAPL", " "] } }"#),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            SyncSettings::from_json_str("{ not json"),
            Err(SettingsError::JsonError(_))
        ));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "backoff": {{ "maxAttempts": 3, "jitter": false }}, "tickIntervalMs": 50 }}"#
        )
        .unwrap();

        let settings = SyncSettings::from_json_file(file.path()).unwrap();
        assert_eq!(settings.backoff.max_attempts, 3);
        assert!(!settings.backoff.jitter);
        assert_eq!(settings.tick_interval_ms, 50);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SyncSettings::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(result, Err(SettingsError::IoError(_))));
    }
}
