use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// In-process tuning for the transfer engine and scheduler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub chunk_attempts: u32,
    pub retry_backoff: Duration,
    pub progress_interval: Duration,
    pub notify_interval: Duration,
    pub persist_interval: Duration,
    pub speed_window: usize,
    pub min_sample_interval: Duration,
    pub buffer_size: usize,
    pub temp_dir_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: "fetchq/0.1".to_string(),
            request_timeout: Duration::from_secs(60),
            chunk_attempts: 1,
            retry_backoff: Duration::from_secs(1),
            progress_interval: Duration::from_millis(250),
            notify_interval: Duration::from_millis(500),
            persist_interval: Duration::from_secs(2),
            speed_window: 10,
            min_sample_interval: Duration::from_millis(100),
            buffer_size: 64 * 1024,
            temp_dir_name: ".temp".to_string(),
        }
    }
}

/// User settings persisted through the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_concurrent_downloads: usize,
    pub num_connections: u32,
    pub auto_extract: bool,
    pub auto_convert: bool,
    pub move_to_secondary: bool,
    pub secondary_root: Option<PathBuf>,
    pub download_root: Option<PathBuf>,
    pub converter_path: Option<PathBuf>,
    pub max_history: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 1,
            num_connections: 100,
            auto_extract: false,
            auto_convert: false,
            move_to_secondary: false,
            secondary_root: None,
            download_root: None,
            converter_path: None,
            max_history: 100,
        }
    }
}

impl Settings {
    /// Concurrency limit as used for admission; never below one slot.
    pub fn slot_limit(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }

    pub fn connection_count(&self) -> u32 {
        self.num_connections.max(1)
    }

    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(value) = patch.max_concurrent_downloads {
            self.max_concurrent_downloads = value;
        }
        if let Some(value) = patch.num_connections {
            self.num_connections = value;
        }
        if let Some(value) = patch.auto_extract {
            self.auto_extract = value;
        }
        if let Some(value) = patch.auto_convert {
            self.auto_convert = value;
        }
        if let Some(value) = patch.move_to_secondary {
            self.move_to_secondary = value;
        }
        if let Some(value) = &patch.secondary_root {
            self.secondary_root = value.clone();
        }
        if let Some(value) = &patch.download_root {
            self.download_root = value.clone();
        }
        if let Some(value) = &patch.converter_path {
            self.converter_path = value.clone();
        }
        if let Some(value) = patch.max_history {
            self.max_history = value;
        }
    }
}

/// Partial settings update. `Some(None)` clears an optional path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub max_concurrent_downloads: Option<usize>,
    pub num_connections: Option<u32>,
    pub auto_extract: Option<bool>,
    pub auto_convert: Option<bool>,
    pub move_to_secondary: Option<bool>,
    pub secondary_root: Option<Option<PathBuf>>,
    pub download_root: Option<Option<PathBuf>>,
    pub converter_path: Option<Option<PathBuf>>,
    pub max_history: Option<usize>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.max_concurrent_downloads, 1);
        assert_eq!(settings.num_connections, 100);
        assert_eq!(settings.max_history, 100);
        assert!(!settings.auto_extract);

        let config = EngineConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.progress_interval, Duration::from_millis(250));
        assert_eq!(config.speed_window, 10);
    }

    #[test]
    fn patch_overrides_only_given_fields() {
        let mut settings = Settings::default();
        settings.apply(&SettingsPatch {
            max_concurrent_downloads: Some(3),
            secondary_root: Some(Some(PathBuf::from("/mnt/usb"))),
            ..SettingsPatch::default()
        });
        assert_eq!(settings.max_concurrent_downloads, 3);
        assert_eq!(settings.secondary_root, Some(PathBuf::from("/mnt/usb")));
        assert_eq!(settings.num_connections, 100);

        settings.apply(&SettingsPatch {
            secondary_root: Some(None),
            ..SettingsPatch::default()
        });
        assert_eq!(settings.secondary_root, None);
    }

    #[test]
    fn slot_limit_never_zero() {
        let settings = Settings {
            max_concurrent_downloads: 0,
            num_connections: 0,
            ..Settings::default()
        };
        assert_eq!(settings.slot_limit(), 1);
        assert_eq!(settings.connection_count(), 1);
    }

    #[test]
    fn settings_json_fills_missing_fields() {
        let settings: Settings = serde_json::from_str(r#"{"auto_extract": true}"#).unwrap();
        assert!(settings.auto_extract);
        assert_eq!(settings.num_connections, 100);
    }
}
