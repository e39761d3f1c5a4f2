//! Settings file and the typed configuration built from it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const DEFAULT_KERNEL: &str = "python3";

/// On-disk settings. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub history_size: usize,
    pub lock_timeout_secs: u64,
    pub lock_poll_interval_ms: u64,
    pub execution_timeout_secs: u64,
    pub default_kernel: String,
    pub create_missing_on_read: bool,
    pub kernel_startup_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            history_size: crate::history::DEFAULT_HISTORY_SIZE,
            lock_timeout_secs: 10,
            lock_poll_interval_ms: 100,
            execution_timeout_secs: 600,
            default_kernel: DEFAULT_KERNEL.to_string(),
            create_missing_on_read: true,
            kernel_startup_timeout_secs: 30,
        }
    }
}

/// Default location of the settings file.
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nbkeep")
        .join("settings.json")
}

/// Load settings from `path`, falling back to defaults if the file is
/// missing or unreadable.
pub fn load_settings_from(path: &Path) -> Settings {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("[config] No settings at {:?}, using defaults", path);
            return Settings::default();
        }
        Err(e) => {
            warn!("[config] Failed to read {:?}: {}", path, e);
            return Settings::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("[config] Invalid settings in {:?}: {}", path, e);
            Settings::default()
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

/// Configuration consumed by [`crate::NotebookManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub history_size: usize,
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
    pub execution_timeout: Duration,
    pub default_kernel: String,
    pub create_missing_on_read: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ManagerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            history_size: settings.history_size.max(1),
            lock_timeout: Duration::from_secs(settings.lock_timeout_secs),
            lock_poll_interval: Duration::from_millis(settings.lock_poll_interval_ms.max(1)),
            execution_timeout: Duration::from_secs(settings.execution_timeout_secs),
            default_kernel: settings.default_kernel.clone(),
            create_missing_on_read: settings.create_missing_on_read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.history_size, 10);
        assert_eq!(settings.lock_timeout_secs, 10);
        assert_eq!(settings.lock_poll_interval_ms, 100);
        assert_eq!(settings.execution_timeout_secs, 600);
        assert_eq!(settings.default_kernel, "python3");
        assert!(settings.create_missing_on_read);
        assert_eq!(settings.kernel_startup_timeout_secs, 30);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"history_size": 3, "default_kernel": "deno"}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.history_size, 3);
        assert_eq!(settings.default_kernel, "deno");
        assert_eq!(settings.lock_timeout_secs, 10);
    }

    #[test]
    fn test_missing_or_invalid_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            load_settings_from(&dir.path().join("absent.json")),
            Settings::default()
        );

        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load_settings_from(&path), Settings::default());
    }

    #[test]
    fn test_manager_config_from_settings() {
        let settings = Settings {
            lock_timeout_secs: 2,
            lock_poll_interval_ms: 0,
            execution_timeout_secs: 30,
            ..Settings::default()
        };
        let config = ManagerConfig::from(&settings);
        assert_eq!(config.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.lock_poll_interval, Duration::from_millis(1));
        assert_eq!(config.execution_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_settings_path_is_valid() {
        let path = settings_path();
        assert!(path.ends_with("nbkeep/settings.json"));
    }
}
