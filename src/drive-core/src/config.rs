use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{DriveError, DriveResult};

/// Tunables for the lifecycle core. All fields default, so a config file
/// only needs the values it wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// How long an idle closed file keeps its encryptor before the
    /// teardown flush.
    pub file_inactivity_delay_ms: u64,
    /// Debounce window between a directory mutation and its store.
    pub directory_inactivity_delay_ms: u64,
    /// Version history retained per directory.
    pub max_versions: usize,
    /// Worker threads of the timer executor. Floor of 2.
    pub timer_worker_threads: usize,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            file_inactivity_delay_ms: 5_000,
            directory_inactivity_delay_ms: 10_000,
            max_versions: 100,
            timer_worker_threads: 2,
        }
    }
}

impl DriveConfig {
    pub fn load_from_file(path: &Path) -> DriveResult<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| DriveError::Unknown(format!("read config failed: {}", e)))?;
        serde_json::from_str(&config_str)
            .map_err(|e| DriveError::ParsingError(format!("bad config: {}", e)))
    }

    pub fn file_inactivity_delay(&self) -> Duration {
        Duration::from_millis(self.file_inactivity_delay_ms)
    }

    pub fn directory_inactivity_delay(&self) -> Duration {
        Duration::from_millis(self.directory_inactivity_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriveConfig::default();
        assert_eq!(config.file_inactivity_delay(), Duration::from_secs(5));
        assert_eq!(config.directory_inactivity_delay(), Duration::from_secs(10));
        assert_eq!(config.max_versions, 100);
        assert_eq!(config.timer_worker_threads, 2);
    }

    #[test]
    fn test_partial_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.json");
        std::fs::write(&path, r#"{"max_versions": 7}"#).unwrap();
        let config = DriveConfig::load_from_file(&path).unwrap();
        assert_eq!(config.max_versions, 7);
        assert_eq!(config.file_inactivity_delay_ms, 5_000);
    }
}
