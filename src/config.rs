// src/config.rs

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime tunables for a playback session. Every field has a default, so a
/// config file only needs the keys it wants to override.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Period of the drift correction pass.
    pub drift_interval_ms: u64,
    /// Max distance from the mean position before an engine is re-seeked.
    pub drift_tolerance_secs: f64,
    /// Period of the UI clock (one animation frame).
    pub clock_interval_ms: u64,
    /// Step of the skip back / skip forward controls.
    pub skip_secs: f64,
    /// Number of peaks computed per stem at ingestion.
    pub peak_count: usize,
    /// Per-engine decode buffer, in interleaved samples.
    pub ring_buffer_samples: usize,
    /// Fade-in applied after every seek to avoid clicks.
    pub seek_fade_ms: u32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            drift_interval_ms: 100,
            drift_tolerance_secs: 0.05,
            clock_interval_ms: 16,
            skip_secs: 5.0,
            peak_count: 1000,
            ring_buffer_samples: 131_072,
            seek_fade_ms: 10,
        }
    }
}

impl PlayerConfig {
    pub fn drift_interval(&self) -> Duration {
        Duration::from_millis(self.drift_interval_ms.max(1))
    }

    pub fn clock_interval(&self) -> Duration {
        Duration::from_millis(self.clock_interval_ms.max(1))
    }

    pub fn load_from_disk(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Missing file means defaults; a file that exists but does not parse is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::load_from_disk(path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn save_to_disk(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(write_err)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlayerConfig::default();
        assert_eq!(config.drift_interval(), Duration::from_millis(100));
        assert_eq!(config.drift_tolerance_secs, 0.05);
        assert_eq!(config.skip_secs, 5.0);
        assert_eq!(config.peak_count, 1000);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        std::fs::write(&path, r#"{ "drift_tolerance_secs": 0.02 }"#).unwrap();

        let config = PlayerConfig::load_from_disk(&path).unwrap();
        assert_eq!(config.drift_tolerance_secs, 0.02);
        assert_eq!(config.drift_interval_ms, 100);
        assert_eq!(config.clock_interval_ms, 16);
    }

    #[test]
    fn test_missing_file_is_default_but_garbage_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert_eq!(PlayerConfig::load_or_default(&missing).unwrap(), PlayerConfig::default());

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(
            PlayerConfig::load_or_default(&broken),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        let config = PlayerConfig {
            skip_secs: 10.0,
            ..PlayerConfig::default()
        };
        config.save_to_disk(&path).unwrap();
        assert_eq!(PlayerConfig::load_from_disk(&path).unwrap(), config);
    }
}
