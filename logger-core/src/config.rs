//! Logger and backend configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Data logger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Name used in log messages
    pub name: String,
    /// RAM coalescing buffer size in bytes (0 disables buffering)
    pub ram_buffer_size: usize,
    /// Grace period before the backend is released after an access
    pub power_release_delay_ms: u64,
    /// Recovery scan budget in erase units
    pub scan_erase_units: u32,
    /// Run the logger on a dedicated worker
    pub offload: Option<OffloadConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            name: "data_logger".to_string(),
            ram_buffer_size: 0,
            power_release_delay_ms: 100,
            scan_erase_units: 2,
            offload: None,
        }
    }
}

impl LoggerConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_erase_units == 0 {
            return Err(ConfigError::Invalid(
                "scan_erase_units must be at least 1".to_string(),
            ));
        }
        if self.ram_buffer_size > u16::MAX as usize * 16 {
            return Err(ConfigError::Invalid(format!(
                "ram_buffer_size of {} bytes is too large",
                self.ram_buffer_size
            )));
        }
        if let Some(offload) = &self.offload {
            offload.validate()?;
        }
        Ok(())
    }

    pub fn power_release_delay(&self) -> Duration {
        Duration::from_millis(self.power_release_delay_ms)
    }
}

/// Offload worker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Records that may wait for the worker
    pub queue_depth: usize,
    /// Largest record the queue accepts
    pub max_record_size: usize,
    /// Longest the worker sleeps between watchdog feeds
    pub watchdog_period_ms: u64,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            queue_depth: 16,
            max_record_size: 512,
            watchdog_period_ms: 1000,
        }
    }
}

impl OffloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be non-zero".to_string()));
        }
        if self.max_record_size == 0 {
            return Err(ConfigError::Invalid(
                "max_record_size must be non-zero".to_string(),
            ));
        }
        if self.watchdog_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "watchdog_period_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }
}

/// Geometry of a file backed log image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileBackendConfig {
    pub block_size: u16,
    pub erase_size: u16,
    pub erase_val: u8,
    /// Lifetime block limit, defaults to the largest the medium can address
    pub logical_blocks: Option<u32>,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            erase_size: 4096,
            erase_val: 0xFF,
            logical_blocks: None,
        }
    }
}

impl FileBackendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.block_size as usize) < crate::header::BlockHeader::SIZE {
            return Err(ConfigError::Invalid(format!(
                "block_size of {} bytes cannot hold a block header",
                self.block_size
            )));
        }
        if self.erase_size == 0 || self.erase_size % self.block_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "erase_size {} is not a non-zero multiple of block_size {}",
                self.erase_size, self.block_size
            )));
        }
        if self.logical_blocks == Some(0) {
            return Err(ConfigError::Invalid("logical_blocks must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_partial_json() {
        let config = LoggerConfig::from_json_str(r#"{ "name": "flash", "offload": {} }"#).unwrap();
        assert_eq!(config.name, "flash");
        assert_eq!(config.power_release_delay_ms, 100);
        assert_eq!(config.scan_erase_units, 2);
        assert_eq!(config.offload, Some(OffloadConfig::default()));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = LoggerConfig::from_json_str(r#"{ "offload": { "queue_depth": 0 } }"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = LoggerConfig::from_json_str(r#"{ "scan_erase_units": 0 }"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = LoggerConfig::from_json_str("{ not json");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_file_backend_geometry_checks() {
        assert!(FileBackendConfig::default().validate().is_ok());

        let uneven = FileBackendConfig {
            block_size: 512,
            erase_size: 1000,
            ..FileBackendConfig::default()
        };
        assert!(uneven.validate().is_err());

        let tiny = FileBackendConfig {
            block_size: 1,
            erase_size: 1,
            ..FileBackendConfig::default()
        };
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logger.json");
        std::fs::write(&path, r#"{ "ram_buffer_size": 4096 }"#).unwrap();

        let config = LoggerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.ram_buffer_size, 4096);
        assert_eq!(config.offload, None);
    }
}
