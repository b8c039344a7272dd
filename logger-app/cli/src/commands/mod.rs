//! Subcommands of the wraplog tool

pub mod append;
pub mod erase;
pub mod export;
pub mod format;
pub mod info;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use wraplog::{DataLogger, FileBackend, FileBackendConfig, LoggerConfig};

/// Configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub logger: LoggerConfig,
    pub backend: FileBackendConfig,
}

/// Settings shared by every subcommand
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub config: ToolConfig,
}

impl ToolContext {
    /// Build the tool configuration from an optional file and flag overrides
    pub fn load(
        config_path: Option<&PathBuf>,
        block_size: Option<u16>,
        erase_size: Option<u16>,
    ) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str::<ToolConfig>(&contents)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => ToolConfig::default(),
        };

        if let Some(block_size) = block_size {
            config.backend.block_size = block_size;
        }
        if let Some(erase_size) = erase_size {
            config.backend.erase_size = erase_size;
        }
        // Erase units never smaller than a block
        if config.backend.erase_size < config.backend.block_size {
            config.backend.erase_size = config.backend.block_size;
        }

        config.logger.validate().context("Invalid logger configuration")?;
        config.backend.validate().context("Invalid backend configuration")?;
        Ok(Self { config })
    }

    /// Open an image and recover its log state
    pub async fn attach(&self, image: &Path, read_only: bool) -> Result<DataLogger<FileBackend>> {
        let backend = FileBackend::open(image, &self.config.backend, read_only)
            .await
            .with_context(|| format!("Failed to open image {}", image.display()))?;
        DataLogger::attach(backend, &self.config.logger)
            .await
            .with_context(|| format!("Failed to attach to {}", image.display()))
    }
}
