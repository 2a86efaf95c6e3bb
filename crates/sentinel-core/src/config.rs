//! Configuration for the checkpoint subsystem.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`SENTINEL_CHECKPOINT__` prefix)
//! 2. Config file (`sentinel.toml`, `[checkpoint]` section)
//! 3. Defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SentinelError;

/// Checkpoint store and command-layer settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CheckpointConfig {
    /// Root directory holding one subdirectory per engagement.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Fixed part of the save timeout, in seconds.
    #[serde(default = "default_save_base_secs")]
    pub save_timeout_base_secs: u64,

    /// Extra save time granted per agent or finding row, in milliseconds.
    #[serde(default = "default_save_per_row_ms")]
    pub save_timeout_per_row_ms: u64,

    /// Timeout for a single verification, in seconds.
    #[serde(default = "default_verify_secs")]
    pub verify_timeout_secs: u64,
}

impl CheckpointConfig {
    pub fn save_timeout_base(&self) -> Duration {
        Duration::from_secs(self.save_timeout_base_secs)
    }

    pub fn save_timeout_per_row(&self) -> Duration {
        Duration::from_millis(self.save_timeout_per_row_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_save_base_secs() -> u64 {
    30
}

fn default_save_per_row_ms() -> u64 {
    5
}

fn default_verify_secs() -> u64 {
    5
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            save_timeout_base_secs: default_save_base_secs(),
            save_timeout_per_row_ms: default_save_per_row_ms(),
            verify_timeout_secs: default_verify_secs(),
        }
    }
}

/// Load the `[checkpoint]` section from `{file_prefix}.toml` and the environment.
///
/// A missing file or section falls back to defaults; a present but
/// malformed section is an error.
pub fn load(file_prefix: &str) -> Result<CheckpointConfig, SentinelError> {
    // SENTINEL_CHECKPOINT__ROOT_DIR → checkpoint.root_dir
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("SENTINEL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    match cfg.get::<CheckpointConfig>("checkpoint") {
        Ok(c) => Ok(c),
        Err(config::ConfigError::NotFound(_)) => Ok(CheckpointConfig::default()),
        Err(e) => Err(e.into()),
    }
}
