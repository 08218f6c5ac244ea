//! Client configuration file parsing (.surfsync.toml)

use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::{WrapErr, ensure};

use crate::chunker::DEFAULT_BLOCK_SIZE;
use crate::protocol::MAX_BLOCK_SIZE;

/// Config file name
pub const CONFIG_FILE: &str = ".surfsync.toml";

/// Per-directory client configuration
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct SurfConfig {
    /// Metadata service address (`host:port`)
    pub meta_addr: Option<String>,

    /// Block size in bytes used for chunking
    pub block_size: usize,

    /// RPC timeouts
    pub timeouts: Timeouts,
}

impl Default for SurfConfig {
    fn default() -> Self {
        Self {
            meta_addr: None,
            block_size: DEFAULT_BLOCK_SIZE,
            timeouts: Timeouts::default(),
        }
    }
}

/// RPC timeout configuration in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Applied to block reads and presence checks
    pub read_ms: u64,
    /// Applied to block writes and every metadata call
    pub write_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read_ms: 1000,
            write_ms: 5000,
        }
    }
}

impl Timeouts {
    #[must_use]
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    #[must_use]
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }
}

impl SurfConfig {
    /// Load config from the base directory.
    ///
    /// Returns default config if .surfsync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed, or if its
    /// block size is out of range.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        check_block_size(config.block_size)
            .wrap_err_with(|| format!("invalid {}", config_path.display()))?;
        Ok(config)
    }
}

/// Ensure every block of this size fits in one protocol frame
///
/// # Errors
/// Returns an error for zero or for sizes above [`MAX_BLOCK_SIZE`].
pub fn check_block_size(block_size: usize) -> color_eyre::Result<()> {
    ensure!(block_size > 0, "block size must be positive");
    ensure!(
        block_size <= MAX_BLOCK_SIZE,
        "block size {block_size} exceeds the {MAX_BLOCK_SIZE} byte limit"
    );
    Ok(())
}
