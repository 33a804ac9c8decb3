//! Migration options and file configuration.
//!
//! [`MigrationOptions`] is the surface the orchestrator consumes. [`Config`]
//! is the on-disk TOML document the binary loads; every section defaults so
//! an empty file is valid:
//!
//! ```toml
//! [migration]
//! to = "dst-host"
//! pre_dump = "auto"
//!
//! [storage]
//! docker_root = "/var/lib/docker"
//! driver = "aufs"
//!
//! [checkpoint]
//! timeout = "10m"
//! ```

use crate::constants::{
    CHECKPOINT_TIMEOUT, DEFAULT_CONTROL_PORT, DEFAULT_CRIU_BIN, DEFAULT_DOCKER_BIN,
    DEFAULT_DOCKER_ROOT, DEFAULT_GRAPH_DRIVER, DEFAULT_LOG_DIR, DEFAULT_RSYNC_BIN,
    DEFAULT_WORK_DIR, MAX_CHAIN_DEPTH, PEER_REQUEST_TIMEOUT, TRANSFER_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::resolver::{ResolverOptions, StorageLayout};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Migration Options
// =============================================================================

/// How the workload is moved.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    /// Iterative pre-copy while the container runs, then stop-and-copy.
    #[default]
    Live,
    /// Stop-and-copy only.
    Restart,
}

impl MigrationMode {
    pub fn is_live(self) -> bool {
        self == Self::Live
    }
}

impl std::fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

/// Whether iterative pre-dumps are used.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PreDumpMode {
    /// Ask the checkpoint tool whether memory dirty tracking works.
    #[default]
    Auto,
    /// Always pre-dump.
    Enabled,
    /// Never pre-dump.
    Disabled,
}

/// Options consumed by the migration orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    /// Skip every compatibility check.
    pub force: bool,
    /// Skip the CPU descriptor check.
    pub skip_cpu_check: bool,
    /// Skip the checkpoint tool version check.
    pub skip_tool_version_check: bool,
    /// Pre-dump policy.
    pub pre_dump: PreDumpMode,
    /// Destination host.
    pub to: String,
}

// =============================================================================
// File Configuration
// =============================================================================

/// Complete configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub migration: MigrationSection,
    pub storage: StorageSection,
    pub checkpoint: CheckpointSection,
    pub transfer: TransferSection,
    pub peer: PeerSection,
}

/// `[migration]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    pub mode: MigrationMode,
    #[serde(flatten)]
    pub options: MigrationOptions,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Container engine storage root.
    pub docker_root: PathBuf,
    /// Graph driver name.
    pub driver: String,
    /// Maximum parent links per chain walk.
    pub max_chain_depth: usize,
    /// Reject ambiguous id prefixes.
    pub strict_prefix: bool,
}

/// `[checkpoint]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub docker_bin: PathBuf,
    pub criu_bin: PathBuf,
    /// Directory receiving dump/restore logs.
    pub log_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// `[transfer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    pub rsync_bin: PathBuf,
    /// Work directory for checkpoint images; same path on both hosts.
    pub work_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Keep image directories after a successful migration.
    pub keep_images: bool,
}

/// `[peer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    /// Control port on the destination.
    pub port: u16,
    /// Listen address for `serve`.
    pub listen: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            docker_root: PathBuf::from(DEFAULT_DOCKER_ROOT),
            driver: DEFAULT_GRAPH_DRIVER.to_string(),
            max_chain_depth: MAX_CHAIN_DEPTH,
            strict_prefix: false,
        }
    }
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            docker_bin: PathBuf::from(DEFAULT_DOCKER_BIN),
            criu_bin: PathBuf::from(DEFAULT_CRIU_BIN),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            timeout: CHECKPOINT_TIMEOUT,
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            rsync_bin: PathBuf::from(DEFAULT_RSYNC_BIN),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            timeout: TRANSFER_TIMEOUT,
            keep_images: false,
        }
    }
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_CONTROL_PORT,
            listen: format!("0.0.0.0:{DEFAULT_CONTROL_PORT}"),
            timeout: PEER_REQUEST_TIMEOUT,
        }
    }
}

impl StorageSection {
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.docker_root, &self.driver)
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            max_chain_depth: self.max_chain_depth,
            strict_prefix: self.strict_prefix,
        }
    }
}

impl Config {
    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parses a configuration document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the default file if it exists, defaults otherwise.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Returns `<config dir>/magikmigrate/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("magikmigrate").join("config.toml"))
    }

    fn validate(&self) -> Result<()> {
        if self.storage.max_chain_depth == 0 {
            return Err(Error::Config("storage.max_chain_depth must be > 0".into()));
        }
        if self.storage.driver.is_empty() || self.storage.driver.contains('/') {
            return Err(Error::Config(format!(
                "invalid storage.driver '{}'",
                self.storage.driver
            )));
        }
        if self.peer.port == 0 {
            return Err(Error::Config("peer.port must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.migration.mode, MigrationMode::Live);
        assert_eq!(config.migration.options.pre_dump, PreDumpMode::Auto);
        assert_eq!(config.storage.driver, "aufs");
        assert_eq!(config.peer.port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.checkpoint.timeout, CHECKPOINT_TIMEOUT);
    }

    #[test]
    fn test_sections_parse() {
        let config = Config::from_toml(
            r#"
            [migration]
            mode = "restart"
            to = "node-b"
            force = true
            pre_dump = "disabled"

            [storage]
            docker_root = "/data/docker"
            strict_prefix = true

            [transfer]
            timeout = "5m"
            "#,
        )
        .unwrap();

        assert_eq!(config.migration.mode, MigrationMode::Restart);
        assert_eq!(config.migration.options.to, "node-b");
        assert!(config.migration.options.force);
        assert_eq!(config.migration.options.pre_dump, PreDumpMode::Disabled);
        assert_eq!(config.storage.docker_root, PathBuf::from("/data/docker"));
        assert!(config.storage.resolver_options().strict_prefix);
        assert_eq!(config.transfer.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_toml("[storage]\nmax_chain_depth = 0").is_err());
        assert!(Config::from_toml("[storage]\ndriver = \"../x\"").is_err());
        assert!(Config::from_toml("[migration]\npre_dump = \"sometimes\"").is_err());
    }
}
