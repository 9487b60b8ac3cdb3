//! Pipeline configuration stored at `<home>/.tether/config.yaml`.
//!
//! Functions take the home directory explicitly so tests can point them at
//! a `TempDir`; callers resolve it with `dirs::home_dir()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths::{config_path, tether_root};
use crate::schema;
use crate::types::{DeviceTag, OwnerId, TableName, MAX_BATCH_SIZE};

/// Output format for the daemon's tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Where finished batches are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Write batch files into a local spool directory.
    Spool { dir: PathBuf },
    /// `PUT` batches to a collection server.
    Http { endpoint: String },
}

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Location tag of this (primary) device.
    pub device: DeviceTag,
    /// Owners always enumerated, even before they have any rows.
    #[serde(default)]
    pub owners: Vec<OwnerId>,
    /// Tables drained by each upload session.
    #[serde(default = "default_tables")]
    pub tables: Vec<TableName>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batch uploads allowed in flight at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub log_format: LogFormat,
    pub transport: TransportConfig,
}

fn default_tables() -> Vec<TableName> {
    schema::builtin_names()
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_max_in_flight() -> usize {
    4
}

fn default_write_timeout_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Config {
    pub fn new(device: DeviceTag, transport: TransportConfig) -> Self {
        Self {
            device,
            owners: Vec::new(),
            tables: default_tables(),
            batch_size: default_batch_size(),
            max_in_flight: default_max_in_flight(),
            write_timeout_ms: default_write_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            log_format: LogFormat::default(),
            transport,
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Reject values the pipeline cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.write_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.device.0.trim().is_empty() {
            return Err(ConfigError::Invalid("device tag is empty".to_string()));
        }
        if let Some(owner) = self.owners.iter().find(|o| o.0.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("empty owner id {owner:?}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.tether/config.yaml`.
///
/// Returns `ConfigError::NotFound` if absent and `ConfigError::Parse`
/// (with path + line context) if malformed.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path(home);
    if !path.exists() {
        return Err(ConfigError::NotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: Config =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// Atomically save the config.
///
/// Write flow: validate → serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &Config) -> Result<(), ConfigError> {
    config.validate()?;
    let root = tether_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root)?;
        set_dir_permissions(&root)?;
    }
    let path = config_path(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
