// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for monstack.
//!
//! A [`Config`] is built once at process start from `MONSTACK_*` environment
//! variables and then passed by reference to the snapshot and reconcile
//! subsystems. CLI flags override individual fields after loading.

use std::path::PathBuf;
use std::time::Duration;

/// Parse an env var into a bool with a default.
fn parse_env_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { var, value: v }),
        },
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value: v }),
        Err(_) => Ok(default),
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(var).unwrap_or_else(|_| default.to_string()))
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the backup store.
    pub backup_dir: PathBuf,
    /// Fixed snapshot name prefix used by the store.
    pub backup_prefix: String,
    /// Snapshots to keep after pruning (0 keeps everything).
    pub keep_count: u32,
    /// Whether new snapshots are compressed.
    pub compress: bool,
    /// Root directory under which stateful services keep their data.
    pub state_dir: PathBuf,
    /// Root directory holding rendered configuration.
    pub config_dir: PathBuf,
    /// Optional JSON file replacing the built-in service table.
    pub services_file: Option<PathBuf>,
    /// Container runtime CLI binary.
    pub runtime_bin: String,
    /// Upper bound for any single runtime call.
    pub runtime_timeout: Duration,
    /// Grace period given to a container before it is killed on stop.
    pub stop_grace: Duration,
    /// Pause before the single reconcile retry.
    pub retry_delay: Duration,
    /// cron.d file written by `install-trigger`.
    pub cron_file: PathBuf,
    /// Lock file the scheduled backup holds while running.
    pub lock_file: PathBuf,
    /// Skip the effective-uid check.
    pub skip_privilege_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/var/backups/monstack"),
            backup_prefix: "monstack".to_string(),
            keep_count: 7,
            compress: true,
            state_dir: PathBuf::from("/var/lib/monstack"),
            config_dir: PathBuf::from("/etc/monstack"),
            services_file: None,
            runtime_bin: "docker".to_string(),
            runtime_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            retry_delay: Duration::from_secs(2),
            cron_file: PathBuf::from("/etc/cron.d/monstack-backup"),
            lock_file: PathBuf::from("/run/monstack-backup.lock"),
            skip_privilege_check: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `MONSTACK_BACKUP_DIR` | `/var/backups/monstack` |
    /// | `MONSTACK_BACKUP_PREFIX` | `monstack` |
    /// | `MONSTACK_BACKUP_KEEP` | `7` |
    /// | `MONSTACK_BACKUP_COMPRESS` | `true` |
    /// | `MONSTACK_STATE_DIR` | `/var/lib/monstack` |
    /// | `MONSTACK_CONFIG_DIR` | `/etc/monstack` |
    /// | `MONSTACK_SERVICES_FILE` | - |
    /// | `MONSTACK_RUNTIME_BIN` | `docker` |
    /// | `MONSTACK_RUNTIME_TIMEOUT_SECS` | `30` |
    /// | `MONSTACK_STOP_GRACE_SECS` | `10` |
    /// | `MONSTACK_RETRY_DELAY_SECS` | `2` |
    /// | `MONSTACK_CRON_FILE` | `/etc/cron.d/monstack-backup` |
    /// | `MONSTACK_LOCK_FILE` | `/run/monstack-backup.lock` |
    /// | `MONSTACK_SKIP_PRIVILEGE_CHECK` | `false` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backup_prefix =
            std::env::var("MONSTACK_BACKUP_PREFIX").unwrap_or(defaults.backup_prefix);
        validate_prefix(&backup_prefix)?;

        let keep_count = parse_env_u64("MONSTACK_BACKUP_KEEP", defaults.keep_count as u64)?;
        let keep_count = u32::try_from(keep_count).map_err(|_| ConfigError::InvalidValue {
            var: "MONSTACK_BACKUP_KEEP",
            value: keep_count.to_string(),
        })?;

        let runtime_timeout_secs = parse_env_u64("MONSTACK_RUNTIME_TIMEOUT_SECS", 30)?;
        if runtime_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "MONSTACK_RUNTIME_TIMEOUT_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            backup_dir: env_path("MONSTACK_BACKUP_DIR", "/var/backups/monstack"),
            backup_prefix,
            keep_count,
            compress: parse_env_bool("MONSTACK_BACKUP_COMPRESS", defaults.compress)?,
            state_dir: env_path("MONSTACK_STATE_DIR", "/var/lib/monstack"),
            config_dir: env_path("MONSTACK_CONFIG_DIR", "/etc/monstack"),
            services_file: std::env::var("MONSTACK_SERVICES_FILE")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            runtime_bin: std::env::var("MONSTACK_RUNTIME_BIN").unwrap_or(defaults.runtime_bin),
            runtime_timeout: Duration::from_secs(runtime_timeout_secs),
            stop_grace: Duration::from_secs(parse_env_u64("MONSTACK_STOP_GRACE_SECS", 10)?),
            retry_delay: Duration::from_secs(parse_env_u64("MONSTACK_RETRY_DELAY_SECS", 2)?),
            cron_file: env_path("MONSTACK_CRON_FILE", "/etc/cron.d/monstack-backup"),
            lock_file: env_path("MONSTACK_LOCK_FILE", "/run/monstack-backup.lock"),
            skip_privilege_check: parse_env_bool("MONSTACK_SKIP_PRIVILEGE_CHECK", false)?,
        })
    }
}

/// Check that a snapshot prefix is a plain, non-hidden file name stem.
pub fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
    let valid = !prefix.is_empty()
        && !prefix.starts_with('.')
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidPrefix(prefix.to_string()))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// The snapshot prefix is not a plain file name stem.
    #[error("Invalid backup prefix: {0:?}")]
    InvalidPrefix(String),
    /// The service table file could not be read.
    #[error("Failed to read service table {path}: {source}")]
    ServicesFile {
        /// Path of the table.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The service table file is not valid JSON for a service list.
    #[error("Failed to parse service table {path}: {source}")]
    ServicesParse {
        /// Path of the table.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// The service table violates a structural rule.
    #[error("Invalid service table: {0}")]
    InvalidServiceTable(String),
}
