//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file is enough.

use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub cloud_storage: CloudStorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// strftime-style format used for backup timestamps
    #[serde(default = "default_time_format")]
    pub time_format: String,

    /// Rewrite Replicated*MergeTree engines to their plain counterparts on restore
    #[serde(default)]
    pub force_non_replicated: bool,

    /// Replica name substituted into replicated engines on restore
    #[serde(default)]
    pub override_replica_name: Option<String>,

    /// Compare each uploaded part against its remote copy
    #[serde(default)]
    pub validate_part_after_upload: bool,

    /// Reference parts already stored by previous backups instead of re-uploading them
    #[serde(default = "default_true")]
    pub deduplicate_parts: bool,

    /// Backups older than this are not used as deduplication sources
    #[serde(default = "default_dedup_age_limit")]
    pub deduplication_age_limit_days: i64,

    /// Location of the restore progress journal
    #[serde(default = "default_restore_context_path")]
    pub restore_context_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudStorageConfig {
    /// Encrypt object-storage shadow metadata
    #[serde(default = "default_true")]
    pub encryption: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_time_format() -> String {
    "%Y-%m-%d %H:%M:%S %z".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dedup_age_limit() -> i64 {
    7
}

fn default_restore_context_path() -> PathBuf {
    PathBuf::from("/tmp/ch_backup_restore_state.json")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            time_format: default_time_format(),
            force_non_replicated: false,
            override_replica_name: None,
            validate_part_after_upload: false,
            deduplicate_parts: true,
            deduplication_age_limit_days: default_dedup_age_limit(),
            restore_context_path: default_restore_context_path(),
        }
    }
}

impl Default for CloudStorageConfig {
    fn default() -> Self {
        Self { encryption: true }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
