//! Service configuration
//!
//! Loaded from a JSON file. Every field has a default, so `{}` (plus a
//! `data_dir`) is a complete configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binlog::{ChecksumAlg, KeyProvider, StaticKeyProvider, StoreOptions};
use crate::group_commit::GroupCommitConfig;
use crate::recovery::{HeuristicRecover, RecoveryOptions};
use crate::tc::TcBackend;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub key_version: u32,
    /// Key material, base64; at least 16 bytes once decoded
    pub key_base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_log_basename")]
    pub log_basename: String,

    /// Rotate once the active file reaches this size
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// fsync every N commits; 0 leaves syncing to the OS
    #[serde(default = "default_sync_period")]
    pub sync_period: u32,

    /// "crc32" or "none"
    #[serde(default = "default_checksum")]
    pub checksum: String,

    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,

    #[serde(default)]
    pub group_commit_wait_count: usize,

    #[serde(default)]
    pub group_commit_wait_usec: u64,

    #[serde(default)]
    pub tc_backend: TcBackend,

    #[serde(default = "default_tc_mmap_size")]
    pub tc_mmap_size: usize,

    #[serde(default = "default_tc_page_size")]
    pub tc_page_size: usize,

    #[serde(default)]
    pub gtid_domain_id: u32,

    #[serde(default = "default_server_id")]
    pub server_id: u32,

    #[serde(default)]
    pub gtid_strict_mode: bool,

    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    #[serde(default)]
    pub truncate_on_recovery: bool,

    #[serde(default)]
    pub heuristic_recover: HeuristicRecover,

    /// Keep at most this many files after a rotation; 0 never purges
    #[serde(default)]
    pub expire_logs_keep: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./binlog-data")
}
fn default_log_basename() -> String {
    "binlog".to_string()
}
fn default_max_file_size() -> u64 {
    1 << 30
} // 1 GiB
fn default_sync_period() -> u32 {
    1
}
fn default_checksum() -> String {
    "crc32".to_string()
}
fn default_tc_mmap_size() -> usize {
    24 * 1024
}
fn default_tc_page_size() -> usize {
    4096
}
fn default_server_id() -> u32 {
    1
}
fn default_max_cache_size() -> usize {
    4 << 20
}

impl Default for BinlogConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_basename: default_log_basename(),
            max_file_size: default_max_file_size(),
            sync_period: default_sync_period(),
            checksum: default_checksum(),
            encryption: None,
            group_commit_wait_count: 0,
            group_commit_wait_usec: 0,
            tc_backend: TcBackend::default(),
            tc_mmap_size: default_tc_mmap_size(),
            tc_page_size: default_tc_page_size(),
            gtid_domain_id: 0,
            server_id: default_server_id(),
            gtid_strict_mode: false,
            max_cache_size: default_max_cache_size(),
            truncate_on_recovery: false,
            heuristic_recover: HeuristicRecover::Off,
            expire_logs_keep: 0,
        }
    }
}

impl BinlogConfig {
    /// Defaults rooted at `data_dir`
    pub fn for_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BinlogConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.log_basename.is_empty()
            || self
                .log_basename
                .contains(|c: char| c == '/' || c == '\\' || c == '.' || c.is_whitespace())
        {
            return Err(ConfigError::Invalid(format!(
                "log_basename '{}' must be a plain file name without dots",
                self.log_basename
            )));
        }
        if self.max_file_size < 4096 {
            return Err(ConfigError::Invalid("max_file_size must be at least 4096".into()));
        }
        self.checksum_alg()?;
        if self.max_cache_size == 0 {
            return Err(ConfigError::Invalid("max_cache_size must be > 0".into()));
        }
        if self.tc_page_size < 64 || !self.tc_page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(
                "tc_page_size must be a power of two of at least 64".into(),
            ));
        }
        if self.tc_mmap_size < 3 * self.tc_page_size || self.tc_mmap_size % self.tc_page_size != 0 {
            return Err(ConfigError::Invalid(
                "tc_mmap_size must be a multiple of tc_page_size holding at least three pages".into(),
            ));
        }
        if self.truncate_on_recovery && self.heuristic_recover != HeuristicRecover::Off {
            return Err(ConfigError::Invalid(
                "truncate_on_recovery and heuristic_recover are mutually exclusive".into(),
            ));
        }
        self.key_provider()?;
        Ok(())
    }

    pub fn checksum_alg(&self) -> ConfigResult<ChecksumAlg> {
        ChecksumAlg::from_name(&self.checksum).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "checksum '{}' must be 'crc32' or 'none'",
                self.checksum
            ))
        })
    }

    pub fn key_provider(&self) -> ConfigResult<Option<Arc<dyn KeyProvider>>> {
        match &self.encryption {
            None => Ok(None),
            Some(enc) => {
                let provider = StaticKeyProvider::from_base64(enc.key_version, &enc.key_base64)
                    .map_err(|e| ConfigError::Invalid(format!("encryption key: {}", e.message())))?;
                Ok(Some(Arc::new(provider)))
            }
        }
    }

    pub fn store_options(&self) -> ConfigResult<StoreOptions> {
        Ok(StoreOptions {
            dir: self.data_dir.clone(),
            basename: self.log_basename.clone(),
            max_file_size: self.max_file_size,
            sync_period: self.sync_period,
            checksum: self.checksum_alg()?,
            keys: self.key_provider()?,
        })
    }

    pub fn recovery_options(&self) -> ConfigResult<RecoveryOptions> {
        let mut options = RecoveryOptions::new(&self.data_dir, self.log_basename.clone());
        options.keys = self.key_provider()?;
        options.truncate_on_recovery = self.truncate_on_recovery;
        options.heuristic = self.heuristic_recover;
        Ok(options)
    }

    pub fn group_commit_config(&self) -> GroupCommitConfig {
        GroupCommitConfig {
            wait_count: self.group_commit_wait_count,
            wait_usec: self.group_commit_wait_usec,
            domain_id: self.gtid_domain_id,
            server_id: self.server_id,
        }
    }

    /// Position state file written at clean shutdown
    pub fn state_file_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.state", self.log_basename))
    }

    pub fn tc_journal_path(&self) -> PathBuf {
        self.data_dir.join(crate::tc::JOURNAL_FILE_NAME)
    }
}
