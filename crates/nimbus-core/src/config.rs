//! Configuration system for Nimbus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $NIMBUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/nimbus/config.toml
//!   3. ~/.config/nimbus/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub privacy: PrivacyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The directory tree under synchronization.
    pub cloud_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfer chunk size in bytes.
    pub chunk_size: u32,
    /// Ceiling on concurrently dispatched operations.
    pub max_concurrent_operations: usize,
    /// Seconds between client-side synchronization ticks.
    pub sync_interval_secs: u64,
    /// Seconds between retries of transiently failed file operations.
    pub retry_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// When true, file contents and names leave this host obfuscated.
    pub zero_knowledge: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            transfer: TransferConfig::default(),
            privacy: PrivacyConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cloud_root: data_dir().join("cloud"),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::wire::DEFAULT_CHUNK_SIZE,
            max_concurrent_operations: 3,
            sync_interval_secs: 60,
            retry_interval_secs: 1,
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            zero_knowledge: false,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("nimbus")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("nimbus")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SyncConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SyncConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("NIMBUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SyncConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply NIMBUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NIMBUS_STORAGE__CLOUD_ROOT") {
            self.storage.cloud_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NIMBUS_TRANSFER__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_TRANSFER__MAX_CONCURRENT_OPERATIONS") {
            if let Ok(n) = v.parse() {
                self.transfer.max_concurrent_operations = n;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_TRANSFER__SYNC_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.transfer.sync_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("NIMBUS_PRIVACY__ZERO_KNOWLEDGE") {
            self.privacy.zero_knowledge = v == "true" || v == "1";
        }
    }
}
