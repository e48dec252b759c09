//! PriceMesh Settings
//!
//! JSON config file management for the oracle node: the topic list the
//! aggregator app supervises plus cluster timing knobs. A generic
//! [`Settings`] wrapper handles the load/save plumbing so the admin
//! refresh path can re-read the file atomically.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use pricemesh_core::{TopicConfig, MIN_AGGREGATE_INTERVAL_MS};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    ReadError(String),
    #[error("failed to write settings: {0}")]
    WriteError(String),
    #[error("failed to parse settings: {0}")]
    ParseError(String),
    #[error("failed to create directory: {0}")]
    CreateDirError(String),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Generic settings wrapper for any serializable config type.
pub struct Settings<T> {
    pub config: T,
    path: PathBuf,
}

impl<T: Serialize + DeserializeOwned + Default> Settings<T> {
    /// Load settings from `custom_path`, or the default node settings path,
    /// creating the file with defaults if it does not exist.
    pub fn load_or_default(custom_path: Option<&Path>) -> Result<Self> {
        let path = match custom_path {
            Some(p) => p.to_path_buf(),
            None => default_settings_path(),
        };

        if path.exists() {
            debug!("loading settings from {}", path.display());
            let content =
                fs::read_to_string(&path).map_err(|e| SettingsError::ReadError(e.to_string()))?;
            let config: T = serde_json::from_str(&content)
                .map_err(|e| SettingsError::ParseError(e.to_string()))?;
            Ok(Self { config, path })
        } else {
            debug!("creating default settings at {}", path.display());
            let settings = Self {
                config: T::default(),
                path,
            };
            settings.save()?;
            Ok(settings)
        }
    }

    /// Save current settings to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SettingsError::CreateDirError(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(&self.config)
            .map_err(|e| SettingsError::WriteError(e.to_string()))?;
        fs::write(&self.path, content).map_err(|e| SettingsError::WriteError(e.to_string()))
    }

    /// Get the path where settings are stored.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Default settings file path for the node.
pub fn default_settings_path() -> PathBuf {
    pricemesh_keystore::default_config_dir().join("settings.json")
}

/// Raft timing knobs, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftTuning {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_ms: u64,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_ms: 50,
        }
    }
}

/// Top-level node settings: the supervised topics plus cluster timing.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NodeSettings {
    pub topics: Vec<TopicConfig>,
    #[serde(default)]
    pub raft: RaftTuning,
}

impl NodeSettings {
    /// Reject duplicate topic ids and sub-minimum intervals.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for topic in &self.topics {
            if !seen.insert(topic.id) {
                return Err(SettingsError::Invalid(format!(
                    "duplicate topic id {}",
                    topic.id
                )));
            }
            if topic.aggregate_interval < MIN_AGGREGATE_INTERVAL_MS {
                return Err(SettingsError::Invalid(format!(
                    "topic {} aggregate interval {} ms below minimum {} ms",
                    topic.id, topic.aggregate_interval, MIN_AGGREGATE_INTERVAL_MS
                )));
            }
        }
        if self.raft.election_timeout_min_ms == 0
            || self.raft.election_timeout_max_ms < self.raft.election_timeout_min_ms
        {
            return Err(SettingsError::Invalid(
                "election timeout range is empty".to_string(),
            ));
        }
        Ok(())
    }
}
