//! Configuration types for nslog
//!
//! The metadata services are configured from a flat string map (the form in
//! which an embedding server hands its settings down) or directly through
//! the serde-friendly structs below.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Key holding the path of the changelog file
pub const KEY_CHANGELOG_PATH: &str = "changelog_path";
/// Key switching the store into follower (read-only) mode
pub const KEY_SLAVE_MODE: &str = "slave_mode";
/// Key holding the follower poll interval in microseconds
pub const KEY_POLL_INTERVAL_US: &str = "poll_interval_us";
/// Key controlling fsync after every appended record
pub const KEY_SYNC_ON_WRITE: &str = "sync_on_write";

/// Default follower poll interval
pub const DEFAULT_POLL_INTERVAL_US: u64 = 1000;

/// Configuration of one changelog-backed metadata store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the changelog file
    pub changelog_path: PathBuf,
    /// Follow another process's log instead of writing our own
    pub slave_mode: bool,
    /// Follower poll interval (microseconds)
    pub poll_interval_us: u64,
    /// Sync after every appended record
    pub sync_on_write: bool,
}

impl StoreConfig {
    /// Master-mode configuration for the given log
    pub fn new(changelog_path: impl AsRef<Path>) -> Self {
        Self {
            changelog_path: changelog_path.as_ref().to_path_buf(),
            slave_mode: false,
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
            sync_on_write: true,
        }
    }

    /// Slave-mode configuration following the given log
    pub fn slave(changelog_path: impl AsRef<Path>) -> Self {
        Self {
            slave_mode: true,
            ..Self::new(changelog_path)
        }
    }

    /// Build a configuration from a string map
    ///
    /// `changelog_path` is required; everything else falls back to defaults.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let path = map
            .get(KEY_CHANGELOG_PATH)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::ConfigMissing(KEY_CHANGELOG_PATH.to_string()))?;

        let mut config = Self::new(path);

        if let Some(value) = map.get(KEY_SLAVE_MODE) {
            config.slave_mode = parse_bool(KEY_SLAVE_MODE, value)?;
        }

        if let Some(value) = map.get(KEY_POLL_INTERVAL_US) {
            config.poll_interval_us = value.trim().parse().map_err(|_| Error::ConfigInvalid {
                key: KEY_POLL_INTERVAL_US.to_string(),
                value: value.clone(),
            })?;
        }

        if let Some(value) = map.get(KEY_SYNC_ON_WRITE) {
            config.sync_on_write = parse_bool(KEY_SYNC_ON_WRITE, value)?;
        }

        Ok(config)
    }

    /// Follower poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.max(1))
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::ConfigInvalid {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Configuration of a complete namespace (both stores)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Container store
    pub containers: StoreConfig,
    /// File store
    pub files: StoreConfig,
}

impl NamespaceConfig {
    /// Master namespace with both logs inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            containers: StoreConfig::new(dir.join("directories.mdlog")),
            files: StoreConfig::new(dir.join("files.mdlog")),
        }
    }

    /// Slave namespace following the logs inside `dir`
    pub fn slave_in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            containers: StoreConfig::slave(dir.join("directories.mdlog")),
            files: StoreConfig::slave(dir.join("files.mdlog")),
        }
    }

    /// Whether the namespace follows another writer
    #[must_use]
    pub fn is_slave(&self) -> bool {
        self.containers.slave_mode || self.files.slave_mode
    }
}
