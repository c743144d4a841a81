//! Store configuration.
//!
//! This module defines the [`StoreConfig`] struct that represents
//! `store.yaml` under the store root. It supports forward-compatible YAML
//! parsing (unknown fields are ignored), sensible defaults for every field,
//! and validation of config values.
//!
//! The file is shared, read-mostly state: [`WatchedConfig`] caches the
//! parsed config and re-reads it only when the file's modification time
//! *or* byte length changes. Timestamp alone is not enough: filesystems
//! with coarse timestamp resolution can report an unchanged mtime for a
//! rewrite that happened within one tick.

use crate::error::{Result, StoreError};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Configuration for the object store engine.
///
/// This struct represents the contents of `store.yaml`. Unknown fields in
/// the YAML are ignored for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Default lock lease in minutes for engine operations that acquire or
    /// extend locks.
    pub lease_minutes: u32,

    /// Wake-up interval in milliseconds for blocked lock acquisitions.
    pub lock_poll_ms: u64,

    /// Whether held locks are mirrored to the lock-state directory so they
    /// survive a restart.
    pub persist_locks: bool,

    /// Compatibility flag: allow application-file operations without
    /// holding the owning artifact's lock. Kept for callers that predate
    /// artifact locking; not a general pattern.
    pub unlocked_file_ops: bool,

    /// Glob patterns for files the catalog scan and file operations ignore
    /// (temp files, move-aside backups, editor droppings).
    pub ignore_patterns: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lease_minutes: default_lease_minutes(),
            lock_poll_ms: default_lock_poll_ms(),
            persist_locks: true,
            unlocked_file_ops: false,
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

fn default_lease_minutes() -> u32 {
    20
}

fn default_lock_poll_ms() -> u64 {
    250
}

fn default_ignore_patterns() -> Vec<String> {
    vec![".*".to_string(), "*.tmp".to_string(), "*.bak-*".to_string()]
}

impl StoreConfig {
    /// Load config from a YAML file.
    ///
    /// Unknown fields in the YAML are silently ignored for forward
    /// compatibility.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| StoreError::io("read", path, e))?;
        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(yaml).map_err(|e| {
            StoreError::InvalidConfig {
                reason: format!("failed to parse YAML: {}", e),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize config to a YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| StoreError::InvalidConfig {
            reason: format!("failed to serialize to YAML: {}", e),
        })
    }

    /// Validate config values.
    ///
    /// Validation rules:
    /// - `lease_minutes` must be positive
    /// - `lock_poll_ms` must be positive
    /// - every `ignore_patterns` entry must be a valid glob
    pub fn validate(&self) -> Result<()> {
        if self.lease_minutes == 0 {
            return Err(StoreError::InvalidConfig {
                reason: "lease_minutes must be greater than 0".to_string(),
            });
        }

        if self.lock_poll_ms == 0 {
            return Err(StoreError::InvalidConfig {
                reason: "lock_poll_ms must be greater than 0".to_string(),
            });
        }

        self.ignore_set()?;
        Ok(())
    }

    /// Compile the ignore patterns into a matcher.
    pub fn ignore_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.ignore_patterns {
            let glob = Glob::new(pattern).map_err(|e| StoreError::InvalidConfig {
                reason: format!("invalid glob in ignore_patterns: '{}' - {}", pattern, e),
            })?;
            builder.add(glob);
        }
        builder.build().map_err(|e| StoreError::InvalidConfig {
            reason: format!("failed to build ignore pattern set: {}", e),
        })
    }

    /// Default lease as a chrono duration.
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lease_minutes as i64)
    }
}

/// Size-and-timestamp fingerprint of a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }
}

/// A [`StoreConfig`] cached against its file with change detection.
#[derive(Debug)]
pub struct WatchedConfig {
    path: PathBuf,
    stamp: Option<FileStamp>,
    config: StoreConfig,
}

impl WatchedConfig {
    /// Load the config file, falling back to defaults when it is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let stamp = FileStamp::of(&path);
        let config = match stamp {
            Some(_) => StoreConfig::load(&path)?,
            None => StoreConfig::default(),
        };
        Ok(Self {
            path,
            stamp,
            config,
        })
    }

    /// The currently cached config.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Re-read the file if its fingerprint changed.
    ///
    /// Returns true when a change was detected and the cache was reloaded.
    /// A file that disappears reverts the cache to defaults.
    pub fn refresh(&mut self) -> Result<bool> {
        let current = FileStamp::of(&self.path);
        if current == self.stamp {
            return Ok(false);
        }

        self.config = match current {
            Some(_) => StoreConfig::load(&self.path)?,
            None => StoreConfig::default(),
        };
        self.stamp = current;
        Ok(true)
    }
}
