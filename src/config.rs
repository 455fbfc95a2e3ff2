//! Configuration management for prismafs

use crate::error::{Error, Result};
use crate::layer::{validate_specs, StackOptions};
use crate::lock::{DEFAULT_LOCK_RETRIES, DEFAULT_LOCK_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default resolution cache capacity (entries)
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Default kernel attribute TTL
pub const DEFAULT_ATTR_TTL_MS: u64 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Layers in precedence order; index is rank
    pub layers: Vec<LayerSpec>,

    /// Mount configuration
    pub mount: MountConfig,

    /// Resolution cache configuration
    pub cache: CacheConfig,

    /// Per-path locking configuration
    pub locking: LockConfig,

    /// Omit dot-files from merged listings
    pub hide_dotfiles: bool,
}

/// One layer of a stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Root directory of the layer
    pub path: PathBuf,

    /// Whether this is the writable layer
    #[serde(default)]
    pub writable: bool,
}

impl LayerSpec {
    pub fn writable<P: Into<PathBuf>>(path: P) -> Self {
        LayerSpec {
            path: path.into(),
            writable: true,
        }
    }

    pub fn read_only<P: Into<PathBuf>>(path: P) -> Self {
        LayerSpec {
            path: path.into(),
            writable: false,
        }
    }
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// How long the kernel may cache attributes and entries (ms)
    pub attr_ttl_ms: u64,
}

/// Resolution cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached resolutions (0 = disabled)
    pub capacity: usize,
}

/// Per-path lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Wait per attempt (ms)
    pub timeout_ms: u64,

    /// Attempts before reporting busy
    pub retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            layers: Vec::new(),
            mount: MountConfig::default(),
            cache: CacheConfig::default(),
            locking: LockConfig::default(),
            hide_dotfiles: false,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/prismafs"),
            fs_name: "prismafs".to_string(),
            allow_other: false,
            auto_unmount: true,
            attr_ttl_ms: DEFAULT_ATTR_TTL_MS,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            retries: DEFAULT_LOCK_RETRIES,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl MountConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("prismafs")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file and apply environment overrides without
    /// validating it, for callers that still add layers of their own
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("PRISMAFS_CACHE_CAPACITY") {
            if let Ok(capacity) = capacity.trim().parse::<usize>() {
                self.cache.capacity = capacity;
            }
        }

        if let Ok(timeout) = std::env::var("PRISMAFS_LOCK_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.trim().parse::<u64>() {
                self.locking.timeout_ms = timeout;
            }
        }

        if let Ok(retries) = std::env::var("PRISMAFS_LOCK_RETRIES") {
            if let Ok(retries) = retries.trim().parse::<u32>() {
                self.locking.retries = retries;
            }
        }

        if let Ok(hide) = std::env::var("PRISMAFS_HIDE_DOTFILES") {
            match hide.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.hide_dotfiles = true,
                "0" | "false" | "no" => self.hide_dotfiles = false,
                _ => {}
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_specs(&self.layers)?;

        if self.mount.fs_name.is_empty() {
            return Err(Error::Config("fs_name must not be empty".to_string()));
        }

        if self.locking.retries == 0 {
            return Err(Error::Config(
                "lock retries must be greater than 0".to_string(),
            ));
        }

        if self.locking.timeout_ms == 0 {
            return Err(Error::Config(
                "lock timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Options for stacks built from this configuration
    pub fn stack_options(&self) -> StackOptions {
        StackOptions {
            cache_capacity: self.cache.capacity,
            hide_dotfiles: self.hide_dotfiles,
        }
    }
}
