//! Configuration management for pcloud-drive

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory permissions
pub const DEFAULT_DIR_MODE: u16 = 0o750;

/// Default file permissions
pub const DEFAULT_FILE_MODE: u16 = 0o640;

/// Default directory attribute validity (milliseconds)
pub const DEFAULT_DIR_TTL_MS: u64 = 2000;

/// Default file attribute validity (milliseconds)
pub const DEFAULT_FILE_TTL_MS: u64 = 1000;

/// Default kernel read-ahead: 10MB
pub const DEFAULT_MAX_READAHEAD: u32 = 10 * 1024 * 1024;

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Register the write path (create, remove, write, setattr)
    pub read_write: bool,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Filesystem subtype shown in the mount table
    pub subtype: String,

    /// Maximum kernel read-ahead in bytes
    pub max_readahead: u32,

    /// Permissions for directories
    pub dir_mode: u16,

    /// Permissions for files
    pub file_mode: u16,

    /// Directory attribute validity in milliseconds
    pub dir_ttl_ms: u64,

    /// File attribute validity in milliseconds
    pub file_ttl_ms: u64,
}

/// Remote client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Deadline for a single filesystem operation (0 = none)
    pub request_timeout_ms: u64,

    /// Deadline for best-effort cleanup calls such as closing a descriptor
    pub cleanup_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Remote client configuration
    pub remote: RemoteConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/pcloud"),
            read_write: false,
            allow_other: false,
            fs_name: "pcloud".to_string(),
            subtype: "seborama".to_string(),
            max_readahead: DEFAULT_MAX_READAHEAD,
            dir_mode: DEFAULT_DIR_MODE,
            file_mode: DEFAULT_FILE_MODE,
            dir_ttl_ms: DEFAULT_DIR_TTL_MS,
            file_ttl_ms: DEFAULT_FILE_TTL_MS,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            request_timeout_ms: 60_000,
            cleanup_timeout_ms: 5_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl MountConfig {
    pub fn dir_ttl(&self) -> Duration {
        Duration::from_millis(self.dir_ttl_ms)
    }

    pub fn file_ttl(&self) -> Duration {
        Duration::from_millis(self.file_ttl_ms)
    }
}

impl RemoteConfig {
    /// Per-operation deadline, if any
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mount_point) = std::env::var("PCLOUD_DRIVE_MOUNT_POINT") {
            let mount_point = mount_point.trim();
            if !mount_point.is_empty() {
                self.mount.mount_point = PathBuf::from(mount_point);
            }
        }

        if let Ok(read_write) = std::env::var("PCLOUD_DRIVE_READ_WRITE") {
            if let Ok(read_write) = read_write.trim().parse::<bool>() {
                self.mount.read_write = read_write;
            }
        }
    }

    /// Apply command-line mount flags. An explicit access mode replaces the
    /// configured one; `allow_other` can only be switched on.
    pub fn apply_cli_overrides(&mut self, read_write: Option<bool>, allow_other: bool) {
        if let Some(read_write) = read_write {
            self.mount.read_write = read_write;
        }
        self.mount.allow_other |= allow_other;
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mount.fs_name.is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        if self.mount.dir_mode > 0o7777 || self.mount.file_mode > 0o7777 {
            return Err(Error::InvalidConfig(
                "Permission masks must fit in 0o7777".to_string(),
            ));
        }

        if self.mount.dir_ttl_ms == 0 || self.mount.file_ttl_ms == 0 {
            return Err(Error::InvalidConfig(
                "Attribute validity windows must be greater than 0".to_string(),
            ));
        }

        if self.remote.cleanup_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "Cleanup timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
