//! Configuration loading.
//!
//! Priority, lowest first: built-in defaults, the TOML file
//! (`~/.config/ftpmirror/config.toml` unless given explicitly), the
//! `FTPMIRROR_PASSWORD` environment variable, then CLI flags applied by the
//! binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fs::FtpSettings;
use crate::sync::exclude::ExcludePatterns;

/// Environment variable that overrides the configured FTP password.
pub const PASSWORD_ENV: &str = "FTPMIRROR_PASSWORD";

/// Which tree is authoritative for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    /// Local tree is the source, the remote tree mirrors it.
    #[default]
    LocalToRemote,
    /// Remote tree is the source, the local tree mirrors it.
    RemoteToLocal,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::LocalToRemote => write!(f, "local-to-remote"),
            SyncDirection::RemoteToLocal => write!(f, "remote-to-local"),
        }
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-to-remote" | "upload" => Ok(SyncDirection::LocalToRemote),
            "remote-to-local" | "download" => Ok(SyncDirection::RemoteToLocal),
            other => Err(ConfigError::Invalid(format!("unknown direction {other:?}"))),
        }
    }
}

/// Settings the engine owns for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Authoritative side.
    pub direction: SyncDirection,
    /// Root of the local tree.
    pub local_root: PathBuf,
    /// Root of the remote tree, `/` separated.
    pub remote_root: String,
    /// Attempts per transfer, at least 1.
    pub max_retries: u32,
    /// Concurrent workers draining the task queue.
    pub workers: usize,
    /// Tasks that may wait in the queue before producers block.
    pub queue_capacity: usize,
    /// Remote snapshot period in milliseconds.
    pub poll_interval_ms: u64,
    /// Quiet period before a burst of local notifications becomes one task.
    /// Zero forwards every notification as its own task.
    pub debounce_ms: u64,
    /// Make uploads take the engine lock like downloads and deletes do.
    pub serialize_uploads: bool,
    /// Extra glob patterns to leave out of the sync.
    pub exclude: Vec<String>,
    /// Also apply the built-in exclusion list.
    pub use_default_excludes: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            direction: SyncDirection::LocalToRemote,
            local_root: PathBuf::new(),
            remote_root: String::new(),
            max_retries: 3,
            workers: 10,
            queue_capacity: 10,
            poll_interval_ms: 1000,
            debounce_ms: 100,
            serialize_uploads: false,
            exclude: Vec::new(),
            use_default_excludes: false,
        }
    }
}

impl SyncConfig {
    pub fn new(direction: SyncDirection, local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        Self {
            direction,
            local_root: local_root.into(),
            remote_root: remote_root.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Compile the configured exclusion patterns.
    pub fn exclude_patterns(&self) -> Result<ExcludePatterns, ConfigError> {
        let mut patterns = if self.use_default_excludes {
            ExcludePatterns::with_defaults()
        } else {
            ExcludePatterns::new()
        };
        for pattern in &self.exclude {
            patterns.add_pattern(pattern)?;
        }
        Ok(patterns)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("local_root must be set".to_string()));
        }
        if self.remote_root.trim().is_empty() {
            return Err(ConfigError::Invalid("remote_root must be set".to_string()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".to_string()));
        }
        self.exclude_patterns().map(|_| ())
    }
}

/// FTP endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per read or write on the control and data connections.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
}

fn default_port() -> u16 {
    21
}

fn default_username() -> String {
    "anonymous".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_io_timeout() -> u64 {
    30
}

impl FtpConfig {
    pub fn settings(&self) -> FtpSettings {
        FtpSettings {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
        }
    }
}

/// Where the remote tree lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// An FTP server.
    Ftp(FtpConfig),
    /// A directory reachable on the local filesystem, such as a mounted share.
    Local { path: PathBuf },
}

/// Complete configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    pub remote: RemoteConfig,
}

impl Config {
    /// Default configuration file location.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("ftpmirror").join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Read, parse and apply environment overrides. Validation is left to
    /// the caller so CLI flags can still fill in missing values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content, path)?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self) {
        if let RemoteConfig::Ftp(ftp) = &mut self.remote {
            if let Ok(password) = std::env::var(PASSWORD_ENV) {
                ftp.password = password;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync.validate()?;
        if let RemoteConfig::Ftp(ftp) = &self.remote {
            if ftp.host.trim().is_empty() {
                return Err(ConfigError::Invalid("remote.host must be set".to_string()));
            }
            if ftp.connect_timeout_secs == 0 || ftp.io_timeout_secs == 0 {
                return Err(ConfigError::Invalid("remote timeouts must be at least 1 second".to_string()));
            }
        }
        Ok(())
    }
}
