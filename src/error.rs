//! Error taxonomy for the sync engine.
//!
//! Startup errors (`Connection`, `Reconcile`, configuration) are fatal and
//! reach the caller. Everything raised while watching is contained to one
//! task and only logged.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::fs::TransportError;
use crate::sync::paths::PathError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection failed: {0}")]
    Connection(#[source] TransportError),
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("reconciliation failed at {path}: {source}")]
    Reconcile {
        path: String,
        #[source]
        source: Box<SyncError>,
    },
    #[error("upload of {path} failed after {attempts} attempts: {source}")]
    UploadFailed {
        path: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("download of {path} failed after {attempts} attempts: {source}")]
    DownloadFailed {
        path: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("delete of {path} failed: {source}")]
    Delete {
        path: String,
        #[source]
        source: TransportError,
    },
    #[error("notifier error: {0}")]
    Notifier(#[from] notify::Error),
    #[error("poll of {path} failed: {source}")]
    PollDiff {
        path: String,
        #[source]
        source: TransportError,
    },
    #[error("task queue is closed")]
    QueueClosed,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap an error raised while reconciling `path`.
    pub(crate) fn reconcile(path: impl Into<String>, source: SyncError) -> Self {
        match source {
            // Already wrapped by a deeper level of the walk.
            err @ SyncError::Reconcile { .. } => err,
            other => Self::Reconcile {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }
}

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid exclude pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
