//! Translation between local paths, remote paths and the canonical
//! root-relative form carried by change tasks.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::config::SyncDirection;
use crate::fs::types::join_remote;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("{path} is not under {root}")]
    OutsideRoot { path: String, root: String },
    #[error("path {0} contains an unsupported component")]
    UnsupportedComponent(String),
    #[error("{0} is not on the {1} side")]
    WrongSide(String, &'static str),
}

/// A path on one side of the sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPath {
    Local(PathBuf),
    Remote(String),
}

impl SyncPath {
    /// Child entry `name` below this directory.
    pub fn join(&self, name: &str) -> SyncPath {
        match self {
            SyncPath::Local(path) => SyncPath::Local(path.join(name)),
            SyncPath::Remote(path) => SyncPath::Remote(join_remote(path, name)),
        }
    }
}

impl fmt::Display for SyncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPath::Local(path) => write!(f, "{}", path.display()),
            SyncPath::Remote(path) => write!(f, "{path}"),
        }
    }
}

/// Maps paths between the local and the remote root.
///
/// Pure: no I/O happens here. The canonical form is `/` separated and
/// relative to the root, with `""` naming the root itself.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    direction: SyncDirection,
    local_root: PathBuf,
    remote_root: String,
}

impl PathTranslator {
    pub fn new(direction: SyncDirection, local_root: impl Into<PathBuf>, remote_root: &str) -> Self {
        let trimmed = remote_root.trim_end_matches('/');
        let remote_root = if trimmed.is_empty() && remote_root.starts_with('/') {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        Self {
            direction,
            local_root: local_root.into(),
            remote_root,
        }
    }

    pub fn direction(&self) -> SyncDirection {
        self.direction
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    /// Root of the authoritative tree.
    pub fn source_root(&self) -> SyncPath {
        match self.direction {
            SyncDirection::LocalToRemote => SyncPath::Local(self.local_root.clone()),
            SyncDirection::RemoteToLocal => SyncPath::Remote(self.remote_root.clone()),
        }
    }

    /// Canonical form of an absolute local path.
    pub fn relative_local(&self, path: &Path) -> Result<String, PathError> {
        let rest = path.strip_prefix(&self.local_root).map_err(|_| PathError::OutsideRoot {
            path: path.display().to_string(),
            root: self.local_root.display().to_string(),
        })?;

        let mut parts = Vec::new();
        for component in rest.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
                Component::CurDir => {}
                _ => return Err(PathError::UnsupportedComponent(path.display().to_string())),
            }
        }
        Ok(parts.join("/"))
    }

    /// Canonical form of an absolute remote path.
    pub fn relative_remote(&self, path: &str) -> Result<String, PathError> {
        let outside = || PathError::OutsideRoot {
            path: path.to_string(),
            root: self.remote_root.clone(),
        };
        let path_trimmed = if path == "/" { path } else { path.trim_end_matches('/') };

        let rest = if path_trimmed == self.remote_root {
            ""
        } else if self.remote_root == "/" {
            path_trimmed.strip_prefix('/').ok_or_else(outside)?
        } else if self.remote_root.is_empty() {
            path_trimmed
        } else {
            path_trimmed
                .strip_prefix(self.remote_root.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .ok_or_else(outside)?
        };

        validate_relative(rest)?;
        Ok(rest.to_string())
    }

    /// Absolute local path for a canonical path.
    pub fn local_path(&self, relative: &str) -> Result<PathBuf, PathError> {
        validate_relative(relative)?;
        let mut path = self.local_root.clone();
        for part in relative.split('/').filter(|part| !part.is_empty()) {
            path.push(part);
        }
        Ok(path)
    }

    /// Absolute remote path for a canonical path.
    pub fn remote_path(&self, relative: &str) -> Result<String, PathError> {
        validate_relative(relative)?;
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            return Ok(self.remote_root.clone());
        }
        Ok(join_remote(&self.remote_root, relative))
    }

    pub fn to_remote(&self, local: &Path) -> Result<String, PathError> {
        self.remote_path(&self.relative_local(local)?)
    }

    pub fn to_local(&self, remote: &str) -> Result<PathBuf, PathError> {
        self.local_path(&self.relative_remote(remote)?)
    }

    /// Counterpart of a source path on the destination side.
    pub fn to_destination(&self, source: &SyncPath) -> Result<SyncPath, PathError> {
        match (self.direction, source) {
            (SyncDirection::LocalToRemote, SyncPath::Local(path)) => Ok(SyncPath::Remote(self.to_remote(path)?)),
            (SyncDirection::RemoteToLocal, SyncPath::Remote(path)) => Ok(SyncPath::Local(self.to_local(path)?)),
            (_, other) => Err(PathError::WrongSide(other.to_string(), "source")),
        }
    }

    /// Counterpart of a destination path on the source side.
    pub fn to_source(&self, destination: &SyncPath) -> Result<SyncPath, PathError> {
        match (self.direction, destination) {
            (SyncDirection::LocalToRemote, SyncPath::Remote(path)) => Ok(SyncPath::Local(self.to_local(path)?)),
            (SyncDirection::RemoteToLocal, SyncPath::Local(path)) => Ok(SyncPath::Remote(self.to_remote(path)?)),
            (_, other) => Err(PathError::WrongSide(other.to_string(), "destination")),
        }
    }
}

fn validate_relative(relative: &str) -> Result<(), PathError> {
    if relative.split('/').any(|part| part == "..") {
        return Err(PathError::UnsupportedComponent(relative.to_string()));
    }
    Ok(())
}
