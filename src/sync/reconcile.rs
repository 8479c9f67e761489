//! One-shot reconciliation of the destination tree with the source tree.
//!
//! Walks the source depth first. Missing directories are created, missing
//! files are transferred, and files already present on the destination are
//! left alone whatever their content.
//!
//! Cancellation is observed between entries only. A transfer that has started
//! runs to completion or failure, so the destination never keeps a partial
//! file that the presence check would later accept.

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::fs::{FileEntry, LocalFs, Transport, TransportError};
use crate::sync::exclude::ExcludePatterns;
use crate::sync::executor::TransferExecutor;
use crate::sync::paths::SyncPath;

/// Create every prefix of the remote directory `path` in order.
///
/// "Already exists" is success. Servers that report an existing directory
/// as a plain failure are handled by probing the prefix before giving up.
/// Returns whether anything was created.
pub async fn check_or_create_dir(transport: &dyn Transport, path: &str) -> Result<bool, TransportError> {
    let absolute = path.starts_with('/');
    let mut prefix = String::new();
    let mut created = false;

    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        prefix = match (prefix.is_empty(), absolute) {
            (true, true) => format!("/{segment}"),
            (true, false) => segment.to_string(),
            (false, _) => format!("{prefix}/{segment}"),
        };

        match transport.make_dir(&prefix).await {
            Ok(()) => created = true,
            Err(TransportError::AlreadyExists(_)) => {}
            Err(err) => match transport.stat(&prefix).await {
                Ok(entry) if entry.is_dir => {}
                _ => return Err(err),
            },
        }
    }

    Ok(created)
}

pub struct Reconciler<'a> {
    executor: &'a TransferExecutor,
    excludes: &'a ExcludePatterns,
    cancel: CancellationToken,
}

impl<'a> Reconciler<'a> {
    pub fn new(executor: &'a TransferExecutor, excludes: &'a ExcludePatterns) -> Self {
        Self {
            executor,
            excludes,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop before the next entry once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Reconcile the whole tree, creating the destination root first.
    pub async fn run(&self) -> Result<()> {
        let source_root = self.executor.translator().source_root();
        info!(source = %source_root, direction = %self.executor.direction(), "reconciling");
        self.reconcile_subtree("").await
    }

    /// Reconcile below canonical path `relative` (`""` is the root).
    pub async fn reconcile_subtree(&self, relative: &str) -> Result<()> {
        let translator = self.executor.translator();
        let source = match translator.source_root() {
            SyncPath::Local(_) => SyncPath::Local(translator.local_path(relative)?),
            SyncPath::Remote(_) => SyncPath::Remote(translator.remote_path(relative)?),
        };
        let destination = translator.to_destination(&source)?;

        self.executor
            .ensure_dir(&destination)
            .await
            .map_err(|err| SyncError::reconcile(destination.to_string(), err))?;
        self.reconcile(source).await
    }

    /// Mirror the entries of `source_dir` onto the destination, recursively.
    pub fn reconcile(&self, source_dir: SyncPath) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let entries = self
                .list(&source_dir)
                .await
                .map_err(|err| SyncError::reconcile(source_dir.to_string(), err))?;

            for entry in entries {
                if self.cancel.is_cancelled() {
                    debug!(dir = %source_dir, "reconciliation interrupted");
                    return Ok(());
                }
                let source = source_dir.join(&entry.name);
                let relative = self.relative(&source)?;
                if self.excludes.is_excluded(&relative) {
                    debug!(path = %relative, "excluded");
                    continue;
                }
                let destination = self.executor.translator().to_destination(&source)?;

                if entry.is_dir {
                    self.executor
                        .ensure_dir(&destination)
                        .await
                        .map_err(|err| SyncError::reconcile(destination.to_string(), err))?;
                    self.reconcile(source).await?;
                } else if self
                    .exists(&destination)
                    .await
                    .map_err(|err| SyncError::reconcile(destination.to_string(), err))?
                {
                    debug!(path = %relative, "already present");
                } else {
                    self.executor
                        .transfer(&relative)
                        .await
                        .map_err(|err| SyncError::reconcile(source.to_string(), err))?;
                }
            }

            Ok(())
        })
    }

    async fn list(&self, dir: &SyncPath) -> Result<Vec<FileEntry>> {
        match dir {
            SyncPath::Local(path) => LocalFs::list_dir(path).await.map_err(|err| SyncError::io(path, err)),
            SyncPath::Remote(path) => Ok(self.executor.transport().list_dir(path).await?),
        }
    }

    async fn exists(&self, path: &SyncPath) -> Result<bool> {
        match path {
            SyncPath::Local(path) => match tokio::fs::symlink_metadata(path).await {
                Ok(_) => Ok(true),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(SyncError::io(path, err)),
            },
            SyncPath::Remote(path) => match self.executor.transport().stat(path).await {
                Ok(_) => Ok(true),
                Err(TransportError::NotFound(_)) => Ok(false),
                Err(err) => Err(err.into()),
            },
        }
    }

    fn relative(&self, source: &SyncPath) -> Result<String> {
        let translator = self.executor.translator();
        Ok(match source {
            SyncPath::Local(path) => translator.relative_local(path)?,
            SyncPath::Remote(path) => translator.relative_remote(path)?,
        })
    }
}
