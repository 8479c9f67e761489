//! Executes single transfers and deletes against the destination.
//!
//! Transfers are retried up to `max_retries` times back to back, without
//! any delay. Deletes are attempted exactly once: a missing entry is not a
//! transient failure.
//!
//! Locking: downloads and both deletes hold the engine-wide lock while they
//! touch the transport or the local tree. Uploads do not, unless
//! `serialize_uploads` is set, so concurrent uploads race on the transport.
//!
//! Downloads are written to a hidden sibling and renamed over the target only
//! once complete. An interrupted download never leaves a truncated file that
//! a later reconciliation would take for a finished one.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncDirection;
use crate::error::{Result, SyncError};
use crate::fs::{LocalFs, Transport, TransportError};
use crate::sync::paths::{PathTranslator, SyncPath};
use crate::sync::reconcile::check_or_create_dir;
use crate::sync::stats::TransferStats;

/// Suffix of the hidden file a download is written to.
pub const PARTIAL_SUFFIX: &str = ".ftpmirror-part";

/// Download target that is deleted on drop unless committed.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn beside(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: target.with_file_name(format!(".{name}{PARTIAL_SUFFIX}")),
            committed: false,
        }
    }

    async fn commit(mut self, target: &Path) -> io::Result<()> {
        tokio::fs::rename(&self.path, target).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed unfinished download"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "could not remove unfinished download"),
        }
    }
}

pub struct TransferExecutor {
    transport: Arc<dyn Transport>,
    translator: PathTranslator,
    max_retries: u32,
    serialize_uploads: bool,
    lock: Mutex<()>,
    stats: Arc<TransferStats>,
}

impl TransferExecutor {
    pub fn new(transport: Arc<dyn Transport>, translator: PathTranslator, max_retries: u32) -> Self {
        Self {
            transport,
            translator,
            max_retries: max_retries.max(1),
            serialize_uploads: false,
            lock: Mutex::new(()),
            stats: Arc::new(TransferStats::new()),
        }
    }

    /// Make uploads take the engine lock as well.
    pub fn with_serialized_uploads(mut self, serialize: bool) -> Self {
        self.serialize_uploads = serialize;
        self
    }

    pub fn with_stats(mut self, stats: Arc<TransferStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    pub fn direction(&self) -> SyncDirection {
        self.translator.direction()
    }

    // ========== Direction aware entry points ==========

    /// Copy the source entry at canonical `relative` to the destination.
    pub async fn transfer(&self, relative: &str) -> Result<u64> {
        match self.direction() {
            SyncDirection::LocalToRemote => self.upload(relative).await,
            SyncDirection::RemoteToLocal => self.download(relative).await,
        }
    }

    /// Remove the mirrored entry at canonical `relative`.
    pub async fn delete_at_destination(&self, relative: &str, is_dir: bool) -> Result<()> {
        match self.direction() {
            SyncDirection::LocalToRemote => self.delete_remote(relative).await,
            SyncDirection::RemoteToLocal => self.delete_local(relative, is_dir).await,
        }
    }

    /// Make sure the destination directory for canonical `relative` exists.
    pub async fn ensure_destination_dir(&self, relative: &str) -> Result<()> {
        let destination = match self.direction() {
            SyncDirection::LocalToRemote => SyncPath::Remote(self.translator.remote_path(relative)?),
            SyncDirection::RemoteToLocal => SyncPath::Local(self.translator.local_path(relative)?),
        };
        self.ensure_dir(&destination).await
    }

    /// Create a directory and its missing ancestors on either side.
    pub async fn ensure_dir(&self, dir: &SyncPath) -> Result<()> {
        match dir {
            SyncPath::Remote(path) => {
                if check_or_create_dir(self.transport.as_ref(), path).await? {
                    self.stats.record_dir_created();
                    debug!(path = %path, "created remote directory");
                }
            }
            SyncPath::Local(path) => {
                if !path.is_dir() {
                    LocalFs::create_dir(path).await.map_err(|err| SyncError::io(path, err))?;
                    self.stats.record_dir_created();
                    debug!(path = %path.display(), "created local directory");
                }
            }
        }
        Ok(())
    }

    // ========== Transfers ==========

    pub async fn upload(&self, relative: &str) -> Result<u64> {
        let local = self.translator.local_path(relative)?;
        let remote = self.translator.remote_path(relative)?;
        self.upload_file(&local, &remote).await
    }

    /// Store `local` at `remote`, rewinding the file before every attempt.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<u64> {
        let _guard = if self.serialize_uploads {
            Some(self.lock.lock().await)
        } else {
            None
        };

        let mut file = File::open(local).await.map_err(|err| SyncError::io(local, err))?;
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            // A failed attempt may have consumed part of the file
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|err| SyncError::io(local, err))?;

            match self.transport.store(remote, &mut file).await {
                Ok(bytes) => {
                    self.stats.record_upload(bytes);
                    info!(
                        path = %remote,
                        size = %humansize::format_size(bytes, humansize::BINARY),
                        attempt,
                        "uploaded"
                    );
                    return Ok(bytes);
                }
                Err(err) => {
                    warn!(path = %remote, attempt, max = self.max_retries, error = %err, "upload attempt failed");
                    last_error = Some(err);
                }
            }
        }

        self.stats.record_failure();
        Err(SyncError::UploadFailed {
            path: remote.to_string(),
            attempts: self.max_retries,
            source: last_error.unwrap_or_else(|| TransportError::Protocol("no attempt made".to_string())),
        })
    }

    pub async fn download(&self, relative: &str) -> Result<u64> {
        let remote = self.translator.remote_path(relative)?;
        let local = self.translator.local_path(relative)?;
        self.download_file(&remote, &local).await
    }

    /// Retrieve `remote` into `local`, truncating before every attempt.
    pub async fn download_file(&self, remote: &str, local: &Path) -> Result<u64> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = local.parent() {
            LocalFs::create_dir(parent)
                .await
                .map_err(|err| SyncError::io(parent, err))?;
        }
        let partial = PartialFile::beside(local);
        let mut file = File::create(&partial.path)
            .await
            .map_err(|err| SyncError::io(&partial.path, err))?;
        let mut last_error = None;
        let mut finished = None;

        for attempt in 1..=self.max_retries {
            file.set_len(0).await.map_err(|err| SyncError::io(&partial.path, err))?;
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|err| SyncError::io(&partial.path, err))?;

            match self.transport.retrieve(remote, &mut file).await {
                Ok(bytes) => {
                    file.flush().await.map_err(|err| SyncError::io(&partial.path, err))?;
                    finished = Some((bytes, attempt));
                    break;
                }
                Err(err) => {
                    warn!(path = %remote, attempt, max = self.max_retries, error = %err, "download attempt failed");
                    last_error = Some(err);
                }
            }
        }
        drop(file);

        let Some((bytes, attempt)) = finished else {
            self.stats.record_failure();
            return Err(SyncError::DownloadFailed {
                path: remote.to_string(),
                attempts: self.max_retries,
                source: last_error.unwrap_or_else(|| TransportError::Protocol("no attempt made".to_string())),
            });
        };

        partial.commit(local).await.map_err(|err| SyncError::io(local, err))?;
        self.stats.record_download(bytes);
        info!(
            path = %local.display(),
            size = %humansize::format_size(bytes, humansize::BINARY),
            attempt,
            "downloaded"
        );
        Ok(bytes)
    }

    // ========== Deletes ==========

    /// Delete the remote counterpart of `relative`. Single attempt.
    pub async fn delete_remote(&self, relative: &str) -> Result<()> {
        let remote = self.translator.remote_path(relative)?;
        let _guard = self.lock.lock().await;

        match self.transport.delete(&remote).await {
            Ok(()) => {
                self.stats.record_delete();
                info!(path = %remote, "deleted remote entry");
                Ok(())
            }
            Err(source) => {
                self.stats.record_failure();
                warn!(path = %remote, error = %source, "remote delete failed");
                Err(SyncError::Delete { path: remote, source })
            }
        }
    }

    /// Delete the local counterpart of `relative`. Single attempt.
    pub async fn delete_local(&self, relative: &str, is_dir: bool) -> Result<()> {
        let local = self.translator.local_path(relative)?;
        let _guard = self.lock.lock().await;

        let is_dir = is_dir
            || tokio::fs::symlink_metadata(&local)
                .await
                .map(|metadata| metadata.is_dir())
                .unwrap_or(false);

        match LocalFs::delete(&local, is_dir).await {
            Ok(()) => {
                self.stats.record_delete();
                info!(path = %local.display(), "deleted local entry");
                Ok(())
            }
            Err(err) => {
                self.stats.record_failure();
                warn!(path = %local.display(), error = %err, "local delete failed");
                Err(SyncError::Delete {
                    path: local.display().to_string(),
                    source: TransportError::Io(err),
                })
            }
        }
    }
}
