//! Transfer counters shared by the reconciler and the workers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated concurrently.
#[derive(Debug, Default)]
pub struct TransferStats {
    uploads: AtomicU64,
    downloads: AtomicU64,
    deletes: AtomicU64,
    dirs_created: AtomicU64,
    failures: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uploads: u64,
    pub downloads: u64,
    pub deletes: u64,
    pub dirs_created: u64,
    pub failures: u64,
    pub bytes: u64,
}

impl StatsSnapshot {
    /// Files moved in either direction.
    pub fn transfers(&self) -> u64 {
        self.uploads + self.downloads
    }
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dir_created(&self) {
        self.dirs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            dirs_created: self.dirs_created.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}
