//! Poll-based change source for a remote source tree.
//!
//! Every interval the whole remote tree is listed into a [`RemoteSnapshot`]
//! and compared with the previous one. New or newer entries become writes,
//! vanished entries become removes. The first snapshot is a baseline only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::fs::{join_remote, Transport};
use crate::sync::exclude::ExcludePatterns;
use crate::sync::paths::PathTranslator;
use crate::sync::queue::{ChangeTask, TaskQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

impl SnapshotEntry {
    /// Strictly newer than `previous`. An unknown time on either side
    /// never counts as newer.
    fn is_newer_than(&self, previous: &SnapshotEntry) -> bool {
        match (self.modified, previous.modified) {
            (Some(current), Some(previous)) => current > previous,
            _ => false,
        }
    }
}

/// Remote tree keyed by canonical relative path. The root is not included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSnapshot {
    entries: BTreeMap<String, SnapshotEntry>,
}

impl RemoteSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: SnapshotEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&SnapshotEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &SnapshotEntry)> {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }
}

/// Tasks that bring a mirror of `previous` up to `next`.
///
/// Writes come first in path order, so a directory precedes its children.
/// Removes follow in reverse path order, so children precede their directory.
pub fn diff_snapshots(previous: &RemoteSnapshot, next: &RemoteSnapshot) -> Vec<ChangeTask> {
    let mut tasks: Vec<ChangeTask> = next
        .iter()
        .filter(|(path, entry)| match previous.get(path) {
            None => true,
            Some(old) => entry.is_newer_than(old),
        })
        .map(|(path, entry)| ChangeTask::write(path).with_dir(entry.is_dir))
        .collect();

    tasks.extend(
        previous
            .iter()
            .rev()
            .filter(|(path, _)| next.get(path).is_none())
            .map(|(path, entry)| ChangeTask::remove(path).with_dir(entry.is_dir)),
    );

    tasks
}

pub struct RemotePoller {
    transport: Arc<dyn Transport>,
    translator: PathTranslator,
    excludes: Arc<ExcludePatterns>,
    queue: Arc<TaskQueue>,
    interval: Duration,
}

impl RemotePoller {
    pub fn new(
        transport: Arc<dyn Transport>,
        translator: PathTranslator,
        excludes: Arc<ExcludePatterns>,
        queue: Arc<TaskQueue>,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            translator,
            excludes,
            queue,
            interval,
        }
    }

    /// List the whole remote tree. Any listing failure aborts the snapshot,
    /// including a directory that vanished between two listings.
    pub async fn snapshot(&self) -> Result<RemoteSnapshot> {
        let mut snapshot = RemoteSnapshot::new();
        let mut pending = vec![String::new()];

        while let Some(relative) = pending.pop() {
            let dir = self.translator.remote_path(&relative)?;
            let entries = self
                .transport
                .list_dir(&dir)
                .await
                .map_err(|source| SyncError::PollDiff { path: dir.clone(), source })?;

            for entry in entries {
                let child = if relative.is_empty() {
                    entry.name.clone()
                } else {
                    join_remote(&relative, &entry.name)
                };
                if self.excludes.is_excluded(&child) {
                    continue;
                }
                if entry.is_dir {
                    pending.push(child.clone());
                }
                snapshot.insert(
                    child,
                    SnapshotEntry {
                        is_dir: entry.is_dir,
                        modified: entry.modified,
                    },
                );
            }
        }

        Ok(snapshot)
    }

    /// Poll until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        info!(
            root = %self.translator.remote_root(),
            interval_ms = self.interval.as_millis() as u64,
            "polling remote tree"
        );
        let mut previous: Option<RemoteSnapshot> = None;

        loop {
            if token.is_cancelled() {
                break;
            }

            match self.snapshot().await {
                Ok(next) => {
                    if let Some(previous) = &previous {
                        if !self.enqueue(diff_snapshots(previous, &next)).await {
                            break;
                        }
                    } else {
                        debug!(entries = next.len(), "baseline snapshot taken");
                    }
                    previous = Some(next);
                }
                Err(err) => warn!(error = %err, "poll cycle skipped"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        debug!("poll loop stopped");
    }

    /// Push the diff. Returns false once the queue no longer accepts tasks.
    async fn enqueue(&self, tasks: Vec<ChangeTask>) -> bool {
        if !tasks.is_empty() {
            debug!(changes = tasks.len(), "remote tree changed");
        }
        for task in tasks {
            debug!(kind = %task.kind, path = %task.path, "queueing change");
            if let Err(err) = self.queue.push(task).await {
                warn!(error = %err, "stopping poll loop");
                return false;
            }
        }
        true
    }
}
