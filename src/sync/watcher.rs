//! Watch-based change source for a local source tree.
//!
//! Directories are registered one by one (non-recursive) with the
//! notifier: every existing directory at startup, and each new directory
//! as soon as a write for it is dispatched. Raw notifications are mapped to
//! change tasks, optionally coalesced per path, and pushed into the queue
//! in the order they were first seen.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::sync::exclude::ExcludePatterns;
use crate::sync::paths::PathTranslator;
use crate::sync::queue::{ChangeTask, TaskKind, TaskQueue};

/// Stream of raw notifications, errors included.
pub type NotifyEvents = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Filesystem change subscription, one directory at a time.
pub trait Notifier: Send {
    fn watch(&mut self, dir: &Path) -> Result<(), SyncError>;
}

/// [`Notifier`] backed by the platform watcher from `notify`.
pub struct NotifyWatcher {
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
}

impl NotifyWatcher {
    /// Create the watcher and the channel its events arrive on.
    pub fn new() -> Result<(Self, NotifyEvents), SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )?;

        Ok((
            Self {
                watcher,
                watched: HashSet::new(),
            },
            rx,
        ))
    }
}

impl Notifier for NotifyWatcher {
    fn watch(&mut self, dir: &Path) -> Result<(), SyncError> {
        if self.watched.contains(dir) {
            return Ok(());
        }
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        self.watched.insert(dir.to_path_buf());
        Ok(())
    }
}

/// Register `root` and every directory below it that is not excluded.
pub fn watch_tree(
    notifier: &mut dyn Notifier,
    root: &Path,
    translator: &PathTranslator,
    excludes: &ExcludePatterns,
) -> Result<usize, SyncError> {
    notifier.watch(root)?;
    let mut registered = 1;

    for entry in jwalk::WalkDir::new(root)
        .parallelism(jwalk::Parallelism::Serial)
        .skip_hidden(false)
        .follow_links(false)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if entry.depth == 0 || !entry.file_type().is_dir() {
            continue;
        }

        let path = entry.path();
        match translator.relative_local(&path) {
            Ok(relative) if excludes.is_excluded(&relative) => continue,
            Ok(_) => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "directory outside the sync root");
                continue;
            }
        }
        notifier.watch(&path)?;
        registered += 1;
    }

    Ok(registered)
}

/// Translate one notification into task kinds for absolute paths.
///
/// Rename halves are reported separately by every backend, so a combined
/// `Both` event carries no extra information and is ignored.
pub fn map_event(event: &Event) -> Vec<(TaskKind, PathBuf)> {
    let kind = match event.kind {
        EventKind::Create(_) => TaskKind::Write,
        EventKind::Remove(_) => TaskKind::Remove,
        EventKind::Modify(ModifyKind::Metadata(_)) => TaskKind::PermissionChange,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => TaskKind::Rename,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => TaskKind::Write,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Vec::new(),
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Platform could not tell which side of the rename this is
            return event
                .paths
                .iter()
                .map(|path| {
                    let kind = if path.exists() { TaskKind::Write } else { TaskKind::Rename };
                    (kind, path.clone())
                })
                .collect();
        }
        EventKind::Modify(_) => TaskKind::Write,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event.paths.iter().map(|path| (kind, path.clone())).collect()
}

#[derive(Debug)]
struct PendingChange {
    task: ChangeTask,
    last_seen: Instant,
}

/// Per-path coalescing of notifications within a quiet window.
#[derive(Debug)]
pub struct PendingChanges {
    window: Duration,
    entries: Vec<PendingChange>,
}

impl PendingChanges {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Vec::new(),
        }
    }

    /// Record a task. A later task for the same path replaces the pending
    /// kind, except that a permission change never hides a transfer or delete.
    pub fn add(&mut self, task: ChangeTask, now: Instant) {
        if let Some(pending) = self.entries.iter_mut().find(|p| p.task.path == task.path) {
            let keep_kind = task.kind == TaskKind::PermissionChange
                && pending.task.kind != TaskKind::PermissionChange;
            if !keep_kind {
                pending.task.kind = task.kind;
                pending.task.is_dir = task.is_dir;
            }
            pending.last_seen = now;
        } else {
            self.entries.push(PendingChange { task, last_seen: now });
        }
    }

    /// When the oldest pending path becomes quiet.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|p| p.last_seen + self.window).min()
    }

    /// Remove and return the tasks that have been quiet for the window.
    pub fn take_ready(&mut self, now: Instant) -> Vec<ChangeTask> {
        let window = self.window;
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|p| p.last_seen + window <= now);
        self.entries = waiting;
        ready.into_iter().map(|p| p.task).collect()
    }

    pub fn take_all(&mut self) -> Vec<ChangeTask> {
        self.entries.drain(..).map(|p| p.task).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Dispatch loop turning notifications into queued tasks.
pub struct WatchSource<N: Notifier> {
    notifier: N,
    events: NotifyEvents,
    translator: PathTranslator,
    excludes: Arc<ExcludePatterns>,
    queue: Arc<TaskQueue>,
    debounce: Duration,
}

impl<N: Notifier> WatchSource<N> {
    pub fn new(
        notifier: N,
        events: NotifyEvents,
        translator: PathTranslator,
        excludes: Arc<ExcludePatterns>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            notifier,
            events,
            translator,
            excludes,
            queue,
            debounce: Duration::ZERO,
        }
    }

    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    /// Register the local root and all of its existing subdirectories.
    pub fn register_existing(&mut self) -> Result<usize, SyncError> {
        let root = self.translator.local_root().to_path_buf();
        let count = watch_tree(&mut self.notifier, &root, &self.translator, &self.excludes)?;
        info!(root = %root.display(), directories = count, "watching local tree");
        Ok(count)
    }

    /// Run until `token` is cancelled or the notifier stream ends.
    /// Changes still waiting in the coalescing window are flushed first.
    pub async fn run(mut self, token: CancellationToken) {
        let mut pending = PendingChanges::new(self.debounce);

        loop {
            let deadline = pending.next_deadline();
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("watch loop cancelled");
                    break;
                }
                message = self.events.recv() => match message {
                    None => {
                        debug!("notifier stream closed");
                        break;
                    }
                    Some(Err(err)) => warn!(error = %err, "notifier error"),
                    Some(Ok(event)) => {
                        let now = Instant::now();
                        for task in self.tasks_for(&event) {
                            pending.add(task, now);
                        }
                    }
                },
                _ = sleep_until(deadline) => {}
            }

            for task in pending.take_ready(Instant::now()) {
                self.dispatch(task).await;
            }
        }

        for task in pending.take_all() {
            self.dispatch(task).await;
        }
    }

    fn tasks_for(&self, event: &Event) -> Vec<ChangeTask> {
        map_event(event)
            .into_iter()
            .filter_map(|(kind, path)| {
                let relative = match self.translator.relative_local(&path) {
                    Ok(relative) if relative.is_empty() => return None,
                    Ok(relative) => relative,
                    Err(err) => {
                        debug!(path = %path.display(), error = %err, "ignoring event outside the root");
                        return None;
                    }
                };
                if self.excludes.is_excluded(&relative) {
                    return None;
                }
                let is_dir = kind != TaskKind::Remove && path.is_dir();
                Some(ChangeTask::new(kind, relative).with_dir(is_dir))
            })
            .collect()
    }

    async fn dispatch(&mut self, task: ChangeTask) {
        if task.kind == TaskKind::Write && task.is_dir {
            self.watch_new_dir(&task.path);
        }
        debug!(kind = %task.kind, path = %task.path, "queueing change");
        if let Err(err) = self.queue.push(task).await {
            warn!(error = %err, "dropping change");
        }
    }

    fn watch_new_dir(&mut self, relative: &str) {
        let dir = match self.translator.local_path(relative) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(path = %relative, error = %err, "cannot watch new directory");
                return;
            }
        };
        match watch_tree(&mut self.notifier, &dir, &self.translator, &self.excludes) {
            Ok(count) => debug!(path = %relative, directories = count, "watching new directory"),
            Err(err) => warn!(path = %relative, error = %err, "cannot watch new directory"),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
