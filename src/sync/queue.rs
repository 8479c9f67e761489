//! Bounded task queue with an outstanding-work counter.
//!
//! Producers block while the queue is full. The counter goes up on
//! enqueue and down when a worker reports completion, so
//! [`TaskQueue::wait_drained`] resolves only once every accepted task has
//! been dequeued and processed.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Created or modified: transfer the content.
    Write,
    /// Removed at the source: delete on the destination.
    Remove,
    /// Moved away at the source: transfer, then delete the old entry.
    Rename,
    /// Permission or other metadata change: logged only.
    PermissionChange,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Write => "write",
            TaskKind::Remove => "remove",
            TaskKind::Rename => "rename",
            TaskKind::PermissionChange => "chmod",
        };
        f.write_str(name)
    }
}

/// One change to mirror. `path` is canonical: relative to the source root
/// and `/` separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTask {
    pub kind: TaskKind,
    pub path: String,
    /// The change source saw a directory at `path`.
    pub is_dir: bool,
}

impl ChangeTask {
    pub fn new(kind: TaskKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            is_dir: false,
        }
    }

    pub fn write(path: impl Into<String>) -> Self {
        Self::new(TaskKind::Write, path)
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(TaskKind::Remove, path)
    }

    pub fn with_dir(mut self, is_dir: bool) -> Self {
        self.is_dir = is_dir;
        self
    }
}

pub struct TaskQueue {
    sender: mpsc::Sender<ChangeTask>,
    receiver: Mutex<mpsc::Receiver<ChangeTask>>,
    outstanding: AtomicUsize,
    drained: Notify,
    closed: CancellationToken,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Enqueue a task, waiting for room if the queue is full.
    pub async fn push(&self, task: ChangeTask) -> Result<(), SyncError> {
        if self.closed.is_cancelled() {
            return Err(SyncError::QueueClosed);
        }

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        // Gives the slot back if the send fails or this future is dropped
        let mut slot = PendingSlot {
            queue: self,
            armed: true,
        };
        let sent = tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            result = self.sender.send(task) => result.is_ok(),
        };
        if sent {
            slot.armed = false;
            Ok(())
        } else {
            Err(SyncError::QueueClosed)
        }
    }

    /// Next task, or `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<ChangeTask> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            task = receiver.recv() => task,
            _ = self.closed.cancelled() => receiver.try_recv().ok(),
        }
    }

    /// Report one dequeued task as finished, whatever its outcome.
    pub fn complete(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Tasks enqueued and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Resolve once the outstanding count reaches zero.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting tasks. Already queued tasks are still handed out.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

struct PendingSlot<'a> {
    queue: &'a TaskQueue,
    armed: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.complete();
        }
    }
}
