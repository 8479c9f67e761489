//! Fixed-size pool of workers draining the task queue.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::sync::exclude::ExcludePatterns;
use crate::sync::executor::TransferExecutor;
use crate::sync::queue::{ChangeTask, TaskKind, TaskQueue};
use crate::sync::reconcile::Reconciler;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers. They run until the queue is closed and empty.
    pub fn start(
        size: usize,
        queue: Arc<TaskQueue>,
        executor: Arc<TransferExecutor>,
        excludes: Arc<ExcludePatterns>,
    ) -> Self {
        let handles = (0..size.max(1))
            .map(|id| {
                let queue = queue.clone();
                let executor = executor.clone();
                let excludes = excludes.clone();
                tokio::spawn(async move { run_worker(id, &queue, &executor, &excludes).await })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker terminated abnormally");
            }
        }
    }
}

async fn run_worker(id: usize, queue: &TaskQueue, executor: &TransferExecutor, excludes: &ExcludePatterns) {
    debug!(worker = id, "worker started");
    while let Some(task) = queue.pop().await {
        if let Err(err) = process_task(executor, excludes, &task).await {
            error!(worker = id, kind = %task.kind, path = %task.path, error = %err, "task failed");
        }
        queue.complete();
    }
    debug!(worker = id, "worker stopped");
}

/// Carry out one task. Failures are returned for logging only.
pub async fn process_task(executor: &TransferExecutor, excludes: &ExcludePatterns, task: &ChangeTask) -> Result<()> {
    match task.kind {
        TaskKind::Write if task.is_dir => {
            // Catch up on anything created inside before it was observed
            Reconciler::new(executor, excludes).reconcile_subtree(&task.path).await
        }
        TaskKind::Write => executor.transfer(&task.path).await.map(|_| ()),
        TaskKind::Remove => executor.delete_at_destination(&task.path, task.is_dir).await,
        TaskKind::Rename => {
            // Not atomic: the destination briefly holds both or neither entry
            if let Err(err) = executor.transfer(&task.path).await {
                debug!(path = %task.path, error = %err, "rename source no longer transferable");
            }
            executor.delete_at_destination(&task.path, task.is_dir).await
        }
        TaskKind::PermissionChange => {
            info!(path = %task.path, "permission change, nothing to transfer");
            Ok(())
        }
    }
}
