//! Engine wiring the reconciler, a change source and the worker pool.
//!
//! A run moves through `Idle`, `Reconciling`, `Watching`, `ShuttingDown`
//! and `Stopped`. A fatal startup error goes straight to `Stopped` and is
//! returned to the caller; failures after that are contained to single tasks.
//! Cancellation during reconciliation lets the transfer in flight finish.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{SyncConfig, SyncDirection};
use crate::error::{ConfigError, Result};
use crate::fs::Transport;
use crate::sync::exclude::ExcludePatterns;
use crate::sync::executor::TransferExecutor;
use crate::sync::paths::PathTranslator;
use crate::sync::poller::RemotePoller;
use crate::sync::pool::WorkerPool;
use crate::sync::queue::TaskQueue;
use crate::sync::reconcile::Reconciler;
use crate::sync::stats::{StatsSnapshot, TransferStats};
use crate::sync::watcher::{NotifyWatcher, WatchSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Reconciling,
    Watching,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Reconciling => "reconciling",
            EngineState::Watching => "watching",
            EngineState::ShuttingDown => "shutting down",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
}

pub struct Engine {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    excludes: Arc<ExcludePatterns>,
    executor: Arc<TransferExecutor>,
    stats: Arc<TransferStats>,
    state: watch::Sender<EngineState>,
}

impl Engine {
    /// Build an engine around an already connected transport.
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;
        let excludes = Arc::new(config.exclude_patterns()?);
        let stats = Arc::new(TransferStats::new());
        let translator = PathTranslator::new(config.direction, &config.local_root, &config.remote_root);
        let executor = TransferExecutor::new(transport.clone(), translator, config.max_retries)
            .with_serialized_uploads(config.serialize_uploads)
            .with_stats(stats.clone());
        let (state, _) = watch::channel(EngineState::Idle);

        Ok(Self {
            config,
            transport,
            excludes,
            executor: Arc::new(executor),
            stats,
            state,
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn set_state(&self, next: EngineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "engine state");
        }
    }

    /// Only the startup reconciliation pass, then stop.
    pub async fn reconcile_once(&self) -> Result<RunReport> {
        let started = Instant::now();
        self.set_state(EngineState::Reconciling);
        let result = Reconciler::new(&self.executor, &self.excludes).run().await;
        self.set_state(EngineState::Stopped);
        result?;

        let report = self.report(started);
        info!(
            uploads = report.stats.uploads,
            downloads = report.stats.downloads,
            dirs = report.stats.dirs_created,
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Reconcile, then mirror changes until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<RunReport> {
        let started = Instant::now();
        info!(
            direction = %self.config.direction,
            local = %self.config.local_root.display(),
            remote = %self.config.remote_root,
            transport = %self.transport.describe(),
            workers = self.config.workers,
            "starting sync engine"
        );

        let queue = Arc::new(TaskQueue::new(self.config.queue_capacity));
        let pool = WorkerPool::start(
            self.config.workers,
            queue.clone(),
            self.executor.clone(),
            self.excludes.clone(),
        );

        self.set_state(EngineState::Reconciling);
        let reconciled = Reconciler::new(&self.executor, &self.excludes)
            .with_cancel(token.clone())
            .run()
            .await;
        if let Err(err) = reconciled {
            error!(error = %err, "reconciliation failed");
            drain_pool(&queue, pool).await;
            self.set_state(EngineState::Stopped);
            return Err(err);
        }
        if token.is_cancelled() {
            info!("cancelled during reconciliation");
            self.set_state(EngineState::ShuttingDown);
            drain_pool(&queue, pool).await;
            self.set_state(EngineState::Stopped);
            return Ok(self.report(started));
        }

        let source_token = token.child_token();
        let mut source = match self.spawn_source(queue.clone(), source_token.clone()) {
            Ok(source) => source,
            Err(err) => {
                error!(error = %err, "change source failed to start");
                drain_pool(&queue, pool).await;
                self.set_state(EngineState::Stopped);
                return Err(err);
            }
        };
        self.set_state(EngineState::Watching);

        let source_done = tokio::select! {
            _ = token.cancelled() => false,
            _ = &mut source => true,
        };
        if source_done {
            info!("change source ended on its own");
        }

        self.set_state(EngineState::ShuttingDown);
        source_token.cancel();
        if !source_done {
            if let Err(err) = source.await {
                error!(error = %err, "change source terminated abnormally");
            }
        }
        drain_pool(&queue, pool).await;
        self.set_state(EngineState::Stopped);

        let report = self.report(started);
        info!(
            uploads = report.stats.uploads,
            downloads = report.stats.downloads,
            deletes = report.stats.deletes,
            failures = report.stats.failures,
            "sync engine stopped"
        );
        Ok(report)
    }

    fn spawn_source(
        &self,
        queue: Arc<TaskQueue>,
        token: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let translator = self.executor.translator().clone();

        match self.config.direction {
            SyncDirection::LocalToRemote => {
                let (notifier, events) = NotifyWatcher::new()?;
                let mut source = WatchSource::new(notifier, events, translator, self.excludes.clone(), queue)
                    .with_debounce(self.config.debounce_window());
                source.register_existing()?;
                Ok(tokio::spawn(source.run(token)))
            }
            SyncDirection::RemoteToLocal => {
                let poller = RemotePoller::new(
                    self.transport.clone(),
                    translator,
                    self.excludes.clone(),
                    queue,
                    self.config.poll_interval(),
                );
                Ok(tokio::spawn(poller.run(token)))
            }
        }
    }

    fn report(&self, started: Instant) -> RunReport {
        RunReport {
            stats: self.stats.snapshot(),
            elapsed: started.elapsed(),
        }
    }
}

/// Close the queue, let workers finish what is queued, then join them.
async fn drain_pool(queue: &TaskQueue, pool: WorkerPool) {
    queue.close();
    pool.join().await;
}
