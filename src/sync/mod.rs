//! One-direction mirroring between a local tree and a remote tree.
//!
//! The [`Engine`] reconciles the destination once, then keeps it current
//! from a change source: filesystem notifications when the local tree is
//! authoritative, periodic remote snapshots when the remote tree is.
//! Changes flow through a bounded [`TaskQueue`] to a fixed [`WorkerPool`]
//! that hands each task to the [`TransferExecutor`].

pub mod engine;
pub mod exclude;
pub mod executor;
pub mod paths;
pub mod poller;
pub mod pool;
pub mod queue;
pub mod reconcile;
pub mod stats;
pub mod watcher;

pub use engine::{Engine, EngineState, RunReport};
pub use exclude::ExcludePatterns;
pub use executor::TransferExecutor;
pub use paths::{PathError, PathTranslator, SyncPath};
pub use poller::{diff_snapshots, RemotePoller, RemoteSnapshot, SnapshotEntry};
pub use pool::WorkerPool;
pub use queue::{ChangeTask, TaskKind, TaskQueue};
pub use reconcile::{check_or_create_dir, Reconciler};
pub use stats::{StatsSnapshot, TransferStats};
pub use watcher::{Notifier, NotifyWatcher, WatchSource};
