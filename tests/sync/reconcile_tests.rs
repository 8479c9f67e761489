// Tests for the startup reconciliation pass

use std::sync::Arc;

use tempfile::tempdir;

use ftpmirror::config::SyncDirection;
use ftpmirror::error::SyncError;
use ftpmirror::fs::{LocalBackend, Transport, TransportError};
use ftpmirror::sync::{check_or_create_dir, ExcludePatterns, PathTranslator, Reconciler, TransferExecutor};

use crate::common::{write_file, MemoryTransport};

fn executor(transport: Arc<dyn Transport>, direction: SyncDirection, local: &std::path::Path) -> TransferExecutor {
    TransferExecutor::new(transport, PathTranslator::new(direction, local, "/dst"), 3)
}

#[tokio::test]
async fn test_reconcile_uploads_tree_to_empty_remote() {
    let local = tempdir().unwrap();
    let remote = tempdir().unwrap();
    write_file(&local.path().join("a.txt"), "alpha");
    write_file(&local.path().join("d/b.txt"), "beta");

    let transport = Arc::new(LocalBackend::new(remote.path().to_path_buf()));
    let executor = executor(transport, SyncDirection::LocalToRemote, local.path());
    let excludes = ExcludePatterns::new();

    Reconciler::new(&executor, &excludes).run().await.unwrap();

    let dst = remote.path().join("dst");
    assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "alpha");
    assert!(dst.join("d").is_dir());
    assert_eq!(std::fs::read_to_string(dst.join("d/b.txt")).unwrap(), "beta");

    let stats = executor.stats().snapshot();
    assert_eq!(stats.uploads, 2);
    assert_eq!(stats.bytes, 9);
}

#[tokio::test]
async fn test_second_reconcile_transfers_nothing() {
    let local = tempdir().unwrap();
    write_file(&local.path().join("a.txt"), "alpha");
    write_file(&local.path().join("d/e/c.txt"), "gamma");

    let transport = Arc::new(MemoryTransport::new());
    let executor = executor(transport.clone(), SyncDirection::LocalToRemote, local.path());
    let excludes = ExcludePatterns::new();
    let reconciler = Reconciler::new(&executor, &excludes);

    reconciler.run().await.unwrap();
    let first = executor.stats().snapshot();
    let stores = MemoryTransport::calls(&transport.store_calls);
    assert_eq!(first.uploads, 2);

    reconciler.run().await.unwrap();
    let second = executor.stats().snapshot();
    assert_eq!(second.transfers(), first.transfers());
    assert_eq!(second.dirs_created, first.dirs_created);
    assert_eq!(MemoryTransport::calls(&transport.store_calls), stores);
}

#[tokio::test]
async fn test_reconcile_never_overwrites_existing_destination_file() {
    let local = tempdir().unwrap();
    write_file(&local.path().join("a.txt"), "new content");

    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");
    transport.add_file("/dst/a.txt", b"old");

    let executor = executor(transport.clone(), SyncDirection::LocalToRemote, local.path());
    let excludes = ExcludePatterns::new();
    Reconciler::new(&executor, &excludes).run().await.unwrap();

    assert_eq!(transport.file("/dst/a.txt").unwrap(), b"old");
    assert_eq!(MemoryTransport::calls(&transport.store_calls), 0);
}

#[tokio::test]
async fn test_reconcile_skips_excluded_entries() {
    let local = tempdir().unwrap();
    write_file(&local.path().join("keep.txt"), "k");
    write_file(&local.path().join("notes.swp"), "s");
    write_file(&local.path().join(".git/HEAD"), "ref");

    let transport = Arc::new(MemoryTransport::new());
    let executor = executor(transport.clone(), SyncDirection::LocalToRemote, local.path());
    let excludes = ExcludePatterns::with_defaults();
    Reconciler::new(&executor, &excludes).run().await.unwrap();

    assert_eq!(transport.paths(), vec!["/dst".to_string(), "/dst/keep.txt".to_string()]);
}

#[tokio::test]
async fn test_reconcile_downloads_remote_tree() {
    let local = tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");
    transport.add_file("/dst/a.txt", b"alpha");
    transport.add_dir("/dst/d");
    transport.add_file("/dst/d/b.txt", b"beta");
    transport.add_dir("/dst/empty");

    let mirror = local.path().join("mirror");
    let executor = executor(transport, SyncDirection::RemoteToLocal, &mirror);
    let excludes = ExcludePatterns::new();
    Reconciler::new(&executor, &excludes).run().await.unwrap();

    assert_eq!(std::fs::read_to_string(mirror.join("a.txt")).unwrap(), "alpha");
    assert_eq!(std::fs::read_to_string(mirror.join("d/b.txt")).unwrap(), "beta");
    assert!(mirror.join("empty").is_dir());
    assert_eq!(executor.stats().snapshot().downloads, 2);
}

#[tokio::test]
async fn test_reconcile_missing_source_is_reconcile_error() {
    let local = tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());

    let executor = executor(transport, SyncDirection::RemoteToLocal, local.path());
    let excludes = ExcludePatterns::new();
    let result = Reconciler::new(&executor, &excludes).run().await;

    match result {
        Err(SyncError::Reconcile { path, .. }) => assert_eq!(path, "/dst"),
        other => panic!("expected a reconcile error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_check_or_create_dir_is_idempotent() {
    let transport = MemoryTransport::new();

    assert!(check_or_create_dir(&transport, "/x/y/z").await.unwrap());
    assert!(transport.is_dir("/x") && transport.is_dir("/x/y") && transport.is_dir("/x/y/z"));

    assert!(!check_or_create_dir(&transport, "/x/y/z").await.unwrap());
    assert!(matches!(
        transport.make_dir("/x/y").await,
        Err(TransportError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_check_or_create_dir_stats_ambiguous_failures() {
    let transport = MemoryTransport::rejecting_existing_dirs();
    transport.add_dir("/x");

    assert!(check_or_create_dir(&transport, "/x/y").await.unwrap());
    assert!(!check_or_create_dir(&transport, "/x/y").await.unwrap());

    transport.add_file("/file", b"not a directory");
    assert!(check_or_create_dir(&transport, "/file/sub").await.is_err());
}
