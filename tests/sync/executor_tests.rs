// Tests for retries, deletes and locking behaviour of the executor

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use ftpmirror::config::SyncDirection;
use ftpmirror::error::SyncError;
use ftpmirror::sync::{ChangeTask, ExcludePatterns, PathTranslator, TransferExecutor};

use crate::common::{write_file, MemoryTransport};

fn executor(transport: &Arc<MemoryTransport>, direction: SyncDirection, local: &std::path::Path, retries: u32) -> TransferExecutor {
    TransferExecutor::new(transport.clone(), PathTranslator::new(direction, local, "/dst"), retries)
}

#[tokio::test]
async fn test_upload_retries_from_start_of_file() {
    let local = tempdir().unwrap();
    write_file(&local.path().join("a.txt"), "0123456789");

    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");
    transport.fail_stores(2);

    let executor = executor(&transport, SyncDirection::LocalToRemote, local.path(), 3);
    let bytes = executor.upload("a.txt").await.unwrap();

    assert_eq!(bytes, 10);
    assert_eq!(MemoryTransport::calls(&transport.store_calls), 3);
    // Failed attempts consumed bytes; the stored copy must still be whole
    assert_eq!(transport.file("/dst/a.txt").unwrap(), b"0123456789");
    assert_eq!(executor.stats().snapshot().uploads, 1);
}

#[tokio::test]
async fn test_upload_gives_up_after_max_retries() {
    let local = tempdir().unwrap();
    write_file(&local.path().join("a.txt"), "data");

    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");
    transport.fail_stores(10);

    let executor = executor(&transport, SyncDirection::LocalToRemote, local.path(), 3);
    let result = executor.upload("a.txt").await;

    assert!(matches!(result, Err(SyncError::UploadFailed { attempts: 3, .. })));
    assert_eq!(MemoryTransport::calls(&transport.store_calls), 3);
    assert!(transport.file("/dst/a.txt").is_none());
    assert_eq!(executor.stats().snapshot().failures, 1);
}

#[tokio::test]
async fn test_remote_delete_is_attempted_once() {
    let local = tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");

    let executor = executor(&transport, SyncDirection::LocalToRemote, local.path(), 5);
    let result = executor.delete_remote("missing.txt").await;

    assert!(matches!(result, Err(SyncError::Delete { .. })));
    assert_eq!(MemoryTransport::calls(&transport.delete_calls), 1);

    transport.add_file("/dst/present.txt", b"x");
    executor.delete_remote("present.txt").await.unwrap();
    assert_eq!(MemoryTransport::calls(&transport.delete_calls), 2);
    assert!(transport.file("/dst/present.txt").is_none());
}

#[tokio::test]
async fn test_local_delete_handles_files_and_directories() {
    let local = tempdir().unwrap();
    write_file(&local.path().join("f.txt"), "x");
    write_file(&local.path().join("d/inner.txt"), "y");

    let transport = Arc::new(MemoryTransport::new());
    let executor = executor(&transport, SyncDirection::RemoteToLocal, local.path(), 5);

    executor.delete_local("f.txt", false).await.unwrap();
    assert!(!local.path().join("f.txt").exists());

    executor.delete_local("d", true).await.unwrap();
    assert!(!local.path().join("d").exists());

    assert!(matches!(
        executor.delete_local("f.txt", false).await,
        Err(SyncError::Delete { .. })
    ));
    assert_eq!(executor.stats().snapshot().deletes, 2);
    assert_eq!(MemoryTransport::calls(&transport.delete_calls), 0);
}

#[tokio::test]
async fn test_download_retry_truncates_partial_content() {
    let local = tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");
    transport.add_dir("/dst/d");
    transport.add_file("/dst/d/b.txt", b"abcdefgh");
    transport.fail_retrieves(2);

    let executor = executor(&transport, SyncDirection::RemoteToLocal, local.path(), 3);
    let bytes = executor.download("d/b.txt").await.unwrap();

    assert_eq!(bytes, 8);
    assert_eq!(MemoryTransport::calls(&transport.retrieve_calls), 3);
    assert_eq!(std::fs::read(local.path().join("d/b.txt")).unwrap(), b"abcdefgh");
}

#[tokio::test]
async fn test_failed_download_leaves_no_file() {
    let local = tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");
    transport.add_file("/dst/a.txt", b"abcdefgh");
    transport.fail_retrieves(3);

    let executor = executor(&transport, SyncDirection::RemoteToLocal, local.path(), 3);
    let result = executor.download("a.txt").await;

    assert!(matches!(result, Err(SyncError::DownloadFailed { attempts: 3, .. })));
    assert!(!local.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_interrupted_download_leaves_no_partial_file() {
    let local = tempdir().unwrap();
    write_file(&local.path().join("kept.txt"), "old");

    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");
    transport.add_file("/dst/a.txt", b"0123456789");
    transport.add_file("/dst/kept.txt", b"new content");
    transport.stall_retrieves(Duration::from_secs(3600));

    let executor = executor(&transport, SyncDirection::RemoteToLocal, local.path(), 3);
    for name in ["a.txt", "kept.txt"] {
        let interrupted = tokio::time::timeout(Duration::from_millis(200), executor.download(name)).await;
        assert!(interrupted.is_err(), "{name} should still be transferring");
    }

    // Neither half a new file nor a clobbered old one
    assert!(!local.path().join("a.txt").exists());
    assert_eq!(std::fs::read_to_string(local.path().join("kept.txt")).unwrap(), "old");
    let names: Vec<_> = std::fs::read_dir(local.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["kept.txt"]);
    assert_eq!(executor.stats().snapshot().downloads, 0);
}

#[tokio::test]
async fn test_transfer_rejects_escaping_paths() {
    let local = tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let executor = executor(&transport, SyncDirection::LocalToRemote, local.path(), 3);

    assert!(matches!(executor.transfer("../etc/passwd").await, Err(SyncError::InvalidPath(_))));
    assert_eq!(MemoryTransport::calls(&transport.store_calls), 0);
}

#[tokio::test]
async fn test_concurrent_uploads_all_land() {
    let local = tempdir().unwrap();
    for i in 0..8 {
        write_file(&local.path().join(format!("f{i}.txt")), &format!("file {i}"));
    }
    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");

    for serialize in [false, true] {
        let executor = Arc::new(
            executor(&transport, SyncDirection::LocalToRemote, local.path(), 3).with_serialized_uploads(serialize),
        );
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.upload(&format!("f{i}.txt")).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(executor.stats().snapshot().uploads, 8);
    }

    assert_eq!(transport.file("/dst/f3.txt").unwrap(), b"file 3");
}

#[tokio::test]
async fn test_process_task_dispatches_by_kind() {
    use ftpmirror::sync::pool::process_task;
    use ftpmirror::sync::TaskKind;

    let local = tempdir().unwrap();
    write_file(&local.path().join("new/inner.txt"), "inner");
    write_file(&local.path().join("moved.txt"), "m");

    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");
    transport.add_file("/dst/gone.txt", b"g");
    transport.add_file("/dst/renamed.txt", b"r");

    let executor = executor(&transport, SyncDirection::LocalToRemote, local.path(), 3);
    let excludes = ExcludePatterns::new();

    process_task(&executor, &excludes, &ChangeTask::write("new").with_dir(true)).await.unwrap();
    assert!(transport.is_dir("/dst/new"));
    assert_eq!(transport.file("/dst/new/inner.txt").unwrap(), b"inner");

    process_task(&executor, &excludes, &ChangeTask::write("moved.txt")).await.unwrap();
    assert_eq!(transport.file("/dst/moved.txt").unwrap(), b"m");

    process_task(&executor, &excludes, &ChangeTask::remove("gone.txt")).await.unwrap();
    assert!(transport.file("/dst/gone.txt").is_none());

    // Source no longer has it: only the destination copy goes away
    process_task(&executor, &excludes, &ChangeTask::new(TaskKind::Rename, "renamed.txt")).await.unwrap();
    assert!(transport.file("/dst/renamed.txt").is_none());

    let before = executor.stats().snapshot();
    process_task(&executor, &excludes, &ChangeTask::new(TaskKind::PermissionChange, "moved.txt"))
        .await
        .unwrap();
    assert_eq!(executor.stats().snapshot(), before);
}
