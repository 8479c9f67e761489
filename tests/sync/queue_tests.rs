// Tests for the task queue and the worker pool

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use ftpmirror::config::SyncDirection;
use ftpmirror::sync::{ChangeTask, ExcludePatterns, PathTranslator, TaskQueue, TransferExecutor, WorkerPool};

use crate::common::{write_file, MemoryTransport};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_producers_and_consumers_drain() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;
    const CONSUMERS: usize = 3;

    let queue = Arc::new(TaskQueue::new(2));
    let processed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(std::sync::Mutex::new(HashSet::new()));

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            let processed = processed.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                while let Some(task) = queue.pop().await {
                    seen.lock().unwrap().insert(task.path);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.complete();
                }
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    queue.push(ChangeTask::write(format!("p{p}/{i}"))).await.unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), queue.wait_drained())
        .await
        .expect("queue drains");
    assert_eq!(queue.outstanding(), 0);
    assert_eq!(processed.load(Ordering::SeqCst), PRODUCERS * PER_PRODUCER);
    assert_eq!(seen.lock().unwrap().len(), PRODUCERS * PER_PRODUCER);

    queue.close();
    for consumer in consumers {
        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer exits after close")
            .unwrap();
    }
}

#[tokio::test]
async fn test_wait_drained_waits_for_completion_not_dequeue() {
    let queue = Arc::new(TaskQueue::new(4));
    queue.push(ChangeTask::write("a")).await.unwrap();
    let _task = queue.pop().await.unwrap();

    let early = tokio::time::timeout(Duration::from_millis(50), queue.wait_drained()).await;
    assert!(early.is_err(), "dequeued but unfinished task keeps the queue busy");

    queue.complete();
    tokio::time::timeout(Duration::from_secs(1), queue.wait_drained())
        .await
        .expect("drained after completion");
}

#[tokio::test]
async fn test_pool_survives_failing_tasks() {
    let local = tempdir().unwrap();
    write_file(&local.path().join("ok1.txt"), "1");
    write_file(&local.path().join("ok2.txt"), "2");

    let transport = Arc::new(MemoryTransport::new());
    transport.add_dir("/dst");
    let executor = Arc::new(TransferExecutor::new(
        transport.clone(),
        PathTranslator::new(SyncDirection::LocalToRemote, local.path(), "/dst"),
        2,
    ));
    let queue = Arc::new(TaskQueue::new(2));
    let pool = WorkerPool::start(3, queue.clone(), executor.clone(), Arc::new(ExcludePatterns::new()));
    assert_eq!(pool.size(), 3);

    queue.push(ChangeTask::write("missing.txt")).await.unwrap();
    queue.push(ChangeTask::write("ok1.txt")).await.unwrap();
    queue.push(ChangeTask::remove("never-there.txt")).await.unwrap();
    queue.push(ChangeTask::write("ok2.txt")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), queue.wait_drained())
        .await
        .expect("all tasks complete");
    queue.close();
    pool.join().await;

    assert_eq!(transport.file("/dst/ok1.txt").unwrap(), b"1");
    assert_eq!(transport.file("/dst/ok2.txt").unwrap(), b"2");
    let stats = executor.stats().snapshot();
    assert_eq!(stats.uploads, 2);
    assert_eq!(stats.failures, 1);
}
