// Shared fixtures: an in-memory transport with failure injection

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use ftpmirror::fs::{split_remote, ByteReader, ByteWriter, FileEntry, Transport, TransportError};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// Remote tree kept in memory. `/` always exists.
#[derive(Default)]
pub struct MemoryTransport {
    nodes: Mutex<BTreeMap<String, Node>>,
    store_failures: AtomicU32,
    retrieve_failures: AtomicU32,
    retrieve_stall: Mutex<Option<Duration>>,
    reject_existing_dirs: bool,
    pub store_calls: AtomicUsize,
    pub retrieve_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub make_dir_calls: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an existing directory as a generic 550 instead of "exists",
    /// like servers that do not distinguish the two.
    pub fn rejecting_existing_dirs() -> Self {
        Self {
            reject_existing_dirs: true,
            ..Self::default()
        }
    }

    /// The next `count` stores consume part of the input, then fail.
    pub fn fail_stores(&self, count: u32) {
        self.store_failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` retrieves write part of the content, then fail.
    pub fn fail_retrieves(&self, count: u32) {
        self.retrieve_failures.store(count, Ordering::SeqCst);
    }

    /// Every retrieve writes half of the content, then pauses for `pause`
    /// before writing the rest.
    pub fn stall_retrieves(&self, pause: Duration) {
        *self.retrieve_stall.lock().unwrap() = Some(pause);
    }

    pub fn add_dir(&self, path: &str) {
        self.nodes.lock().unwrap().insert(path.to_string(), Node::Dir);
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(path) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        path == "/" || matches!(self.nodes.lock().unwrap().get(path), Some(Node::Dir))
    }

    pub fn paths(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn parent_exists(&self, path: &str) -> bool {
        let (parent, _) = split_remote(path);
        self.is_dir(parent)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>, TransportError> {
        if !self.is_dir(path) {
            return Err(TransportError::NotFound(path.to_string()));
        }
        let nodes = self.nodes.lock().unwrap();
        let mut entries: Vec<FileEntry> = nodes
            .iter()
            .filter(|(candidate, _)| {
                let (parent, name) = split_remote(candidate);
                parent == path && !name.is_empty()
            })
            .map(|(candidate, node)| {
                let (_, name) = split_remote(candidate);
                match node {
                    Node::Dir => FileEntry::dir(name, Some(Utc::now())),
                    Node::File(content) => FileEntry::file(name, content.len() as u64, Some(Utc::now())),
                }
            })
            .collect();
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then(a.name.cmp(&b.name)));
        Ok(entries)
    }

    async fn store(&self, path: &str, reader: &mut ByteReader<'_>) -> Result<u64, TransportError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if !self.parent_exists(path) {
            return Err(TransportError::NotFound(path.to_string()));
        }

        if Self::take_failure(&self.store_failures) {
            let mut partial = [0u8; 2];
            let _ = reader.read(&mut partial).await?;
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected store failure",
            )));
        }

        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        let bytes = content.len() as u64;
        self.nodes.lock().unwrap().insert(path.to_string(), Node::File(content));
        Ok(bytes)
    }

    async fn retrieve(&self, path: &str, writer: &mut ByteWriter<'_>) -> Result<u64, TransportError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        let content = self.file(path).ok_or_else(|| TransportError::NotFound(path.to_string()))?;

        if Self::take_failure(&self.retrieve_failures) {
            let half = content.len() / 2;
            writer.write_all(&content[..half]).await?;
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected retrieve failure",
            )));
        }

        let stall = *self.retrieve_stall.lock().unwrap();
        match stall {
            Some(pause) => {
                let half = content.len() / 2;
                writer.write_all(&content[..half]).await?;
                writer.flush().await?;
                tokio::time::sleep(pause).await;
                writer.write_all(&content[half..]).await?;
            }
            None => writer.write_all(&content).await?,
        }
        writer.flush().await?;
        Ok(content.len() as u64)
    }

    async fn delete(&self, path: &str) -> Result<(), TransportError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut nodes = self.nodes.lock().unwrap();
        let prefix = format!("{path}/");
        if nodes.keys().any(|candidate| candidate.starts_with(&prefix)) {
            return Err(TransportError::Rejected {
                code: 550,
                message: "directory not empty".to_string(),
            });
        }
        nodes
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    async fn make_dir(&self, path: &str) -> Result<(), TransportError> {
        self.make_dir_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_dir(path) && !self.reject_existing_dirs {
            return Err(TransportError::AlreadyExists(path.to_string()));
        }
        if self.is_dir(path) || self.file(path).is_some() {
            return Err(TransportError::Rejected {
                code: 550,
                message: "cannot create directory".to_string(),
            });
        }
        if !self.parent_exists(path) {
            return Err(TransportError::NotFound(path.to_string()));
        }
        self.add_dir(path);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

pub fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}
