use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::fs::types::{split_remote, FileEntry};

/// Readable byte stream handed to [`Transport::store`].
pub type ByteReader<'a> = dyn AsyncRead + Unpin + Send + 'a;

/// Writable byte stream handed to [`Transport::retrieve`].
pub type ByteWriter<'a> = dyn AsyncWrite + Unpin + Send + 'a;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("server rejected request ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }
}

/// Authenticated file-transfer client the sync engine drives.
///
/// All paths are absolute on the remote side and use `/` as separator.
#[async_trait]
pub trait Transport: Send + Sync {
    // ========== Metadata ==========

    /// List the entries directly below `path`.
    async fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>, TransportError>;

    /// Metadata of a single entry, `NotFound` if it is absent.
    async fn stat(&self, path: &str) -> Result<FileEntry, TransportError> {
        // Default implementation using list_dir on the parent
        let (parent, name) = split_remote(path);
        let entries = match self.list_dir(parent).await {
            Ok(entries) => entries,
            Err(TransportError::Rejected { .. }) => {
                return Err(TransportError::NotFound(path.to_string()))
            }
            Err(err) => return Err(err),
        };
        entries
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    // ========== File Transfer ==========

    /// Write the whole of `reader` to `path`, replacing any existing file.
    async fn store(&self, path: &str, reader: &mut ByteReader<'_>) -> Result<u64, TransportError>;

    /// Copy the content of `path` into `writer`.
    async fn retrieve(&self, path: &str, writer: &mut ByteWriter<'_>) -> Result<u64, TransportError>;

    // ========== Mutation ==========

    /// Delete a file or an empty directory.
    async fn delete(&self, path: &str) -> Result<(), TransportError>;

    /// Create a single directory. Parents are not created.
    async fn make_dir(&self, path: &str) -> Result<(), TransportError>;

    /// Short label for logs.
    fn describe(&self) -> String;
}
