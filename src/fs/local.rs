use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::fs::backend::{ByteReader, ByteWriter, Transport, TransportError};
use crate::fs::types::FileEntry;

pub struct LocalFs;

impl LocalFs {
    /// List a local directory, directories first, then by name.
    pub async fn list_dir(path: &Path) -> io::Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Removed between listing and stat
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(Self::entry_from_metadata(name, &metadata));
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });

        Ok(entries)
    }

    pub fn entry_from_metadata(name: String, metadata: &std::fs::Metadata) -> FileEntry {
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        FileEntry {
            name,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
            modified,
        }
    }

    /// Create a directory and its parents; an existing directory is fine.
    pub async fn create_dir(path: &Path) -> io::Result<()> {
        match fs::create_dir_all(path).await {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
            other => other,
        }
    }

    /// Remove a file, or a whole tree when `is_dir` is set.
    pub async fn delete(path: &Path, is_dir: bool) -> io::Result<()> {
        if is_dir {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        }
    }
}

/// Transport rooted in a local directory.
///
/// Remote paths are resolved beneath `root` the way an FTP server resolves
/// them beneath its chroot, so `/dst/a.txt` maps to `<root>/dst/a.txt`.
pub struct LocalBackend {
    pub root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, TransportError> {
        let mut full = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path escapes backend root: {path}"),
                    )))
                }
            }
        }
        Ok(full)
    }
}

fn map_io(err: io::Error, path: &str) -> TransportError {
    match err.kind() {
        io::ErrorKind::NotFound => TransportError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => TransportError::AlreadyExists(path.to_string()),
        _ => TransportError::Io(err),
    }
}

#[async_trait]
impl Transport for LocalBackend {
    async fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>, TransportError> {
        let full = self.full_path(path)?;
        LocalFs::list_dir(&full).await.map_err(|err| map_io(err, path))
    }

    async fn stat(&self, path: &str) -> Result<FileEntry, TransportError> {
        let full = self.full_path(path)?;
        let metadata = fs::metadata(&full).await.map_err(|err| map_io(err, path))?;
        let name = full
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(LocalFs::entry_from_metadata(name, &metadata))
    }

    async fn store(&self, path: &str, reader: &mut ByteReader<'_>) -> Result<u64, TransportError> {
        let full = self.full_path(path)?;
        let mut file = fs::File::create(&full).await.map_err(|err| map_io(err, path))?;
        let bytes = tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        Ok(bytes)
    }

    async fn retrieve(&self, path: &str, writer: &mut ByteWriter<'_>) -> Result<u64, TransportError> {
        let full = self.full_path(path)?;
        let mut file = fs::File::open(&full).await.map_err(|err| map_io(err, path))?;
        let bytes = tokio::io::copy(&mut file, writer).await?;
        writer.flush().await?;
        Ok(bytes)
    }

    async fn delete(&self, path: &str) -> Result<(), TransportError> {
        let full = self.full_path(path)?;
        let metadata = fs::symlink_metadata(&full).await.map_err(|err| map_io(err, path))?;
        LocalFs::delete(&full, metadata.is_dir())
            .await
            .map_err(|err| map_io(err, path))
    }

    async fn make_dir(&self, path: &str) -> Result<(), TransportError> {
        let full = self.full_path(path)?;
        fs::create_dir(&full).await.map_err(|err| map_io(err, path))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}
