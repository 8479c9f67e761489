use chrono::{DateTime, Utc};

/// One entry of a directory listing, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn file(name: impl Into<String>, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir: false,
            modified,
        }
    }

    pub fn dir(name: impl Into<String>, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            is_dir: true,
            modified,
        }
    }
}

/// Join a POSIX style parent path and a child name.
pub fn join_remote(parent: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Split a POSIX style path into its parent and final component.
pub fn split_remote(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    }
}
