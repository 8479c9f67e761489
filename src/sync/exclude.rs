//! Exclusion patterns for the reconciler and both change sources.

use std::path::{Component, Path};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::ConfigError;

/// Built-in patterns, enabled with `use_default_excludes`.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // Version control
    ".git",
    ".svn",
    ".hg",
    // OS litter
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    // Editor swap and backup files
    "*.swp",
    "*.swo",
    "*~",
    ".#*",
    // Partial downloads
    "*.part",
    "*.crdownload",
];

/// Compiled glob set matched against canonical relative paths.
#[derive(Debug, Clone)]
pub struct ExcludePatterns {
    glob_set: GlobSet,
    patterns: Vec<String>,
}

impl Default for ExcludePatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl ExcludePatterns {
    /// Empty set: nothing is excluded.
    pub fn new() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut patterns = Vec::new();

        for pattern in DEFAULT_EXCLUDES {
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
                patterns.push(pattern.to_string());
            }
        }

        Self {
            glob_set: builder.build().unwrap_or_else(|_| GlobSet::empty()),
            patterns,
        }
    }

    pub fn add_pattern(&mut self, pattern: &str) -> Result<(), ConfigError> {
        let to_error = |source| ConfigError::Pattern {
            pattern: pattern.to_string(),
            source,
        };

        // Rebuild the glob set with the new pattern
        let mut builder = GlobSetBuilder::new();
        for existing in &self.patterns {
            if let Ok(glob) = Glob::new(existing) {
                builder.add(glob);
            }
        }
        builder.add(Glob::new(pattern).map_err(to_error)?);

        self.glob_set = builder.build().map_err(to_error)?;
        self.patterns.push(pattern.to_string());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether a canonical relative path (`d/b.txt`) is excluded.
    ///
    /// Matches the whole path, then every component, so `node_modules`
    /// also excludes everything below it.
    pub fn is_excluded(&self, relative: &str) -> bool {
        if self.is_empty() || relative.is_empty() {
            return false;
        }
        if self.glob_set.is_match(relative) {
            return true;
        }

        Path::new(relative).components().any(|component| match component {
            Component::Normal(name) => self.glob_set.is_match(name.to_string_lossy().as_ref()),
            _ => false,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}
