//! Base directory scanning with `.surfignore` support via the `ignore` crate
//!
//! Only regular files directly inside the base directory are synchronized;
//! the client's own state directory and config file are never reported.
//! Ignored names are invisible to the scan, and the same [`IgnoreRules`]
//! keep reconciliation from treating them as deleted.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use ignore::WalkBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::warn;

use crate::chunker::hash_file;
use crate::config::CONFIG_FILE;
use crate::hash::BlockHash;
use crate::index::STATE_DIR;

/// Filename for ignore patterns (gitignore syntax)
pub const IGNORE_FILE: &str = ".surfignore";

/// A file found on disk with its current block hashes
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LocalFile {
    /// Name relative to the base directory
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Block hashes in file order
    pub block_hashes: Vec<BlockHash>,
}

/// Compiled ignore patterns of one base directory
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    /// Rules that ignore nothing
    #[must_use]
    pub fn none() -> Self {
        Self {
            matcher: Gitignore::empty(),
        }
    }

    /// Compile `.surfignore` under `root` (if present) plus `extra` patterns.
    ///
    /// # Errors
    /// Returns an error if the ignore file cannot be read or a pattern is
    /// invalid.
    pub fn load(root: &Path, extra: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);

        let ignore_file = root.join(IGNORE_FILE);
        if ignore_file.is_file() {
            if let Some(err) = builder.add(&ignore_file) {
                return Err(err)
                    .wrap_err_with(|| format!("failed to read {}", ignore_file.display()));
            }
        }
        for pattern in extra {
            builder.add_line(None, pattern)?;
        }

        Ok(Self {
            matcher: builder.build()?,
        })
    }

    /// Check whether a base-directory filename is ignored
    #[must_use]
    pub fn is_ignored(&self, name: &str) -> bool {
        self.matcher.matched(name, false).is_ignore()
    }
}

/// Scanner for a synchronized base directory
pub struct Scanner {
    root: PathBuf,
    block_size: usize,
    /// Additional ignore patterns beyond `.surfignore`
    extra_ignores: Vec<String>,
}

impl Scanner {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, block_size: usize) -> Self {
        Self {
            root: root.into(),
            block_size,
            extra_ignores: Vec::new(),
        }
    }

    /// Add an extra ignore pattern
    #[must_use]
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.extra_ignores.push(pattern.into());
        self
    }

    /// Ignore rules from `.surfignore` and the extra patterns
    ///
    /// # Errors
    /// Returns an error if the ignore file or a pattern is invalid
    pub fn rules(&self) -> Result<IgnoreRules> {
        IgnoreRules::load(&self.root, &self.extra_ignores)
    }

    fn walk_builder(&self) -> WalkBuilder {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .max_depth(Some(1))
            .standard_filters(false)
            .filter_entry(|e| e.file_name() != STATE_DIR && e.file_name() != CONFIG_FILE);
        builder
    }

    /// Scan the directory and hash every file not ignored by `.surfignore`
    ///
    /// # Errors
    /// Returns an error if directory traversal or file reading fails
    pub fn scan(&self) -> Result<Vec<LocalFile>> {
        self.scan_with(&self.rules()?)
    }

    /// Scan the directory and hash every file not ignored by `rules`
    ///
    /// # Errors
    /// Returns an error if directory traversal or file reading fails
    pub fn scan_with(&self, rules: &IgnoreRules) -> Result<Vec<LocalFile>> {
        let mut files = Vec::new();

        for result in self.walk_builder().build() {
            let entry = result?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let path = entry.path();
            let Some(name) = path
                .strip_prefix(&self.root)?
                .to_str()
                .map(str::to_string)
            else {
                warn!("skipping non UTF-8 filename {}", path.display());
                continue;
            };
            if rules.is_ignored(&name) {
                continue;
            }

            let size = entry.metadata()?.len();
            let block_hashes = hash_file(path, self.block_size)
                .wrap_err_with(|| format!("failed to hash {}", path.display()))?;

            files.push(LocalFile {
                name,
                size,
                block_hashes,
            });
        }

        // Sort for deterministic ordering
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(files)
    }
}
