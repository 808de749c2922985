//! Local tree scanner.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::snapshot::{hash_file, FileRecord, Snapshot};

use super::filter::{relative_to, PathFilter};

/// Prefix of in-progress download files; never part of a snapshot.
pub const PARTIAL_PREFIX: &str = ".drive_sync.";

/// Suffix of in-progress download files.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Walks a local root and hashes every regular file.
///
/// Symlinks are not followed. Whatever the [`PathFilter`] excludes is left
/// out, directories included.
#[derive(Debug, Clone)]
pub struct LocalScanner {
    root: PathBuf,
    filter: PathFilter,
}

impl LocalScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            filter: PathFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan on the blocking pool.
    pub async fn scan(&self) -> Result<Snapshot, SyncError> {
        let scanner = self.clone();
        tokio::task::spawn_blocking(move || scanner.scan_blocking())
            .await
            .map_err(|e| SyncError::local_io(&self.root, std::io::Error::other(e)))?
    }

    /// Walk and hash synchronously.
    ///
    /// Any unreadable entry fails the whole scan: a file silently missing
    /// from the snapshot would look like a local deletion.
    pub fn scan_blocking(&self) -> Result<Snapshot, SyncError> {
        let mut snapshot = Snapshot::new();

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| match self.relative(entry.path()) {
                Some(rel) if !rel.is_empty() => !self.filter.is_excluded(&rel),
                _ => true,
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                SyncError::local_io(path, source)
            })?;

            let file_type = entry.file_type();
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "skipping symlink");
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let Some(relative_path) = self.relative(entry.path()) else {
                warn!(path = %entry.path().display(), "skipping file with non UTF-8 name");
                continue;
            };

            let metadata = entry
                .metadata()
                .map_err(|e| SyncError::local_io(entry.path(), e.into()))?;
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
            let content_hash =
                hash_file(entry.path()).map_err(|e| SyncError::local_io(entry.path(), e))?;

            snapshot.insert(
                relative_path.clone(),
                FileRecord {
                    relative_path,
                    content_hash,
                    size: metadata.len(),
                    modified_time: DateTime::<Utc>::from(modified),
                    remote_id: None,
                },
            );
        }

        info!(root = %self.root.display(), files = snapshot.len(), "local scan complete");
        Ok(snapshot)
    }

    fn relative(&self, path: &Path) -> Option<String> {
        relative_to(&self.root, path)
    }
}
