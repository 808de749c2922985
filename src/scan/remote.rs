//! Remote tree scanner.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::models::FileMetadata;
use crate::remote::RemoteStore;
use crate::retry::{with_retry, RetryPolicy};
use crate::snapshot::{is_portable_name, join, FileRecord, RemoteTree};

use super::filter::PathFilter;

/// Breadth-first walk of a remote folder.
///
/// Items that cannot take part in a content sync are skipped with a warning:
/// Google editor files and shortcuts (no binary content), files without a
/// SHA-256 checksum, and names that are not valid local path components.
/// Paths the [`PathFilter`] excludes are skipped silently, folders included.
/// When one folder holds several files with the same name, the most recently
/// modified one wins.
///
/// A file sharing its path with a folder stays in the tree; reconciliation
/// reports the pair as a collision.
pub struct RemoteScanner {
    store: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    filter: PathFilter,
}

impl RemoteScanner {
    pub fn new(store: Arc<dyn RemoteStore>, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            store,
            retry,
            cancel,
            filter: PathFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub async fn scan(&self, root_id: &str) -> Result<RemoteTree, SyncError> {
        let mut tree = RemoteTree {
            root_id: root_id.to_string(),
            ..Default::default()
        };
        tree.folders.insert(String::new(), root_id.to_string());

        let mut queue = VecDeque::from([(String::new(), root_id.to_string())]);
        while let Some((folder_path, folder_id)) = queue.pop_front() {
            let label = if folder_path.is_empty() { "/" } else { folder_path.as_str() };
            let children = with_retry(&self.retry, &self.cancel, label, || {
                self.store.list_children(&folder_id)
            })
            .await?;
            debug!(folder = label, count = children.len(), "listed remote folder");

            for item in children {
                if !is_portable_name(&item.name) {
                    warn!(folder = label, name = %item.name, "skipping remote item with unusable name");
                    continue;
                }
                let path = join(&folder_path, &item.name);
                if self.filter.is_excluded(&path) {
                    debug!(path = %path, "skipping excluded remote item");
                    continue;
                }

                if item.is_folder() {
                    if tree.folders.contains_key(&path) {
                        warn!(path = %path, "skipping duplicate remote folder");
                        continue;
                    }
                    tree.folders.insert(path.clone(), item.id.clone());
                    queue.push_back((path, item.id));
                    continue;
                }

                if let Some(record) = file_record(&path, item) {
                    insert_latest(&mut tree, record);
                }
            }
        }

        info!(files = tree.files.len(), folders = tree.folders.len() - 1, "remote scan complete");
        Ok(tree)
    }
}

fn file_record(path: &str, item: FileMetadata) -> Option<FileRecord> {
    if item.is_google_native() {
        warn!(path, mime_type = ?item.mime_type, "skipping Google editor file");
        return None;
    }
    let Some(content_hash) = item.sha256_checksum else {
        warn!(path, "skipping remote file without a SHA-256 checksum");
        return None;
    };
    Some(FileRecord {
        relative_path: path.to_string(),
        content_hash,
        size: item.size.unwrap_or(0),
        modified_time: item.modified_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        remote_id: Some(item.id),
    })
}

fn insert_latest(tree: &mut RemoteTree, record: FileRecord) {
    match tree.files.get(&record.relative_path) {
        Some(existing) => {
            warn!(path = %record.relative_path, "duplicate remote file name, keeping the newest");
            if record.modified_time > existing.modified_time {
                tree.files.insert(record.relative_path.clone(), record);
            }
        }
        None => {
            tree.files.insert(record.relative_path.clone(), record);
        }
    }
}
