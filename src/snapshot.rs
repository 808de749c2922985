//! File records and snapshots shared by the scanners, the reconciler and the executor.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One file as seen on one side at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// `/`-separated path relative to the sync root.
    pub relative_path: String,
    /// Lowercase hex SHA-256 of the content.
    pub content_hash: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    /// Drive file ID; `None` for local records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl FileRecord {
    pub fn file_name(&self) -> &str {
        file_name(&self.relative_path)
    }
}

/// Records keyed by relative path. Ordered so plans come out deterministic.
pub type Snapshot = BTreeMap<String, FileRecord>;

/// What the remote scanner saw: files plus the folders holding them.
#[derive(Debug, Clone, Default)]
pub struct RemoteTree {
    pub root_id: String,
    pub files: Snapshot,
    /// Folder relative path -> folder ID. The root is stored under `""`.
    pub folders: BTreeMap<String, String>,
}

/// Hash a file's content with SHA-256, streaming from disk.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash an in-memory buffer; same encoding as [`hash_file`].
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Last component of a relative path.
pub fn file_name(relative_path: &str) -> &str {
    relative_path
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(relative_path)
}

/// Parent directory of a relative path, `""` for top-level entries.
pub fn parent_dir(relative_path: &str) -> &str {
    relative_path
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .unwrap_or("")
}

/// Join a parent relative path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Whether a remote name can be used as a single local path component.
pub fn is_portable_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

/// Resolve a relative path under `root` using platform separators.
pub fn local_path(root: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .split('/')
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}
