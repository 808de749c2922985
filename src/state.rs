//! Persistent sync state: the last agreed-upon view of every synced path.
//!
//! The state lives in two files next to each other:
//!
//! - `state.json`, a full snapshot rewritten atomically at the end of a sync;
//! - `state.journal`, one JSON [`StateMutation`] per line, appended after
//!   each completed action.
//!
//! Loading replays the journal over the snapshot, so an interrupted sync
//! keeps every action it finished.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::reconcile::ConflictKind;
use crate::scan::local::{PARTIAL_PREFIX, PARTIAL_SUFFIX};
use crate::snapshot::FileRecord;

/// Directory under the local root holding the default state files.
pub const STATE_DIR: &str = ".drive_sync";

/// Snapshot file name inside [`STATE_DIR`].
pub const STATE_FILE: &str = "state.json";

const STATE_VERSION: u32 = 1;

/// What both sides looked like when a path was last in agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub local_hash: String,
    pub remote_id: String,
    pub remote_hash: String,
    pub size: u64,
    pub last_synced_time: DateTime<Utc>,
}

impl StateEntry {
    /// Entry for a path whose local and remote copies now agree.
    pub fn synced(local: &FileRecord, remote: &FileRecord) -> Self {
        Self {
            local_hash: local.content_hash.clone(),
            remote_id: remote.remote_id.clone().unwrap_or_default(),
            remote_hash: remote.content_hash.clone(),
            size: local.size,
            last_synced_time: Utc::now(),
        }
    }

    /// Whether this entry still describes the given pair of records.
    pub fn matches(&self, local: &FileRecord, remote: &FileRecord) -> bool {
        self.local_hash == local.content_hash
            && self.remote_hash == remote.content_hash
            && Some(&self.remote_id) == remote.remote_id.as_ref()
    }
}

/// How the operator decided a conflict should end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
}

/// A conflict found by a previous sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub kind: ConflictKind,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

/// Full persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub version: u32,
    /// Remote folder this state was built against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_root_id: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, StateEntry>,
    #[serde(default)]
    pub conflicts: BTreeMap<String, ConflictRecord>,
}

impl SyncState {
    pub fn apply(&mut self, mutation: StateMutation) {
        match mutation {
            StateMutation::Put { path, entry } => {
                self.conflicts.remove(&path);
                self.entries.insert(path, entry);
            }
            StateMutation::Remove { path } => {
                self.conflicts.remove(&path);
                self.entries.remove(&path);
            }
            StateMutation::Conflict { path, kind } => {
                self.conflicts.insert(
                    path,
                    ConflictRecord {
                        kind,
                        detected_at: Utc::now(),
                        resolution: None,
                    },
                );
            }
            StateMutation::Resolve { path, resolution } => {
                if let Some(record) = self.conflicts.get_mut(&path) {
                    record.resolution = Some(resolution);
                }
            }
            StateMutation::ClearConflict { path } => {
                self.conflicts.remove(&path);
            }
        }
    }
}

/// One journaled change. Put and Remove also drop any conflict on the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateMutation {
    Put { path: String, entry: StateEntry },
    Remove { path: String },
    Conflict { path: String, kind: ConflictKind },
    Resolve { path: String, resolution: Resolution },
    ClearConflict { path: String },
}

/// Owner of the state files.
pub struct StateStore {
    path: PathBuf,
    journal_path: PathBuf,
    state: SyncState,
    journal: Option<BufWriter<File>>,
}

impl StateStore {
    /// Default state location for a local root.
    pub fn default_path(local_root: &Path) -> PathBuf {
        local_root.join(STATE_DIR).join(STATE_FILE)
    }

    /// Load the snapshot (empty when absent) and replay any journal left behind.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let journal_path = path.with_extension("journal");

        let mut state = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| SyncError::State {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SyncState::default(),
            Err(e) => return Err(SyncError::local_io(&path, e)),
        };

        let replayed = replay_journal(&journal_path, &mut state)?;
        if replayed > 0 {
            debug!(count = replayed, "replayed journal entries");
        }

        Ok(Self {
            path,
            journal_path,
            state,
            journal: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Tie the state to a remote folder, refusing a state built for another one.
    pub fn bind_remote_root(&mut self, remote_root_id: &str) -> Result<(), SyncError> {
        match &self.state.remote_root_id {
            Some(recorded) if recorded != remote_root_id => Err(SyncError::StateMismatch {
                recorded: recorded.clone(),
                requested: remote_root_id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.state.remote_root_id = Some(remote_root_id.to_string());
                Ok(())
            }
        }
    }

    /// Durably record one mutation, then apply it in memory.
    pub fn commit(&mut self, mutation: StateMutation) -> Result<(), SyncError> {
        let line = serde_json::to_string(&mutation).map_err(|source| SyncError::State {
            path: self.journal_path.clone(),
            source,
        })?;

        if self.journal.is_none() {
            self.journal = Some(open_journal(&self.journal_path)?);
        }
        if let Some(journal) = self.journal.as_mut() {
            writeln!(journal, "{}", line)
                .and_then(|_| journal.flush())
                .and_then(|_| journal.get_ref().sync_data())
                .map_err(|e| SyncError::local_io(&self.journal_path, e))?;
        }

        self.state.apply(mutation);
        Ok(())
    }

    /// Record the operator's choice for a recorded conflict and persist it.
    ///
    /// The next sync turns the choice into the matching action.
    pub fn resolve_conflict(&mut self, path: &str, resolution: Resolution) -> Result<(), SyncError> {
        if !self.state.conflicts.contains_key(path) {
            return Err(SyncError::Config(format!("no recorded conflict at {path}")));
        }
        self.commit(StateMutation::Resolve {
            path: path.to_string(),
            resolution,
        })?;
        self.compact()
    }

    /// Rewrite the snapshot atomically and drop the journal.
    pub fn compact(&mut self) -> Result<(), SyncError> {
        self.state.version = STATE_VERSION;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| SyncError::local_io(dir, e))?;

        // Named like a partial download so a state file inside the sync root
        // is never picked up half-written.
        let mut tmp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(dir)
            .map_err(|e| SyncError::local_io(dir, e))?;
        serde_json::to_writer_pretty(&mut tmp, &self.state).map_err(|source| SyncError::State {
            path: self.path.clone(),
            source,
        })?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| SyncError::local_io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| SyncError::local_io(&self.path, e.error))?;

        self.journal = None;
        match fs::remove_file(&self.journal_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::local_io(&self.journal_path, e)),
        }
    }
}

fn open_journal(path: &Path) -> Result<BufWriter<File>, SyncError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| SyncError::local_io(dir, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SyncError::local_io(path, e))?;
    Ok(BufWriter::new(file))
}

/// Apply every journal line to `state`. A torn final line is dropped.
fn replay_journal(path: &Path, state: &mut SyncState) -> Result<usize, SyncError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(SyncError::local_io(path, e)),
    };

    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut applied = 0;
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<StateMutation>(line) {
            Ok(mutation) => {
                state.apply(mutation);
                applied += 1;
            }
            Err(_) if index + 1 == lines.len() => {
                warn!(path = %path.display(), "ignoring truncated last journal line");
            }
            Err(source) => {
                return Err(SyncError::State {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str) -> StateEntry {
        StateEntry {
            local_hash: hash.to_string(),
            remote_id: format!("id-{hash}"),
            remote_hash: hash.to_string(),
            size: 1,
            last_synced_time: Utc::now(),
        }
    }

    #[test]
    fn test_open_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        assert!(store.state().entries.is_empty());
        assert!(store.state().remote_root_id.is_none());
    }

    #[test]
    fn test_commit_then_reopen_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = StateStore::open(&path).unwrap();
        store
            .commit(StateMutation::Put { path: "a.txt".into(), entry: entry("aa") })
            .unwrap();
        store
            .commit(StateMutation::Put { path: "b.txt".into(), entry: entry("bb") })
            .unwrap();
        store.commit(StateMutation::Remove { path: "a.txt".into() }).unwrap();
        drop(store);

        assert!(!path.exists());
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.state().entries.len(), 1);
        assert!(store.state().entries.contains_key("b.txt"));
    }

    #[test]
    fn test_compact_writes_snapshot_and_removes_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut store = StateStore::open(&path).unwrap();
        store.bind_remote_root("root-1").unwrap();
        store
            .commit(StateMutation::Put { path: "a.txt".into(), entry: entry("aa") })
            .unwrap();
        store.compact().unwrap();

        assert!(path.exists());
        assert!(!store.journal_path().exists());

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.state().remote_root_id.as_deref(), Some("root-1"));
        assert_eq!(reopened.state().entries["a.txt"], store.state().entries["a.txt"]);
    }

    #[test]
    fn test_truncated_last_line_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let good = serde_json::to_string(&StateMutation::Put {
            path: "a.txt".into(),
            entry: entry("aa"),
        })
        .unwrap();
        fs::write(path.with_extension("journal"), format!("{good}\n{{\"op\":\"put\",\"pa")).unwrap();

        let store = StateStore::open(&path).unwrap();
        assert!(store.state().entries.contains_key("a.txt"));
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let good = serde_json::to_string(&StateMutation::Remove { path: "x".into() }).unwrap();
        fs::write(path.with_extension("journal"), format!("garbage\n{good}\n")).unwrap();

        assert!(matches!(StateStore::open(&path), Err(SyncError::State { .. })));
    }

    #[test]
    fn test_bind_remote_root_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path().join("state.json")).unwrap();
        store.bind_remote_root("one").unwrap();
        store.bind_remote_root("one").unwrap();
        assert!(matches!(
            store.bind_remote_root("two"),
            Err(SyncError::StateMismatch { .. })
        ));
    }

    #[test]
    fn test_resolve_conflict_requires_a_recorded_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = StateStore::open(&path).unwrap();
        assert!(store.resolve_conflict("a.txt", Resolution::KeepRemote).is_err());

        store
            .commit(StateMutation::Conflict {
                path: "a.txt".into(),
                kind: ConflictKind::BothCreated,
            })
            .unwrap();
        store.resolve_conflict("a.txt", Resolution::KeepRemote).unwrap();

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(
            reopened.state().conflicts["a.txt"].resolution,
            Some(Resolution::KeepRemote)
        );
    }

    #[test]
    fn test_put_clears_conflict() {
        let mut state = SyncState::default();
        state.apply(StateMutation::Conflict {
            path: "a.txt".into(),
            kind: ConflictKind::BothModified,
        });
        state.apply(StateMutation::Resolve {
            path: "a.txt".into(),
            resolution: Resolution::KeepLocal,
        });
        assert_eq!(
            state.conflicts["a.txt"].resolution,
            Some(Resolution::KeepLocal)
        );

        state.apply(StateMutation::Put { path: "a.txt".into(), entry: entry("aa") });
        assert!(state.conflicts.is_empty());
    }
}
