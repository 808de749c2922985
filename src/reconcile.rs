//! Three-way reconciliation of a local snapshot, a remote snapshot and the
//! last agreed-upon state.
//!
//! [`reconcile`] is a pure function: it only decides, the executor acts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::{parent_dir, FileRecord, Snapshot};
use crate::state::{Resolution, StateEntry, SyncState};

/// Why two sides could not be reconciled automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Both sides changed since the last sync, to different content.
    BothModified,
    /// Both sides created the path independently, with different content.
    BothCreated,
    ModifiedLocallyDeletedRemotely,
    DeletedLocallyModifiedRemotely,
    /// The path is a file on one side and a folder holding files on a side.
    FileFolderCollision,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConflictKind::BothModified => "modified on both sides",
            ConflictKind::BothCreated => "created on both sides",
            ConflictKind::ModifiedLocallyDeletedRemotely => "modified locally, deleted remotely",
            ConflictKind::DeletedLocallyModifiedRemotely => "deleted locally, modified remotely",
            ConflictKind::FileFolderCollision => "file and folder share the path",
        };
        f.write_str(label)
    }
}

/// What to do when both sides diverged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Report every divergence as a conflict.
    #[default]
    Surface,
    /// Keep the side with the newer modification time.
    PreferNewer,
}

/// Side of the sync an action changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Copy a local file to the remote.
    ///
    /// `replaces` is the hash of the remote file being overwritten, if any.
    /// The executor refuses to overwrite anything else.
    Upload {
        record: FileRecord,
        replaces: Option<String>,
    },
    /// Copy a remote file (record carries its id) to the local tree.
    /// `replaces` mirrors [`Action::Upload`] for the local file.
    Download {
        record: FileRecord,
        replaces: Option<String>,
    },
    /// Delete a local file, provided it still has the recorded hash.
    DeleteLocal { record: FileRecord },
    /// Delete a remote file by id.
    DeleteRemote { record: FileRecord },
    /// Move a file on `side` from `from` to `to`.
    ///
    /// `local` and `remote` are the records as scanned; the one on `side` is
    /// still at `from`, the other is already at `to`.
    Rename {
        side: Side,
        from: String,
        to: String,
        local: FileRecord,
        remote: FileRecord,
    },
    /// Needs an operator decision; never executed.
    Conflict {
        path: String,
        kind: ConflictKind,
        local: Option<FileRecord>,
        remote: Option<FileRecord>,
    },
}

impl Action {
    /// Path the action is reported under (the destination for renames).
    pub fn path(&self) -> &str {
        match self {
            Action::Upload { record, .. }
            | Action::Download { record, .. }
            | Action::DeleteLocal { record }
            | Action::DeleteRemote { record } => &record.relative_path,
            Action::Rename { to, .. } => to,
            Action::Conflict { path, .. } => path,
        }
    }

    /// Every path the action touches.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Action::Rename { from, to, .. } => vec![from.as_str(), to.as_str()],
            _ => vec![self.path()],
        }
    }

    /// Short verb used in plans and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Action::Upload { .. } => "upload",
            Action::Download { .. } => "download",
            Action::DeleteLocal { .. } => "delete-local",
            Action::DeleteRemote { .. } => "delete-remote",
            Action::Rename { .. } => "rename",
            Action::Conflict { .. } => "conflict",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Action::Rename { .. } => 0,
            Action::Upload { .. } => 1,
            Action::Download { .. } => 2,
            Action::DeleteLocal { .. } => 3,
            Action::DeleteRemote { .. } => 4,
            Action::Conflict { .. } => 5,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Rename { side, from, to, .. } => {
                write!(f, "{:<13} {} -> {} ({})", self.label(), from, to, side)
            }
            Action::Conflict { path, kind, .. } => {
                write!(f, "{:<13} {} ({})", self.label(), path, kind)
            }
            _ => write!(f, "{:<13} {}", self.label(), self.path()),
        }
    }
}

/// Output of [`reconcile`].
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Ordered: renames, uploads, downloads, local deletes, remote deletes,
    /// conflicts; by path within each group.
    pub actions: Vec<Action>,
    /// Paths identical on both sides whose state entry is missing or stale.
    pub adopt: BTreeMap<String, StateEntry>,
    /// State entries whose path is gone from both sides.
    pub forget: Vec<String>,
    /// Recorded conflicts that no longer apply and need no action.
    pub resolved: Vec<String>,
}

impl Plan {
    /// Whether running the plan would change anything on either side.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &Action> {
        self.actions
            .iter()
            .filter(|a| matches!(a, Action::Conflict { .. }))
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action {
                Action::Upload { .. } => summary.uploads += 1,
                Action::Download { .. } => summary.downloads += 1,
                Action::DeleteLocal { .. } => summary.local_deletes += 1,
                Action::DeleteRemote { .. } => summary.remote_deletes += 1,
                Action::Rename { .. } => summary.renames += 1,
                Action::Conflict { .. } => summary.conflicts += 1,
            }
        }
        summary.adopted = self.adopt.len();
        summary
    }
}

/// Action counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub uploads: usize,
    pub downloads: usize,
    pub local_deletes: usize,
    pub remote_deletes: usize,
    pub renames: usize,
    pub conflicts: usize,
    pub adopted: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} upload(s), {} download(s), {} local delete(s), {} remote delete(s), {} rename(s), {} conflict(s)",
            self.uploads,
            self.downloads,
            self.local_deletes,
            self.remote_deletes,
            self.renames,
            self.conflicts
        )
    }
}

enum Outcome {
    Act(Action),
    Adopt(StateEntry),
    Forget,
    Nothing,
}

/// Compute the plan that brings `local` and `remote` back into agreement.
pub fn reconcile(
    local: &Snapshot,
    remote: &Snapshot,
    state: &SyncState,
    policy: ConflictPolicy,
) -> Plan {
    let mut plan = Plan::default();
    let mut consumed: BTreeSet<String> = BTreeSet::new();
    let collisions = file_folder_collisions(local, remote);
    let collides = |path: &str| collisions.iter().any(|c| is_within(path, c));

    for action in detect_renames(local, remote, state) {
        if let Action::Rename { from, to, .. } = &action {
            if collides(from) || collides(to) {
                continue;
            }
            consumed.insert(from.clone());
            consumed.insert(to.clone());
        }
        plan.actions.push(action);
    }

    let paths: BTreeSet<&String> = local
        .keys()
        .chain(remote.keys())
        .chain(state.entries.keys())
        .filter(|p| !consumed.contains(*p))
        .collect();

    for path in paths {
        let l = local.get(path);
        let r = remote.get(path);
        let s = state.entries.get(path);
        let recorded = state.conflicts.get(path);

        // Neither side can take the other's shape; leave state alone until
        // the operator renames one of them.
        if (l.is_some() || r.is_some()) && collides(path) {
            plan.actions.push(Action::Conflict {
                path: path.clone(),
                kind: ConflictKind::FileFolderCollision,
                local: l.cloned(),
                remote: r.cloned(),
            });
            continue;
        }

        let outcome = match recorded.and_then(|c| c.resolution) {
            Some(resolution) => resolve(l, r, s, resolution),
            None => decide(path, l, r, s, policy),
        };

        match outcome {
            Outcome::Act(action) => plan.actions.push(action),
            Outcome::Adopt(entry) => {
                plan.adopt.insert(path.clone(), entry);
            }
            Outcome::Forget => plan.forget.push(path.clone()),
            Outcome::Nothing => {
                if recorded.is_some() {
                    plan.resolved.push(path.clone());
                }
            }
        }
    }

    plan.actions
        .sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.path().cmp(b.path())));
    plan
}

/// Files whose path is also a folder on either side, such as a local file
/// `a` next to a remote `a/b.txt`, or a remote file and folder both named `a`.
fn file_folder_collisions(local: &Snapshot, remote: &Snapshot) -> BTreeSet<String> {
    let files: BTreeSet<&str> = local.keys().chain(remote.keys()).map(String::as_str).collect();
    let mut collisions = BTreeSet::new();
    for path in &files {
        let mut dir = parent_dir(path);
        while !dir.is_empty() {
            if files.contains(dir) {
                collisions.insert(dir.to_string());
            }
            dir = parent_dir(dir);
        }
    }
    collisions
}

/// Whether `path` is `dir` itself or lies below it.
fn is_within(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// The decision table for one path.
fn decide(
    path: &str,
    local: Option<&FileRecord>,
    remote: Option<&FileRecord>,
    entry: Option<&StateEntry>,
    policy: ConflictPolicy,
) -> Outcome {
    match (local, remote, entry) {
        (Some(l), Some(r), entry) if l.content_hash == r.content_hash => match entry {
            Some(e) if e.matches(l, r) => Outcome::Nothing,
            _ => Outcome::Adopt(StateEntry::synced(l, r)),
        },
        (Some(l), Some(r), None) => diverged(path, l, r, ConflictKind::BothCreated, policy),
        (Some(l), Some(r), Some(e)) => {
            let local_changed = l.content_hash != e.local_hash;
            let remote_changed = r.content_hash != e.remote_hash;
            match (local_changed, remote_changed) {
                (true, false) => Outcome::Act(upload(l, Some(r))),
                (false, true) => Outcome::Act(download(r, Some(l))),
                _ => diverged(path, l, r, ConflictKind::BothModified, policy),
            }
        }
        (Some(l), None, None) => Outcome::Act(upload(l, None)),
        (None, Some(r), None) => Outcome::Act(download(r, None)),
        (Some(l), None, Some(e)) => {
            if l.content_hash == e.local_hash {
                Outcome::Act(Action::DeleteLocal { record: l.clone() })
            } else if policy == ConflictPolicy::PreferNewer {
                Outcome::Act(upload(l, None))
            } else {
                conflict(path, ConflictKind::ModifiedLocallyDeletedRemotely, Some(l), None)
            }
        }
        (None, Some(r), Some(e)) => {
            if r.content_hash == e.remote_hash {
                Outcome::Act(Action::DeleteRemote { record: r.clone() })
            } else if policy == ConflictPolicy::PreferNewer {
                Outcome::Act(download(r, None))
            } else {
                conflict(path, ConflictKind::DeletedLocallyModifiedRemotely, None, Some(r))
            }
        }
        (None, None, Some(_)) => Outcome::Forget,
        (None, None, None) => Outcome::Nothing,
    }
}

/// Both sides hold different content: conflict, unless the policy picks a side.
fn diverged(
    path: &str,
    local: &FileRecord,
    remote: &FileRecord,
    kind: ConflictKind,
    policy: ConflictPolicy,
) -> Outcome {
    if policy == ConflictPolicy::PreferNewer {
        if local.modified_time > remote.modified_time {
            return Outcome::Act(upload(local, Some(remote)));
        }
        if remote.modified_time > local.modified_time {
            return Outcome::Act(download(remote, Some(local)));
        }
    }
    conflict(path, kind, Some(local), Some(remote))
}

/// Turn an operator resolution into the action that makes the other side match.
fn resolve(
    local: Option<&FileRecord>,
    remote: Option<&FileRecord>,
    entry: Option<&StateEntry>,
    resolution: Resolution,
) -> Outcome {
    match (local, remote, resolution) {
        (Some(l), Some(r), _) if l.content_hash == r.content_hash => {
            Outcome::Adopt(StateEntry::synced(l, r))
        }
        (None, None, _) if entry.is_some() => Outcome::Forget,
        (None, None, _) => Outcome::Nothing,
        (Some(l), r, Resolution::KeepLocal) => Outcome::Act(upload(l, r)),
        (None, Some(r), Resolution::KeepLocal) => {
            Outcome::Act(Action::DeleteRemote { record: r.clone() })
        }
        (l, Some(r), Resolution::KeepRemote) => Outcome::Act(download(r, l)),
        (Some(l), None, Resolution::KeepRemote) => {
            Outcome::Act(Action::DeleteLocal { record: l.clone() })
        }
    }
}

fn upload(local: &FileRecord, remote: Option<&FileRecord>) -> Action {
    Action::Upload {
        record: local.clone(),
        replaces: remote.map(|r| r.content_hash.clone()),
    }
}

fn download(remote: &FileRecord, local: Option<&FileRecord>) -> Action {
    Action::Download {
        record: remote.clone(),
        replaces: local.map(|l| l.content_hash.clone()),
    }
}

fn conflict(
    path: &str,
    kind: ConflictKind,
    local: Option<&FileRecord>,
    remote: Option<&FileRecord>,
) -> Outcome {
    Outcome::Act(Action::Conflict {
        path: path.to_string(),
        kind,
        local: local.cloned(),
        remote: remote.cloned(),
    })
}

/// Pair vanished paths with new ones that hold the same file.
///
/// A local move shows up as a path missing locally (remote copy untouched)
/// plus a new local path with the old content; the remote copy is moved to
/// match. A remote move shows up as a known remote id at a new path while the
/// local copy sits untouched at the old one; the local file is moved.
/// Ambiguous matches fall back to the plain upload/download/delete handling.
fn detect_renames(local: &Snapshot, remote: &Snapshot, state: &SyncState) -> Vec<Action> {
    let mut renames = Vec::new();
    let mut taken: BTreeSet<String> = BTreeSet::new();
    let untracked = |path: &str| !state.entries.contains_key(path) && !state.conflicts.contains_key(path);

    // Local moves.
    let mut vanished: HashMap<&str, Vec<(&String, &StateEntry, &FileRecord)>> = HashMap::new();
    for (path, entry) in &state.entries {
        if local.contains_key(path) || state.conflicts.contains_key(path) {
            continue;
        }
        if let Some(r) = remote.get(path) {
            if r.content_hash == entry.remote_hash {
                vanished
                    .entry(entry.local_hash.as_str())
                    .or_default()
                    .push((path, entry, r));
            }
        }
    }
    let mut appeared: HashMap<&str, Vec<&FileRecord>> = HashMap::new();
    for (path, record) in local {
        if untracked(path.as_str()) && !remote.contains_key(path) {
            appeared
                .entry(record.content_hash.as_str())
                .or_default()
                .push(record);
        }
    }
    for (hash, sources) in &vanished {
        let (Some(targets), [(from, _, r)]) = (appeared.get(hash), sources.as_slice()) else {
            continue;
        };
        let [l] = targets.as_slice() else {
            continue;
        };
        taken.insert((*from).clone());
        taken.insert(l.relative_path.clone());
        renames.push(Action::Rename {
            side: Side::Remote,
            from: (*from).clone(),
            to: l.relative_path.clone(),
            local: (*l).clone(),
            remote: (*r).clone(),
        });
    }

    // Remote moves.
    let by_id: HashMap<&str, (&String, &StateEntry)> = state
        .entries
        .iter()
        .map(|(path, entry)| (entry.remote_id.as_str(), (path, entry)))
        .collect();
    for (to, r) in remote {
        let Some(id) = r.remote_id.as_deref() else {
            continue;
        };
        let Some(&(from, entry)) = by_id.get(id) else {
            continue;
        };
        if from == to
            || taken.contains(from)
            || taken.contains(to)
            || remote.contains_key(from)
            || local.contains_key(to)
            || !untracked(to.as_str())
            || state.conflicts.contains_key(from)
            || r.content_hash != entry.remote_hash
        {
            continue;
        }
        let Some(l) = local.get(from) else {
            continue;
        };
        if l.content_hash != entry.local_hash {
            continue;
        }
        taken.insert(from.clone());
        taken.insert(to.clone());
        renames.push(Action::Rename {
            side: Side::Local,
            from: from.clone(),
            to: to.clone(),
            local: l.clone(),
            remote: r.clone(),
        });
    }

    renames
}
