//! Applies planned actions to both sides.
//!
//! Actions run concurrently up to a bound; actions touching the same path
//! are serialized. Each completed action is committed to the state journal
//! before the next one on that path may start, so an interrupted run keeps
//! exactly the work it finished. Every action is safe to repeat.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::models::FileMetadata;
use crate::reconcile::{Action, Side};
use crate::remote::RemoteStore;
use crate::retry::{with_retry, RetryPolicy};
use crate::scan::local::{PARTIAL_PREFIX, PARTIAL_SUFFIX};
use crate::snapshot::{file_name, hash_file, local_path, parent_dir, FileRecord, RemoteTree};
use crate::state::{StateEntry, StateMutation, StateStore};

/// How an action ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The action changed one side.
    Done,
    /// Both sides already agreed; only the state was recorded.
    AlreadyInSync,
    /// Something moved since the scan; the next sync will look again.
    Skipped(&'static str),
    /// A conflict was written to the state for the operator.
    ConflictRecorded,
}

/// Result of one action.
#[derive(Debug)]
pub struct ActionOutcome {
    pub action: Action,
    pub result: Result<Applied, SyncError>,
}

/// Runs a batch of actions against a remote store and a local root.
pub struct Executor {
    ctx: Arc<Context>,
    max_concurrent: usize,
}

struct Context {
    store: Arc<dyn RemoteStore>,
    local_root: PathBuf,
    state: Arc<Mutex<StateStore>>,
    folders: FolderResolver,
    locks: PathLocks,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Executor {
    /// `tree` seeds the folder map so known remote folders are not looked up again.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        local_root: impl Into<PathBuf>,
        state: Arc<Mutex<StateStore>>,
        tree: &RemoteTree,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let folders = FolderResolver {
            root_id: tree.root_id.clone(),
            known: Mutex::new(tree.folders.clone().into_iter().collect()),
        };
        Self {
            ctx: Arc::new(Context {
                store,
                local_root: local_root.into(),
                state,
                folders,
                locks: PathLocks::default(),
                retry,
                cancel,
            }),
            max_concurrent: 4,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Run every action; outcomes come back in plan order.
    pub async fn execute(&self, actions: Vec<Action>) -> Vec<ActionOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        let mut outcomes: Vec<(usize, ActionOutcome)> = Vec::with_capacity(actions.len());

        for (index, action) in actions.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                outcomes.push((index, ActionOutcome { action, result: Err(SyncError::Cancelled) }));
                continue;
            };

            let ctx = self.ctx.clone();
            tasks.spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Err(SyncError::Cancelled),
                    result = ctx.run(&action) => result,
                };
                drop(permit);
                (index, ActionOutcome { action, result })
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "action task failed"),
            }
        }

        let pruned: BTreeSet<String> = outcomes
            .iter()
            .filter(|(_, o)| matches!(o.result, Ok(Applied::Done)))
            .filter_map(|(_, o)| match &o.action {
                Action::DeleteLocal { record } => Some(parent_dir(&record.relative_path).to_string()),
                Action::Rename { side: Side::Local, from, .. } => Some(parent_dir(from).to_string()),
                _ => None,
            })
            .collect();
        for dir in pruned {
            prune_empty_dirs(&self.ctx.local_root, &dir);
        }

        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, o)| o).collect()
    }
}

impl Context {
    async fn run(&self, action: &Action) -> Result<Applied, SyncError> {
        let _guards = self.locks.acquire(&action.paths()).await;
        let result = match action {
            Action::Upload { record, replaces } => self.upload(record, replaces.as_deref()).await,
            Action::Download { record, replaces } => {
                self.download(record, replaces.as_deref()).await
            }
            Action::DeleteLocal { record } => self.delete_local(record).await,
            Action::DeleteRemote { record } => self.delete_remote(record).await,
            Action::Rename {
                side,
                from,
                to,
                local,
                remote,
            } => self.rename(*side, from, to, local, remote).await,
            Action::Conflict { path, kind, .. } => {
                let recorded = self.state.lock().await.state().conflicts.get(path).map(|c| c.kind);
                if recorded != Some(*kind) {
                    self.commit(vec![StateMutation::Conflict {
                        path: path.clone(),
                        kind: *kind,
                    }])
                    .await?;
                }
                warn!(path = %path, kind = %kind, "conflict needs a manual decision");
                Ok(Applied::ConflictRecorded)
            }
        };

        match &result {
            Ok(Applied::Skipped(reason)) => info!(action = action.label(), path = action.path(), reason, "skipped"),
            Ok(applied) => debug!(action = action.label(), path = action.path(), ?applied, "applied"),
            Err(e) => warn!(action = action.label(), path = action.path(), error = %e, "action failed"),
        }
        result
    }

    async fn upload(&self, record: &FileRecord, replaces: Option<&str>) -> Result<Applied, SyncError> {
        let path = record.relative_path.as_str();
        let source = local_path(&self.local_root, path);
        let Some(local_hash) = hash_local(&source).await? else {
            return Ok(Applied::Skipped("local file disappeared"));
        };
        if local_hash != record.content_hash {
            return Ok(Applied::Skipped("local file changed since scan"));
        }

        let parent_id = self.folders.resolve(self, parent_dir(path)).await?;
        let name = file_name(path);
        let existing = with_retry(&self.retry, &self.cancel, path, || {
            self.store.find_file(name, &parent_id)
        })
        .await?;

        let (metadata, applied) = match existing {
            Some(file) if file.is_google_native() => {
                return Ok(Applied::Skipped("name taken by a Google editor file"));
            }
            Some(file) if file.sha256_checksum.as_deref() == Some(local_hash.as_str()) => {
                (file, Applied::AlreadyInSync)
            }
            Some(file) if file.sha256_checksum.as_deref() != replaces => {
                return Ok(Applied::Skipped("remote file changed since scan"));
            }
            existing => {
                let existing_id = existing.map(|f| f.id);
                let uploaded = with_retry(&self.retry, &self.cancel, path, || {
                    self.store
                        .upload(&source, name, &parent_id, existing_id.as_deref())
                })
                .await?;
                (uploaded, Applied::Done)
            }
        };

        let entry = entry_after_transfer(record.size, local_hash, &metadata);
        self.commit(vec![StateMutation::Put {
            path: path.to_string(),
            entry,
        }])
        .await?;
        Ok(applied)
    }

    async fn download(&self, record: &FileRecord, replaces: Option<&str>) -> Result<Applied, SyncError> {
        let path = record.relative_path.as_str();
        let Some(remote_id) = record.remote_id.as_deref() else {
            return Ok(Applied::Skipped("remote file has no id"));
        };
        let destination = local_path(&self.local_root, path);

        let current = hash_local(&destination).await?;
        let applied = if current.as_deref() == Some(record.content_hash.as_str()) {
            Applied::AlreadyInSync
        } else if current.as_deref() != replaces {
            return Ok(Applied::Skipped("local file changed since scan"));
        } else {
            let dir = destination.parent().unwrap_or(&self.local_root).to_path_buf();
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SyncError::local_io(&dir, e))?;

            let partial = tempfile::Builder::new()
                .prefix(PARTIAL_PREFIX)
                .suffix(PARTIAL_SUFFIX)
                .tempfile_in(&dir)
                .map_err(|e| SyncError::local_io(&dir, e))?
                .into_temp_path();

            with_retry(&self.retry, &self.cancel, path, || {
                self.store.download(remote_id, &partial)
            })
            .await?;

            partial
                .persist(&destination)
                .map_err(|e| SyncError::local_io(&destination, e.error))?;
            Applied::Done
        };

        let local_hash = hash_local(&destination)
            .await?
            .unwrap_or_else(|| record.content_hash.clone());
        self.commit(vec![StateMutation::Put {
            path: path.to_string(),
            entry: StateEntry {
                local_hash,
                remote_id: remote_id.to_string(),
                remote_hash: record.content_hash.clone(),
                size: record.size,
                last_synced_time: Utc::now(),
            },
        }])
        .await?;
        Ok(applied)
    }

    async fn delete_local(&self, record: &FileRecord) -> Result<Applied, SyncError> {
        let path = record.relative_path.as_str();
        let target = local_path(&self.local_root, path);

        let applied = match hash_local(&target).await? {
            None => Applied::AlreadyInSync,
            Some(hash) if hash != record.content_hash => {
                return Ok(Applied::Skipped("local file changed since scan"));
            }
            Some(_) => match tokio::fs::remove_file(&target).await {
                Ok(()) => Applied::Done,
                Err(e) if e.kind() == io::ErrorKind::NotFound => Applied::AlreadyInSync,
                Err(e) => return Err(SyncError::local_io(&target, e)),
            },
        };

        self.commit(vec![StateMutation::Remove { path: path.to_string() }])
            .await?;
        Ok(applied)
    }

    async fn delete_remote(&self, record: &FileRecord) -> Result<Applied, SyncError> {
        let path = record.relative_path.as_str();
        let Some(remote_id) = record.remote_id.as_deref() else {
            return Ok(Applied::Skipped("remote file has no id"));
        };

        let current = match with_retry(&self.retry, &self.cancel, path, || self.store.get(remote_id)).await {
            Ok(file) => Some(file),
            Err(SyncError::FatalRemote { source, .. }) if source.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let applied = match current {
            None => Applied::AlreadyInSync,
            Some(file) if file.sha256_checksum.as_deref() != Some(record.content_hash.as_str()) => {
                return Ok(Applied::Skipped("remote file changed since scan"));
            }
            Some(_) => {
                match with_retry(&self.retry, &self.cancel, path, || self.store.delete(remote_id)).await {
                    Ok(()) => Applied::Done,
                    Err(SyncError::FatalRemote { source, .. }) if source.is_not_found() => {
                        Applied::AlreadyInSync
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.commit(vec![StateMutation::Remove { path: path.to_string() }])
            .await?;
        Ok(applied)
    }

    async fn rename(
        &self,
        side: Side,
        from: &str,
        to: &str,
        local: &FileRecord,
        remote: &FileRecord,
    ) -> Result<Applied, SyncError> {
        let (local, remote) = match side {
            Side::Remote => {
                let Some(remote_id) = remote.remote_id.as_deref() else {
                    return Ok(Applied::Skipped("remote file has no id"));
                };
                let from_parent = self.folders.resolve(self, parent_dir(from)).await?;
                let to_parent = self.folders.resolve(self, parent_dir(to)).await?;
                let moved = with_retry(&self.retry, &self.cancel, to, || {
                    self.store
                        .rename(remote_id, file_name(to), &from_parent, &to_parent)
                })
                .await?;
                let remote = FileRecord {
                    relative_path: to.to_string(),
                    remote_id: Some(moved.id),
                    ..remote.clone()
                };
                (local.clone(), remote)
            }
            Side::Local => {
                let source = local_path(&self.local_root, from);
                let target = local_path(&self.local_root, to);
                if local_exists(&target).await? {
                    return Ok(Applied::Skipped("rename target already exists"));
                }
                match hash_local(&source).await? {
                    Some(hash) if hash == local.content_hash => {}
                    _ => return Ok(Applied::Skipped("local file changed since scan")),
                }
                if let Some(dir) = target.parent() {
                    tokio::fs::create_dir_all(dir)
                        .await
                        .map_err(|e| SyncError::local_io(dir, e))?;
                }
                tokio::fs::rename(&source, &target)
                    .await
                    .map_err(|e| SyncError::local_io(&source, e))?;
                let local = FileRecord {
                    relative_path: to.to_string(),
                    ..local.clone()
                };
                (local, remote.clone())
            }
        };

        self.commit(vec![
            StateMutation::Remove { path: from.to_string() },
            StateMutation::Put {
                path: to.to_string(),
                entry: StateEntry::synced(&local, &remote),
            },
        ])
        .await?;
        Ok(Applied::Done)
    }

    async fn commit(&self, mutations: Vec<StateMutation>) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        for mutation in mutations {
            state.commit(mutation)?;
        }
        Ok(())
    }
}

fn entry_after_transfer(size: u64, local_hash: String, remote: &FileMetadata) -> StateEntry {
    StateEntry {
        remote_hash: remote
            .sha256_checksum
            .clone()
            .unwrap_or_else(|| local_hash.clone()),
        local_hash,
        remote_id: remote.id.clone(),
        size,
        last_synced_time: Utc::now(),
    }
}

/// Hash a local file on the blocking pool; `None` when it does not exist.
async fn hash_local(path: &Path) -> Result<Option<String>, SyncError> {
    let owned = path.to_path_buf();
    let hashed = tokio::task::spawn_blocking(move || hash_file(&owned))
        .await
        .map_err(|e| SyncError::local_io(path, io::Error::other(e)))?;
    match hashed {
        Ok(hash) => Ok(Some(hash)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::local_io(path, e)),
    }
}

async fn local_exists(path: &Path) -> Result<bool, SyncError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| SyncError::local_io(path, e))
}

/// Remove `dir` and its ancestors while they are empty, stopping at the root.
fn prune_empty_dirs(root: &Path, dir: &str) {
    let mut current = dir;
    while !current.is_empty() {
        match std::fs::remove_dir(local_path(root, current)) {
            Ok(()) => debug!(dir = current, "removed empty directory"),
            Err(_) => break,
        }
        current = parent_dir(current);
    }
}

/// Maps remote folder paths to ids, creating missing folders exactly once.
struct FolderResolver {
    root_id: String,
    known: Mutex<HashMap<String, String>>,
}

impl FolderResolver {
    /// ID of the remote folder at `dir` (`""` is the root).
    ///
    /// The map stays locked for the whole walk so two uploads into the same
    /// new folder cannot both create it.
    async fn resolve(&self, ctx: &Context, dir: &str) -> Result<String, SyncError> {
        if dir.is_empty() {
            return Ok(self.root_id.clone());
        }
        let mut known = self.known.lock().await;
        if let Some(id) = known.get(dir) {
            return Ok(id.clone());
        }

        let mut parent_id = self.root_id.clone();
        let mut current = String::new();
        for part in dir.split('/') {
            current = crate::snapshot::join(&current, part);
            if let Some(id) = known.get(&current) {
                parent_id = id.clone();
                continue;
            }

            let found = with_retry(&ctx.retry, &ctx.cancel, &current, || {
                ctx.store.find_folder(part, &parent_id)
            })
            .await?;
            let id = match found {
                Some(folder) => folder.id,
                None => {
                    let created = with_retry(&ctx.retry, &ctx.cancel, &current, || {
                        ctx.store.create_folder(part, &parent_id)
                    })
                    .await?;
                    info!(path = %current, "created remote folder");
                    created.id
                }
            };
            known.insert(current.clone(), id.clone());
            parent_id = id;
        }
        Ok(parent_id)
    }
}

/// Held for the lifetime of an action.
#[allow(dead_code)]
enum PathGuard {
    /// The action's own path.
    Exclusive(OwnedRwLockWriteGuard<()>),
    /// A folder above it; siblings share it, an action on the folder path
    /// itself waits for them.
    Shared(OwnedRwLockReadGuard<()>),
}

/// One async lock per path. An action locks its own paths exclusively and
/// every ancestor shared, always in sorted order, so actions on `a` and
/// `a/b.txt` never overlap while `a/x` and `a/y` still run together.
#[derive(Default)]
struct PathLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl PathLocks {
    async fn acquire(&self, paths: &[&str]) -> Vec<PathGuard> {
        let mut wanted: BTreeMap<&str, bool> = BTreeMap::new();
        for &path in paths {
            let mut dir = parent_dir(path);
            while !dir.is_empty() {
                wanted.entry(dir).or_insert(false);
                dir = parent_dir(dir);
            }
            wanted.insert(path, true);
        }

        let handles: Vec<(Arc<RwLock<()>>, bool)> = {
            let mut locks = self.locks.lock().await;
            wanted
                .into_iter()
                .map(|(p, exclusive)| (locks.entry(p.to_string()).or_default().clone(), exclusive))
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for (handle, exclusive) in handles {
            guards.push(if exclusive {
                PathGuard::Exclusive(handle.write_owned().await)
            } else {
                PathGuard::Shared(handle.read_owned().await)
            });
        }
        guards
    }
}
