//! One sync pass: scan both sides, reconcile, execute, persist.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::executor::{Applied, Executor};
use crate::folder_ref::FolderRef;
use crate::reconcile::{reconcile, Action, ConflictKind, Plan, PlanSummary};
use crate::remote::RemoteStore;
use crate::retry::with_retry;
use crate::scan::{LocalScanner, PathFilter, RemoteScanner};
use crate::snapshot::RemoteTree;
use crate::state::{StateMutation, StateStore};

/// Syncs one local folder with one remote folder.
pub struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    local_root: PathBuf,
    remote_folder: FolderRef,
    config: SyncConfig,
    cancel: CancellationToken,
}

struct Prepared {
    state: StateStore,
    tree: RemoteTree,
    plan: Plan,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        local_root: impl Into<PathBuf>,
        remote_folder: FolderRef,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            local_root: local_root.into(),
            remote_folder,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the sync when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn state_path(&self) -> PathBuf {
        self.config.state_path_for(&self.local_root)
    }

    /// Compute what a sync would do without touching either side.
    pub async fn plan(&self) -> Result<Plan, SyncError> {
        Ok(self.prepare().await?.plan)
    }

    /// Run a full sync pass.
    ///
    /// Per-action failures do not abort the pass; they are collected in the
    /// report. Errors returned here (unreadable local tree, remote folder not
    /// reachable, state file unusable) mean nothing was executed.
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let Prepared {
            mut state,
            tree,
            plan,
        } = self.prepare().await?;

        let mut report = SyncReport {
            planned: plan.summary(),
            adopted: plan.adopt.len(),
            forgotten: plan.forget.len(),
            ..Default::default()
        };

        for (path, entry) in plan.adopt {
            state.commit(StateMutation::Put { path, entry })?;
        }
        for path in plan.forget {
            state.commit(StateMutation::Remove { path })?;
        }
        for path in plan.resolved {
            state.commit(StateMutation::ClearConflict { path })?;
        }

        let state = Arc::new(Mutex::new(state));
        let executor = Executor::new(
            self.store.clone(),
            &self.local_root,
            state.clone(),
            &tree,
            self.config.retry.clone(),
            self.cancel.clone(),
        )
        .with_max_concurrent(self.config.max_concurrent);

        for outcome in executor.execute(plan.actions).await {
            report.record(outcome.action, outcome.result);
        }

        state.lock().await.compact()?;
        report.cancelled = self.cancel.is_cancelled();
        report.duration = started.elapsed();

        if report.cancelled {
            warn!(completed = report.applied, "sync cancelled");
        } else {
            info!(
                applied = report.applied,
                conflicts = report.conflicts.len(),
                failures = report.failures.len(),
                "sync finished"
            );
        }
        Ok(report)
    }

    async fn prepare(&self) -> Result<Prepared, SyncError> {
        self.config.validate()?;
        tokio::fs::create_dir_all(&self.local_root)
            .await
            .map_err(|e| SyncError::local_io(&self.local_root, e))?;

        let mut state = StateStore::open(self.state_path())?;

        let root = with_retry(&self.config.retry, &self.cancel, "/", || {
            self.store.get(self.remote_folder.id())
        })
        .await?;
        if !root.is_folder() {
            return Err(SyncError::Config(format!(
                "{} is not a folder",
                self.remote_folder
            )));
        }
        state.bind_remote_root(&root.id)?;

        let filter = PathFilter::new(self.config.exclude_patterns()?)
            .ignore_file_under(&self.local_root, state.path())
            .ignore_file_under(&self.local_root, state.journal_path());
        let local = LocalScanner::new(&self.local_root).with_filter(filter.clone());
        let remote = RemoteScanner::new(
            self.store.clone(),
            self.config.retry.clone(),
            self.cancel.clone(),
        )
        .with_filter(filter);
        let (local, tree) = tokio::try_join!(local.scan(), remote.scan(&root.id))?;

        let plan = reconcile(&local, &tree.files, state.state(), self.config.conflict_policy);
        info!(local = local.len(), remote = tree.files.len(), plan = %plan.summary(), "reconciled");

        Ok(Prepared { state, tree, plan })
    }
}

/// What a sync pass did.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub planned: PlanSummary,
    /// Actions that changed a side.
    pub applied: usize,
    /// Actions that found both sides already in agreement.
    pub already_in_sync: usize,
    pub adopted: usize,
    pub forgotten: usize,
    pub skipped: Vec<(String, &'static str)>,
    pub conflicts: Vec<(String, ConflictKind)>,
    pub failures: Vec<(String, SyncError)>,
    /// Actions never started because of cancellation.
    pub not_run: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

impl SyncReport {
    fn record(&mut self, action: Action, result: Result<Applied, SyncError>) {
        let path = action.path().to_string();
        match result {
            Ok(Applied::Done) => self.applied += 1,
            Ok(Applied::AlreadyInSync) => self.already_in_sync += 1,
            Ok(Applied::Skipped(reason)) => self.skipped.push((path, reason)),
            Ok(Applied::ConflictRecorded) => {
                if let Action::Conflict { kind, .. } = action {
                    self.conflicts.push((path, kind));
                }
            }
            Err(SyncError::Cancelled) => self.not_run += 1,
            Err(e) => self.failures.push((path, e)),
        }
    }

    /// No failures, no conflicts, not cancelled.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.conflicts.is_empty() && !self.cancelled
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Planned: {}", self.planned)?;
        writeln!(
            f,
            "Applied: {}, already in sync: {}, adopted: {}, forgotten: {} ({:.1}s)",
            self.applied,
            self.already_in_sync,
            self.adopted,
            self.forgotten,
            self.duration.as_secs_f64()
        )?;
        for (path, reason) in &self.skipped {
            writeln!(f, "  skipped  {}: {}", path, reason)?;
        }
        for (path, kind) in &self.conflicts {
            let conflict = SyncError::Conflict {
                path: path.clone(),
                kind: *kind,
            };
            writeln!(f, "  conflict {}", conflict)?;
        }
        for (_, error) in &self.failures {
            writeln!(f, "  failed   [{}] {}", error.category(), error)?;
        }
        if self.cancelled {
            writeln!(f, "Cancelled; {} action(s) not started.", self.not_run)?;
        }
        Ok(())
    }
}
