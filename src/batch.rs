//! Batch instruction files: lists of uploads and downloads run in one go.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{DriveError, Result};
use crate::folder_ref::{extract_id, FolderRef};
use crate::remote::RemoteStore;
use crate::transfer::{download_item, upload_path, TransferSummary};

/// One transfer: a local path and a Drive folder, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub source: String,
    pub destination: String,
}

/// Contents of an instruction file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructions {
    #[serde(rename = "UPLOAD", default)]
    pub upload: Vec<Task>,
    #[serde(rename = "DOWNLOAD", default)]
    pub download: Vec<Task>,
}

impl Instructions {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Example instructions showing both task kinds.
    pub fn template() -> Self {
        let task = |source: &str, destination: &str| Task {
            source: source.to_string(),
            destination: destination.to_string(),
        };
        Self {
            upload: vec![
                task("/path/to/file.txt", "DriveFolderID"),
                task("/path/to/folder", "DriveFolderID"),
            ],
            download: vec![
                task("DriveFolderID", "/path/to/destination"),
                task("DriveFileID", "/path/to/destination"),
            ],
        }
    }

    /// Write the template to `path` unless a file is already there.
    ///
    /// Returns `false` when an existing file was left untouched.
    pub fn write_template(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&Self::template())?)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.upload.len() + self.download.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every upload, then every download.
    ///
    /// A failing task is logged and recorded; the remaining tasks still run.
    pub async fn run(&self, store: &dyn RemoteStore) -> BatchReport {
        let mut report = BatchReport::default();

        for task in &self.upload {
            let result = match FolderRef::parse(&task.destination) {
                Ok(folder) => upload_path(store, &task.source, folder.id())
                    .await
                    .map(|(_, summary)| summary),
                Err(e) => Err(e),
            };
            report.record("upload", task, result);
        }

        for task in &self.download {
            let result = match extract_id(&task.source) {
                Ok(id) => download_item(store, &id, &PathBuf::from(&task.destination)).await,
                Err(e) => Err(e),
            };
            report.record("download", task, result);
        }

        report
    }
}

/// Outcome of a batch run.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub totals: TransferSummary,
    pub completed: usize,
    pub failures: Vec<(Task, DriveError)>,
}

impl BatchReport {
    fn record(&mut self, kind: &str, task: &Task, result: Result<TransferSummary>) {
        match result {
            Ok(summary) => {
                info!(kind, source = %task.source, destination = %task.destination, "task complete");
                self.totals.transferred += summary.transferred;
                self.totals.existing += summary.existing;
                self.totals.skipped += summary.skipped;
                self.completed += 1;
            }
            Err(e) => {
                error!(kind, source = %task.source, error = %e, "task failed");
                self.failures.push((task.clone(), e));
            }
        }
    }
}
