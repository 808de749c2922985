//! One-shot Drive operations: folders, tree and item listings, recursive
//! upload and download.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use tracing::{info, warn};

use crate::error::{DriveError, Result};
use crate::models::{format_size, FileMetadata};
use crate::remote::RemoteStore;
use crate::scan::local::{PARTIAL_PREFIX, PARTIAL_SUFFIX};
use crate::snapshot::is_portable_name;

/// Characters Windows refuses in file names, plus control characters.
static INVALID_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).expect("Invalid name regex"));

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Column widths of the item listing.
const NAME_WIDTH: usize = 54;
const ID_WIDTH: usize = 33;

/// Whether `name` is usable as a folder name on every platform.
pub fn is_valid_folder_name(name: &str) -> bool {
    !name.trim().is_empty()
        && !INVALID_NAME_CHARS.is_match(name)
        && !RESERVED_NAMES.contains(&name.to_uppercase().as_str())
}

/// Shorten `name` to `max_length` characters, ending with `...` when cut.
pub fn truncate_name(name: &str, max_length: usize) -> String {
    if name.chars().count() <= max_length {
        return name.to_string();
    }
    let kept: String = name.chars().take(max_length.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Create a folder after validating its name.
pub async fn create_folder(
    store: &dyn RemoteStore,
    name: &str,
    parent_id: &str,
) -> Result<FileMetadata> {
    if !is_valid_folder_name(name) {
        return Err(DriveError::InvalidName(name.to_string()));
    }
    store.create_folder(name, parent_id).await
}

/// Render the tree under a folder, one `+--name` line per item.
pub async fn render_tree(store: &dyn RemoteStore, folder_id: &str) -> Result<String> {
    let mut out = String::new();
    render_level(store, folder_id.to_string(), String::new(), &mut out).await?;
    Ok(out)
}

fn render_level<'a>(
    store: &'a dyn RemoteStore,
    folder_id: String,
    indent: String,
    out: &'a mut String,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let mut children = store.list_children(&folder_id).await?;
        children.sort_by_key(|c| c.name.to_lowercase());

        for child in children {
            out.push_str(&format!("{indent}+--{}\n", child.name));
            if child.is_folder() {
                render_level(store, child.id, format!("{indent}|  "), out).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

/// Folders and files of one folder, each sorted case-insensitively.
#[derive(Debug, Default)]
pub struct ItemListing {
    pub folders: Vec<FileMetadata>,
    pub files: Vec<FileMetadata>,
}

pub async fn list_items(store: &dyn RemoteStore, folder_id: &str) -> Result<ItemListing> {
    let (mut folders, mut files): (Vec<_>, Vec<_>) = store
        .list_children(folder_id)
        .await?
        .into_iter()
        .partition(FileMetadata::is_folder);
    folders.sort_by_key(|f| f.name.to_lowercase());
    files.sort_by_key(|f| f.name.to_lowercase());
    Ok(ItemListing { folders, files })
}

impl std::fmt::Display for ItemListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rule = format!("|{}|{}|", "_".repeat(NAME_WIDTH + 2), "_".repeat(ID_WIDTH + 8));
        for (title, items) in [("Folders", &self.folders), ("Files", &self.files)] {
            writeln!(f, "{rule}")?;
            writeln!(f, "| {:<NAME_WIDTH$} |    {:<ID_WIDTH$}    |", title, "ID")?;
            writeln!(f, "{rule}")?;
            for item in items {
                writeln!(
                    f,
                    "| {:<NAME_WIDTH$} |    {:<ID_WIDTH$}    |",
                    truncate_name(&item.name, NAME_WIDTH),
                    truncate_name(&item.id, ID_WIDTH)
                )?;
            }
        }
        writeln!(f, "{rule}")
    }
}

/// Counts from a recursive transfer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub transferred: usize,
    /// Uploads skipped because the destination already had the name.
    pub existing: usize,
    /// Items that cannot be transferred (Google editor files, bad names).
    pub skipped: usize,
}

impl TransferSummary {
    fn add(&mut self, other: TransferSummary) {
        self.transferred += other.transferred;
        self.existing += other.existing;
        self.skipped += other.skipped;
    }
}

/// Upload a file or folder into `destination_id`.
///
/// A file whose name already exists in the destination is left alone. A
/// folder is reused by name or created, then filled recursively. A folder
/// path ending in a separator uploads its contents straight into the
/// destination. Returns the ID of the uploaded (or existing) item.
pub async fn upload_path(
    store: &dyn RemoteStore,
    source: &str,
    destination_id: &str,
) -> Result<(String, TransferSummary)> {
    let contents_only = source.ends_with('/') || source.ends_with(std::path::MAIN_SEPARATOR);
    let path = PathBuf::from(source);
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| DriveError::FileNotFound(source.to_string()))?;

    if metadata.is_file() {
        return upload_file(store, &path, destination_id).await;
    }

    let folder_id = if contents_only {
        destination_id.to_string()
    } else {
        let name = local_name(&path)?;
        match store.find_folder(&name, destination_id).await? {
            Some(folder) => folder.id,
            None => store.create_folder(&name, destination_id).await?.id,
        }
    };
    let summary = upload_dir_contents(store, path, folder_id.clone()).await?;
    Ok((folder_id, summary))
}

async fn upload_file(
    store: &dyn RemoteStore,
    path: &Path,
    destination_id: &str,
) -> Result<(String, TransferSummary)> {
    let name = local_name(path)?;
    if let Some(existing) = store.find_file(&name, destination_id).await? {
        info!(name = %name, id = %existing.id, "file already exists in destination");
        let summary = TransferSummary {
            existing: 1,
            ..Default::default()
        };
        return Ok((existing.id, summary));
    }

    let uploaded = store.upload(path, &name, destination_id, None).await?;
    info!(
        name = %name,
        id = %uploaded.id,
        size = %format_size(uploaded.size.unwrap_or(0)),
        "uploaded"
    );
    let summary = TransferSummary {
        transferred: 1,
        ..Default::default()
    };
    Ok((uploaded.id, summary))
}

fn upload_dir_contents(
    store: &dyn RemoteStore,
    dir: PathBuf,
    folder_id: String,
) -> BoxFuture<'_, Result<TransferSummary>> {
    async move {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            entries.push(entry.path());
        }
        entries.sort();

        let mut summary = TransferSummary::default();
        for entry in entries {
            let file_type = tokio::fs::symlink_metadata(&entry).await?.file_type();
            if file_type.is_file() {
                summary.add(upload_file(store, &entry, &folder_id).await?.1);
            } else if file_type.is_dir() {
                let name = local_name(&entry)?;
                let child_id = match store.find_folder(&name, &folder_id).await? {
                    Some(folder) => folder.id,
                    None => store.create_folder(&name, &folder_id).await?.id,
                };
                summary.add(upload_dir_contents(store, entry, child_id).await?);
            } else {
                warn!(path = %entry.display(), "skipping special file");
                summary.skipped += 1;
            }
        }
        Ok(summary)
    }
    .boxed()
}

fn local_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| DriveError::InvalidName(path.display().to_string()))
}

/// Download a file or a whole folder into the local directory `destination`.
pub async fn download_item(
    store: &dyn RemoteStore,
    id: &str,
    destination: &Path,
) -> Result<TransferSummary> {
    let item = store.get(id).await?;
    tokio::fs::create_dir_all(destination).await?;
    download_entry(store, item, destination.to_path_buf()).await
}

fn download_entry(
    store: &dyn RemoteStore,
    item: FileMetadata,
    destination: PathBuf,
) -> BoxFuture<'_, Result<TransferSummary>> {
    async move {
        let mut summary = TransferSummary::default();
        if !is_portable_name(&item.name) {
            warn!(name = %item.name, "skipping item whose name is not a valid local name");
            summary.skipped += 1;
            return Ok(summary);
        }
        let target = destination.join(&item.name);

        if item.is_folder() {
            tokio::fs::create_dir_all(&target).await?;
            for child in store.list_children(&item.id).await? {
                summary.add(download_entry(store, child, target.clone()).await?);
            }
            info!(path = %target.display(), "folder downloaded");
            return Ok(summary);
        }

        if item.is_google_native() {
            warn!(name = %item.name, "Google editor files cannot be downloaded, skipping");
            summary.skipped += 1;
            return Ok(summary);
        }

        let partial = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&destination)?
            .into_temp_path();
        store.download(&item.id, &partial).await?;
        partial.persist(&target).map_err(|e| DriveError::IoError(e.error))?;
        info!(path = %target.display(), size = %format_size(item.size.unwrap_or(0)), "file downloaded");
        summary.transferred += 1;
        Ok(summary)
    }
    .boxed()
}
