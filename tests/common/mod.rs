//! In-memory Drive used by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use drive_sync::error::{DriveError, Result};
use drive_sync::models::{FileMetadata, FOLDER_MIME_TYPE};
use drive_sync::snapshot::hash_bytes;
use drive_sync::RemoteStore;

pub const ROOT_ID: &str = "root-folder";

struct Item {
    meta: FileMetadata,
    content: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, Item>,
    next_id: u64,
    clock: i64,
    failures: HashMap<&'static str, VecDeque<(u16, Option<String>)>>,
    calls: HashMap<&'static str, usize>,
}

impl Inner {
    fn id(&mut self) -> String {
        self.next_id += 1;
        format!("id{}", self.next_id)
    }

    /// Strictly increasing timestamps so newer writes always compare newer.
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        DateTime::<Utc>::UNIX_EPOCH + Duration::days(19_000) + Duration::seconds(self.clock)
    }

    fn call(&mut self, op: &'static str) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(op).and_then(|q| q.pop_front()) {
            Some((status, reason)) => Err(DriveError::ApiError {
                status,
                reason,
                message: format!("injected {op} failure"),
            }),
            None => Ok(()),
        }
    }

    fn child(&self, parent: &str, name: &str) -> Option<&Item> {
        self.items
            .values()
            .find(|i| i.meta.name == name && i.meta.parents.iter().any(|p| p == parent))
    }

    fn folder(&mut self, name: &str, parent: &str) -> String {
        if let Some(existing) = self.child(parent, name).filter(|i| i.meta.is_folder()) {
            return existing.meta.id.clone();
        }
        let id = self.id();
        let modified = self.tick();
        self.items.insert(
            id.clone(),
            Item {
                meta: FileMetadata {
                    id: id.clone(),
                    name: name.to_string(),
                    mime_type: Some(FOLDER_MIME_TYPE.to_string()),
                    modified_time: Some(modified),
                    parents: vec![parent.to_string()],
                    ..Default::default()
                },
                content: Vec::new(),
            },
        );
        id
    }

    fn folder_path(&mut self, dir: &str) -> String {
        let mut parent = ROOT_ID.to_string();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            parent = self.folder(part, &parent);
        }
        parent
    }

    fn write(&mut self, id: Option<String>, name: &str, parent: &str, content: Vec<u8>) -> FileMetadata {
        let id = id.unwrap_or_else(|| self.id());
        let modified = self.tick();
        let meta = FileMetadata {
            id: id.clone(),
            name: name.to_string(),
            mime_type: Some("application/octet-stream".to_string()),
            size: Some(content.len() as u64),
            modified_time: Some(modified),
            sha256_checksum: Some(hash_bytes(&content)),
            parents: vec![parent.to_string()],
        };
        self.items.insert(id, Item { meta: meta.clone(), content });
        meta
    }

    fn path_of(&self, item: &Item) -> Option<String> {
        let mut parts = vec![item.meta.name.clone()];
        let mut parent = item.meta.parents.first()?.clone();
        while parent != ROOT_ID {
            let folder = self.items.get(&parent)?;
            parts.push(folder.meta.name.clone());
            parent = folder.meta.parents.first()?.clone();
        }
        parts.reverse();
        Some(parts.join("/"))
    }

    fn find_path(&self, path: &str) -> Option<&Item> {
        self.items
            .values()
            .find(|i| !i.meta.is_folder() && self.path_of(i).as_deref() == Some(path))
    }
}

/// Counts one running upload until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(running: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(running)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A Drive with one root folder, [`ROOT_ID`].
pub struct FakeDrive {
    inner: Mutex<Inner>,
    upload_latency: Mutex<StdDuration>,
    uploads_running: AtomicUsize,
    uploads_peak: AtomicUsize,
}

impl FakeDrive {
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.items.insert(
            ROOT_ID.to_string(),
            Item {
                meta: FileMetadata {
                    id: ROOT_ID.to_string(),
                    name: "Sync".to_string(),
                    mime_type: Some(FOLDER_MIME_TYPE.to_string()),
                    ..Default::default()
                },
                content: Vec::new(),
            },
        );
        Self {
            inner: Mutex::new(inner),
            upload_latency: Mutex::new(StdDuration::ZERO),
            uploads_running: AtomicUsize::new(0),
            uploads_peak: AtomicUsize::new(0),
        }
    }

    /// Make every upload take at least `latency`.
    pub fn set_upload_latency(&self, latency: StdDuration) {
        *self.upload_latency.lock().unwrap() = latency;
    }

    /// Most uploads that were ever running at the same time.
    pub fn peak_uploads(&self) -> usize {
        self.uploads_peak.load(Ordering::SeqCst)
    }

    /// Create or overwrite the file at `path`, creating folders on the way.
    pub fn put(&self, path: &str, content: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        let parent = inner.folder_path(dir);
        let existing = inner
            .child(&parent, name)
            .filter(|i| !i.meta.is_folder())
            .map(|i| i.meta.id.clone());
        inner.write(existing, name, &parent, content.as_bytes().to_vec()).id
    }

    /// Add a Google Docs editor file (no checksum, no content).
    pub fn put_native(&self, path: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        let parent = inner.folder_path(dir);
        let id = inner.id();
        inner.items.insert(
            id.clone(),
            Item {
                meta: FileMetadata {
                    id: id.clone(),
                    name: name.to_string(),
                    mime_type: Some("application/vnd.google-apps.document".to_string()),
                    parents: vec![parent],
                    ..Default::default()
                },
                content: Vec::new(),
            },
        );
        id
    }

    pub fn mkdir(&self, dir: &str) -> String {
        self.inner.lock().unwrap().folder_path(dir)
    }

    pub fn remove(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.find_path(path).map(|i| i.meta.id.clone()) {
            inner.items.remove(&id);
        }
    }

    /// Move a file, keeping its id.
    pub fn move_file(&self, from: &str, to: &str) {
        let mut inner = self.inner.lock().unwrap();
        let (dir, name) = to.rsplit_once('/').unwrap_or(("", to));
        let parent = inner.folder_path(dir);
        let Some(id) = inner.find_path(from).map(|i| i.meta.id.clone()) else {
            panic!("no remote file at {from}");
        };
        if let Some(item) = inner.items.get_mut(&id) {
            item.meta.name = name.to_string();
            item.meta.parents = vec![parent];
        }
    }

    pub fn content(&self, path: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .find_path(path)
            .map(|i| String::from_utf8_lossy(&i.content).into_owned())
    }

    pub fn id_of(&self, path: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.find_path(path).map(|i| i.meta.id.clone())
    }

    /// Paths of every file (not folders).
    pub fn files(&self) -> BTreeSet<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .values()
            .filter(|i| !i.meta.is_folder() && i.meta.id != ROOT_ID)
            .filter_map(|i| inner.path_of(i))
            .collect()
    }

    pub fn folder_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .values()
            .filter(|i| i.meta.is_folder() && i.meta.id != ROOT_ID)
            .count()
    }

    /// Make the next `times` calls of `op` fail with `status`/`reason`.
    pub fn fail(&self, op: &'static str, times: usize, status: u16, reason: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back((status, reason.map(str::to_string)));
        }
    }

    pub fn calls(&self, op: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.calls.get(op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteStore for FakeDrive {
    async fn list_children(&self, folder_id: &str) -> Result<Vec<FileMetadata>> {
        let mut inner = self.inner.lock().unwrap();
        inner.call("list_children")?;
        let mut children: Vec<FileMetadata> = inner
            .items
            .values()
            .filter(|i| i.meta.parents.iter().any(|p| p == folder_id))
            .map(|i| i.meta.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn get(&self, id: &str) -> Result<FileMetadata> {
        let mut inner = self.inner.lock().unwrap();
        inner.call("get")?;
        inner
            .items
            .get(id)
            .map(|i| i.meta.clone())
            .ok_or_else(|| DriveError::api(404, format!("File not found: {id}")))
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<FileMetadata> {
        let mut inner = self.inner.lock().unwrap();
        inner.call("create_folder")?;
        let id = inner.id();
        let modified = inner.tick();
        let meta = FileMetadata {
            id: id.clone(),
            name: name.to_string(),
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            modified_time: Some(modified),
            parents: vec![parent_id.to_string()],
            ..Default::default()
        };
        inner.items.insert(
            id,
            Item {
                meta: meta.clone(),
                content: Vec::new(),
            },
        );
        Ok(meta)
    }

    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        parent_id: &str,
        existing_id: Option<&str>,
    ) -> Result<FileMetadata> {
        let _running = InFlight::enter(&self.uploads_running, &self.uploads_peak);
        let latency = *self.upload_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let content = std::fs::read(local_path)?;
        let mut inner = self.inner.lock().unwrap();
        inner.call("upload")?;
        let parent = match existing_id.and_then(|id| inner.items.get(id)) {
            Some(item) => item.meta.parents.first().cloned().unwrap_or_default(),
            None => parent_id.to_string(),
        };
        Ok(inner.write(existing_id.map(str::to_string), name, &parent, content))
    }

    async fn download(&self, id: &str, destination: &Path) -> Result<()> {
        let content = {
            let mut inner = self.inner.lock().unwrap();
            inner.call("download")?;
            inner
                .items
                .get(id)
                .map(|i| i.content.clone())
                .ok_or_else(|| DriveError::api(404, format!("File not found: {id}")))?
        };
        std::fs::write(destination, content)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.call("delete")?;
        inner.items.remove(id);
        Ok(())
    }

    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        _from_parent: &str,
        to_parent: &str,
    ) -> Result<FileMetadata> {
        let mut inner = self.inner.lock().unwrap();
        inner.call("rename")?;
        let item = inner
            .items
            .get_mut(id)
            .ok_or_else(|| DriveError::api(404, format!("File not found: {id}")))?;
        item.meta.name = new_name.to_string();
        item.meta.parents = vec![to_parent.to_string()];
        Ok(item.meta.clone())
    }
}
