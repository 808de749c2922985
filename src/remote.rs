//! The remote file service as seen by the sync engine.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::FileMetadata;

/// Operations the scanner and executor need from a remote file store.
///
/// [`DriveClient`](crate::client::DriveClient) is the production
/// implementation; anything else (an in-memory fake in tests) can stand in.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the non-trashed children of a folder, all pages.
    async fn list_children(&self, folder_id: &str) -> Result<Vec<FileMetadata>>;

    /// Fetch metadata of a single item.
    async fn get(&self, id: &str) -> Result<FileMetadata>;

    /// Create a folder under `parent_id`.
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<FileMetadata>;

    /// Upload `local_path` as `name` in `parent_id`.
    ///
    /// With `existing_id` the content of that file is replaced instead of
    /// creating a new file.
    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        parent_id: &str,
        existing_id: Option<&str>,
    ) -> Result<FileMetadata>;

    /// Write the content of `id` to `destination`, truncating it.
    async fn download(&self, id: &str, destination: &Path) -> Result<()>;

    /// Remove an item. Removing something already gone succeeds.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Rename and/or move an item.
    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        from_parent: &str,
        to_parent: &str,
    ) -> Result<FileMetadata>;

    /// Find a non-folder child by exact name. The most recently modified wins.
    async fn find_file(&self, name: &str, parent_id: &str) -> Result<Option<FileMetadata>> {
        let mut matches: Vec<FileMetadata> = self
            .list_children(parent_id)
            .await?
            .into_iter()
            .filter(|f| f.name == name && !f.is_folder())
            .collect();
        matches.sort_by_key(|f| f.modified_time);
        Ok(matches.pop())
    }

    /// Find a child folder by exact name.
    async fn find_folder(&self, name: &str, parent_id: &str) -> Result<Option<FileMetadata>> {
        Ok(self
            .list_children(parent_id)
            .await?
            .into_iter()
            .find(|f| f.name == name && f.is_folder()))
    }
}
