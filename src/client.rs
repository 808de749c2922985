//! Google Drive API v3 client.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Method, RequestBuilder, Response};
use serde_json::json;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::auth::Authenticator;
use crate::error::{DriveError, Result};
use crate::models::{ApiErrorResponse, FileListResponse, FileMetadata, FILE_FIELDS, FOLDER_MIME_TYPE};
use crate::remote::RemoteStore;

/// Base URL for Google Drive API v3.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Upload URL for Google Drive API.
const UPLOAD_API_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Files above this size go through a resumable upload session (8 MB).
const RESUMABLE_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Largest page Drive will return for files.list.
const PAGE_SIZE: &str = "1000";

/// Client for a user's My Drive or a Shared Drive.
pub struct DriveClient {
    auth: Authenticator,
    http: Client,
    drive_id: Option<String>,
    api_base: String,
    upload_base: String,
    trash_on_delete: bool,
}

impl DriveClient {
    /// Create a client for the user's My Drive.
    ///
    /// Deletes move items to the trash unless [`with_trash`](Self::with_trash)
    /// turns that off.
    pub fn new(auth: Authenticator) -> Self {
        Self {
            auth,
            http: Client::new(),
            drive_id: None,
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: UPLOAD_API_BASE.to_string(),
            trash_on_delete: true,
        }
    }

    /// Scope listings to a Shared Drive.
    pub fn with_shared_drive(mut self, drive_id: impl Into<String>) -> Self {
        self.drive_id = Some(drive_id.into());
        self
    }

    /// Point the client at different API hosts (used by tests).
    pub fn with_endpoints(mut self, api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.upload_base = upload_base.into();
        self
    }

    /// Choose between trashing (default) and permanently deleting.
    pub fn with_trash(mut self, trash: bool) -> Self {
        self.trash_on_delete = trash;
        self
    }

    /// Get the Shared Drive ID, if any.
    pub fn drive_id(&self) -> Option<&str> {
        self.drive_id.as_deref()
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base, id)
    }

    /// A request carrying a fresh bearer token, valid for shared drives too.
    async fn authorized(&self, method: Method, url: String) -> Result<RequestBuilder> {
        let token = self.auth.get_access_token().await?;
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token)
            .query(&[("supportsAllDrives", "true")]))
    }

    /// Run every page of a files.list query.
    pub async fn query_files(&self, query: &str) -> Result<Vec<FileMetadata>> {
        let fields = format!("nextPageToken, files({FILE_FIELDS})");
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .authorized(Method::GET, format!("{}/files", self.api_base))
                .await?
                .query(&[
                    ("q", query),
                    ("spaces", "drive"),
                    ("pageSize", PAGE_SIZE),
                    ("includeItemsFromAllDrives", "true"),
                    ("fields", fields.as_str()),
                ]);
            if let Some(drive_id) = &self.drive_id {
                request = request.query(&[("driveId", drive_id.as_str()), ("corpora", "drive")]);
            }
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page)]);
            }

            let page: FileListResponse = send(request).await?.json().await?;
            files.extend(page.files);
            page_token = page.next_page_token;
            if page_token.is_none() {
                return Ok(files);
            }
        }
    }

    /// Metadata and content in one multipart request.
    async fn upload_multipart(
        &self,
        method: Method,
        url: String,
        local_path: &Path,
        metadata: serde_json::Value,
        mime_type: &str,
    ) -> Result<FileMetadata> {
        let content = tokio::fs::read(local_path).await?;
        let form = Form::new()
            .part(
                "metadata",
                Part::text(metadata.to_string()).mime_str("application/json")?,
            )
            .part("file", Part::bytes(content).mime_str(mime_type)?);

        let request = self
            .authorized(method, url)
            .await?
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .multipart(form);
        Ok(send(request).await?.json().await?)
    }

    /// Open a resumable session, then stream the file into it.
    async fn upload_resumable(
        &self,
        method: Method,
        url: String,
        local_path: &Path,
        metadata: serde_json::Value,
        mime_type: &str,
        file_size: u64,
    ) -> Result<FileMetadata> {
        let session = self
            .authorized(method, url)
            .await?
            .query(&[("uploadType", "resumable")])
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", file_size.to_string())
            .json(&metadata);
        let session = send(session).await?;
        let location = session
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DriveError::api(500, "Resumable session returned no Location"))?
            .to_string();

        let body = Body::wrap_stream(ReaderStream::new(File::open(local_path).await?));
        let request = self
            .http
            .put(location)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .header(reqwest::header::CONTENT_LENGTH, file_size)
            .query(&[("fields", FILE_FIELDS)])
            .body(body);
        Ok(send(request).await?.json().await?)
    }
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn list_children(&self, folder_id: &str) -> Result<Vec<FileMetadata>> {
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        self.query_files(&query).await
    }

    async fn get(&self, id: &str) -> Result<FileMetadata> {
        let request = self
            .authorized(Method::GET, self.file_url(id))
            .await?
            .query(&[("fields", FILE_FIELDS)]);
        Ok(send(request).await?.json().await?)
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<FileMetadata> {
        let request = self
            .authorized(Method::POST, format!("{}/files", self.api_base))
            .await?
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({
                "name": name,
                "mimeType": FOLDER_MIME_TYPE,
                "parents": [parent_id],
            }));
        let folder: FileMetadata = send(request).await?.json().await?;
        debug!(name, id = %folder.id, "created remote folder");
        Ok(folder)
    }

    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        parent_id: &str,
        existing_id: Option<&str>,
    ) -> Result<FileMetadata> {
        let file_meta = tokio::fs::metadata(local_path).await?;
        let file_size = file_meta.len();
        let mime_type = mime_guess::from_path(local_path)
            .first_or_octet_stream()
            .to_string();

        let mut metadata = json!({ "name": name });
        if let Ok(modified) = file_meta.modified() {
            let modified: DateTime<Utc> = modified.into();
            metadata["modifiedTime"] = json!(modified.to_rfc3339_opts(SecondsFormat::Millis, true));
        }

        // Updating content keeps the id; parents only go on new files.
        let (method, url) = match existing_id {
            Some(id) => (Method::PATCH, format!("{}/files/{}", self.upload_base, id)),
            None => {
                metadata["parents"] = json!([parent_id]);
                (Method::POST, format!("{}/files", self.upload_base))
            }
        };

        debug!(name, size = file_size, update = existing_id.is_some(), "uploading");
        if file_size > RESUMABLE_THRESHOLD {
            self.upload_resumable(method, url, local_path, metadata, &mime_type, file_size)
                .await
        } else {
            self.upload_multipart(method, url, local_path, metadata, &mime_type)
                .await
        }
    }

    async fn download(&self, id: &str, destination: &Path) -> Result<()> {
        let request = self
            .authorized(Method::GET, self.file_url(id))
            .await?
            .query(&[("alt", "media")]);
        let mut body = send(request).await?.bytes_stream();

        let mut file = File::create(destination).await?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let request = if self.trash_on_delete {
            self.authorized(Method::PATCH, self.file_url(id))
                .await?
                .json(&json!({ "trashed": true }))
        } else {
            self.authorized(Method::DELETE, self.file_url(id)).await?
        };

        match send(request).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        from_parent: &str,
        to_parent: &str,
    ) -> Result<FileMetadata> {
        let mut request = self
            .authorized(Method::PATCH, self.file_url(id))
            .await?
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({ "name": new_name }));
        if from_parent != to_parent {
            request = request.query(&[("addParents", to_parent), ("removeParents", from_parent)]);
        }
        Ok(send(request).await?.json().await?)
    }

    async fn find_file(&self, name: &str, parent_id: &str) -> Result<Option<FileMetadata>> {
        let query = format!(
            "name = '{}' and '{}' in parents and mimeType != '{}' and trashed = false",
            escape_query(name),
            escape_query(parent_id),
            FOLDER_MIME_TYPE
        );
        let mut files = self.query_files(&query).await?;
        files.sort_by_key(|f| f.modified_time);
        Ok(files.pop())
    }
}

/// Escape a literal for use inside a single-quoted Drive query string.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Send a request and turn a non-2xx answer into an `ApiError`, keeping
/// Google's machine-readable reason.
async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(parsed) => Err(DriveError::ApiError {
            status: parsed.error.code,
            reason: parsed.error.reason(),
            message: parsed.error.message,
        }),
        Err(_) => Err(DriveError::api(status.as_u16(), body)),
    }
}
