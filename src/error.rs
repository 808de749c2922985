//! Error types for the drive_sync crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::reconcile::ConflictKind;

/// API reasons Google returns with a 403 when the caller should slow down.
const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

/// Errors that can occur when interacting with Google Drive.
#[derive(Error, Debug)]
pub enum DriveError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    ApiError {
        status: u16,
        reason: Option<String>,
        message: String,
    },

    #[error("Invalid folder URL or ID: {0}")]
    InvalidUrlOrId(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid folder name: {0:?}")]
    InvalidName(String),

    #[error("JWT encoding error: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),

    #[error("Token refresh failed: {0}")]
    TokenRefreshError(String),
}

impl DriveError {
    /// Build an API error without a machine-readable reason.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        DriveError::ApiError {
            status,
            reason: None,
            message: message.into(),
        }
    }

    /// Whether retrying the same request later may succeed.
    ///
    /// Rate limiting (429, or 403 with a rate-limit reason), request timeouts,
    /// server errors and transport failures are transient. Permission, quota,
    /// authentication and not-found errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            DriveError::ApiError { status, reason, .. } => match status {
                408 | 429 | 500 | 502 | 503 | 504 => true,
                403 => reason
                    .as_deref()
                    .is_some_and(|r| RATE_LIMIT_REASONS.contains(&r)),
                _ => false,
            },
            DriveError::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            _ => false,
        }
    }

    /// Whether the error means the remote object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::ApiError { status: 404, .. })
    }
}

/// Result type alias for DriveError.
pub type Result<T> = std::result::Result<T, DriveError>;

/// Errors raised while synchronizing a local folder with a remote one.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{path}: remote still failing after retries: {source}")]
    TransientRemote {
        path: String,
        #[source]
        source: DriveError,
    },

    #[error("{path}: remote refused the operation: {source}")]
    FatalRemote {
        path: String,
        #[source]
        source: DriveError,
    },

    #[error("{}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: conflict ({kind}) needs a manual decision")]
    Conflict { path: String, kind: ConflictKind },

    #[error("sync cancelled")]
    Cancelled,

    #[error("state file {}: {source}", path.display())]
    State {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file belongs to remote folder {recorded}, not {requested}")]
    StateMismatch { recorded: String, requested: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Wrap a remote error for `path`, sorting it into the transient or fatal bucket.
    pub fn remote(path: impl Into<String>, source: DriveError) -> Self {
        let path = path.into();
        if source.is_transient() {
            SyncError::TransientRemote { path, source }
        } else {
            SyncError::FatalRemote { path, source }
        }
    }

    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Short label for reports.
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::TransientRemote { .. } => "transient",
            SyncError::FatalRemote { .. } => "fatal",
            SyncError::LocalIo { .. } => "local-io",
            SyncError::Conflict { .. } => "conflict",
            SyncError::Cancelled => "cancelled",
            SyncError::State { .. } | SyncError::StateMismatch { .. } => "state",
            SyncError::Config(_) => "config",
        }
    }
}
