//! Parsing of Drive folder references given on the command line or in batch files.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{DriveError, Result};

/// Drive share links: folder pages (optionally under `/u/N/`), file pages and `open?id=`.
static DRIVE_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https?://drive\.google\.com/(?:drive/(?:u/\d+/)?folders/|file/d/|open\?id=)([A-Za-z0-9_-]+)",
    )
    .expect("Invalid Drive URL regex")
});

/// Valid Google Drive ID pattern (alphanumeric, underscore, hyphen).
static ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("Invalid ID regex"));

/// Alias Drive accepts for the user's My Drive root.
pub const ROOT_ALIAS: &str = "root";

/// A validated Drive item ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FolderRef(String);

impl FolderRef {
    /// The user's My Drive root.
    pub fn root() -> Self {
        FolderRef(ROOT_ALIAS.to_string())
    }

    /// Parse a Drive URL or a raw ID.
    ///
    /// # Examples
    ///
    /// ```
    /// use drive_sync::FolderRef;
    ///
    /// let folder = FolderRef::parse("https://drive.google.com/drive/folders/1abc123").unwrap();
    /// assert_eq!(folder.id(), "1abc123");
    ///
    /// let folder = FolderRef::parse("1abc123").unwrap();
    /// assert_eq!(folder.id(), "1abc123");
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        if let Some(id) = DRIVE_URL_REGEX.captures(trimmed).and_then(|c| c.get(1)) {
            return Ok(FolderRef(id.as_str().to_string()));
        }

        if ID_REGEX.is_match(trimmed) {
            return Ok(FolderRef(trimmed.to_string()));
        }

        Err(DriveError::InvalidUrlOrId(input.to_string()))
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ALIAS
    }
}

impl FromStr for FolderRef {
    type Err = DriveError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for FolderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract a Google Drive ID from a URL or validate a raw ID.
pub fn extract_id(url_or_id: &str) -> Result<String> {
    FolderRef::parse(url_or_id).map(|f| f.0)
}
