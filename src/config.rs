//! Sync configuration.
//!
//! Every field has a default, so a config file only needs the keys it wants
//! to change. Command-line flags override whatever the file says.

use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::reconcile::ConflictPolicy;
use crate::retry::RetryPolicy;
use crate::state::StateStore;

/// Application directory under the platform config dir.
const APP_DIR: &str = "drive_sync";

const CONFIG_FILE: &str = "config.json";

fn default_max_concurrent() -> usize {
    4
}

fn default_trash() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Local folder to keep in sync.
    #[serde(default)]
    pub local_root: Option<PathBuf>,

    /// Remote folder URL or ID.
    #[serde(default)]
    pub remote_folder: Option<String>,

    /// Credentials JSON (service account key or authorized-user token file).
    #[serde(default)]
    pub credentials: Option<PathBuf>,

    /// Shared Drive ID.
    #[serde(default)]
    pub drive_id: Option<String>,

    /// Defaults to `<local_root>/.drive_sync/state.json`.
    #[serde(default)]
    pub state_path: Option<PathBuf>,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Upper bound on actions running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Glob patterns (relative paths or file names) left out of both scans.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Move remote deletions to the trash instead of deleting permanently.
    #[serde(default = "default_trash")]
    pub trash: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_root: None,
            remote_folder: None,
            credentials: None,
            drive_id: None,
            state_path: None,
            conflict_policy: ConflictPolicy::default(),
            max_concurrent: default_max_concurrent(),
            retry: RetryPolicy::default(),
            exclude: Vec::new(),
            trash: default_trash(),
        }
    }
}

impl SyncConfig {
    /// `<config_dir>/drive_sync/config.json`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                SyncError::Config(format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(SyncError::local_io(path, e)),
        }
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| SyncError::local_io(dir, e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        fs::write(path, content).map_err(|e| SyncError::local_io(path, e))
    }

    /// Compile the exclude globs.
    pub fn exclude_patterns(&self) -> Result<Vec<Pattern>, SyncError> {
        self.exclude
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| SyncError::Config(format!("exclude pattern {p:?}: {e}")))
            })
            .collect()
    }

    /// State file location for `local_root`.
    pub fn state_path_for(&self, local_root: &Path) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| StateStore::default_path(local_root))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_concurrent == 0 {
            return Err(SyncError::Config("maxConcurrent must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(SyncError::Config(
                "retry.baseDelayMs must not exceed retry.maxDelayMs".into(),
            ));
        }
        self.exclude_patterns().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert!(config.trash);
        assert_eq!(config.max_concurrent, 4);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"conflictPolicy": "prefer-newer", "retry": {"maxRetries": 2}, "exclude": ["*.tmp"]}"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.conflict_policy, ConflictPolicy::PreferNewer);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert_eq!(config.exclude_patterns().unwrap().len(), 1);
        assert!(config.trash);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let config = SyncConfig {
            remote_folder: Some("abc".into()),
            trash: false,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        let zero = SyncConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(SyncError::Config(_))));

        let bad_glob = SyncConfig {
            exclude: vec!["[".into()],
            ..Default::default()
        };
        assert!(bad_glob.validate().is_err());
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(SyncConfig::load(&path), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_state_path_default() {
        let config = SyncConfig::default();
        assert_eq!(
            config.state_path_for(Path::new("/data")),
            Path::new("/data").join(".drive_sync").join("state.json")
        );
    }
}
