//! Which relative paths take part in a sync.

use std::collections::BTreeSet;
use std::path::Path;

use glob::Pattern;

use crate::snapshot::file_name;
use crate::state::STATE_DIR;

use super::local::{PARTIAL_PREFIX, PARTIAL_SUFFIX};

/// Paths both scanners leave out.
///
/// Always excluded: the state directory, partial downloads and any state
/// file registered with [`ignore_path`](Self::ignore_path). A pattern is
/// tried against the relative path and against the bare file name, so
/// `*.tmp` and `.DS_Store` work at any depth. Applying the same filter on
/// both sides keeps an excluded file from looking deleted on one of them.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    patterns: Vec<Pattern>,
    ignored: BTreeSet<String>,
}

impl PathFilter {
    pub fn new(patterns: Vec<Pattern>) -> Self {
        Self {
            patterns,
            ignored: BTreeSet::new(),
        }
    }

    /// Leave out one exact relative path.
    pub fn ignore_path(mut self, relative_path: impl Into<String>) -> Self {
        self.ignored.insert(relative_path.into());
        self
    }

    /// Leave out `file` when it lies under `root`; files elsewhere never show up in a scan.
    pub fn ignore_file_under(self, root: &Path, file: &Path) -> Self {
        match relative_to(root, file) {
            Some(rel) => self.ignore_path(rel),
            None => self,
        }
    }

    pub fn is_excluded(&self, relative_path: &str) -> bool {
        if relative_path == STATE_DIR || relative_path.starts_with(&format!("{STATE_DIR}/")) {
            return true;
        }
        if self.ignored.contains(relative_path) {
            return true;
        }
        let name = file_name(relative_path);
        if name.starts_with(PARTIAL_PREFIX) && name.ends_with(PARTIAL_SUFFIX) {
            return true;
        }
        self.patterns
            .iter()
            .any(|p| p.matches(relative_path) || p.matches(name))
    }
}

/// `/`-separated path of `path` under `root`; `None` outside it or for non UTF-8 names.
pub(crate) fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}
