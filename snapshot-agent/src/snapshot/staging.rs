//! Private staging subtrees used while building or restoring a snapshot.

use crate::fs::category::CategoryLayout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Names of the staging artifacts kept inside the scratch subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingNames {
    /// Directory holding the inner archives while a snapshot is built
    pub snapshot_dir: String,

    /// Directory holding the imported archive while it is restored
    pub restore_dir: String,

    /// File name of the published outer archive
    pub archive_name: String,
}

impl Default for StagingNames {
    fn default() -> Self {
        Self {
            snapshot_dir: ".snapshot-staging".to_string(),
            restore_dir: ".restore-staging".to_string(),
            archive_name: "snapshot.tar".to_string(),
        }
    }
}

impl StagingNames {
    pub fn snapshot_dir(&self, root: &Path, layout: &CategoryLayout) -> PathBuf {
        root.join(&layout.scratch).join(&self.snapshot_dir)
    }

    pub fn restore_dir(&self, root: &Path, layout: &CategoryLayout) -> PathBuf {
        root.join(&layout.scratch).join(&self.restore_dir)
    }

    pub fn default_output(&self, root: &Path, layout: &CategoryLayout) -> PathBuf {
        root.join(&layout.scratch).join(&self.archive_name)
    }

    /// Root-relative path fragments that must never be captured in a snapshot
    pub fn exclude_patterns(&self, layout: &CategoryLayout) -> Vec<String> {
        [&self.snapshot_dir, &self.restore_dir, &self.archive_name]
            .into_iter()
            .map(|name| format!("{}/{}", layout.scratch.trim_end_matches('/'), name))
            .collect()
    }
}

/// A staging directory that is removed when dropped.
///
/// A leftover directory from an interrupted run is cleared on creation.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    removed: bool,
}

impl StagingDir {
    pub fn create(path: PathBuf) -> io::Result<Self> {
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!("Cleared stale staging directory {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory now. Failures are logged, never returned.
    pub fn remove(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed staging directory {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove staging directory {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        self.cleanup();
    }
}
