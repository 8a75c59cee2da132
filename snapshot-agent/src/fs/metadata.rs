//! File attribute handling for snapshot and restore.
//!
//! Only the attributes the archive format carries are modelled: POSIX
//! permission bits and the modification time in whole seconds. Each is
//! optional, and restore applies only the ones that are present.

use nix::sys::stat::{lutimes, utimes};
use nix::sys::time::{TimeVal, TimeValLike};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// Attributes restored onto an applied entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAttributes {
    /// Permission bits (including setuid/setgid/sticky)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,

    /// Last modified time (seconds since Unix epoch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

impl EntryAttributes {
    /// Read attributes from `symlink_metadata`-style metadata
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        Self {
            permissions: Some(metadata.mode() & 0o7777),
            modified_at: Some(metadata.mtime()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_none() && self.modified_at.is_none()
    }

    /// Apply the present attributes to `path`.
    ///
    /// For a symlink the timestamp is set on the link itself and permissions
    /// are left alone, since Linux has no way to change a link's mode.
    pub fn apply_to_path(&self, path: &Path, is_symlink: bool) -> std::io::Result<()> {
        if let Some(mode) = self.permissions {
            if !is_symlink {
                fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
            }
        }

        if let Some(secs) = self.modified_at {
            let time = TimeVal::seconds(secs);
            if is_symlink {
                lutimes(path, &time, &time)?;
            } else {
                utimes(path, &time, &time)?;
            }
        }

        Ok(())
    }
}
