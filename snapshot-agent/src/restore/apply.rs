//! Recreating a single archive entry on the live tree.

use crate::archive::{ArchiveEntry, EntryKind};
use crate::fs::metadata::EntryAttributes;
use crate::utils::errors::{Result, SnapshotError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Per-entry apply policy
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Replace objects already present at the destination
    pub overwrite: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { overwrite: true }
    }
}

/// Directory attributes to apply once its children are in place
#[derive(Debug, Clone)]
pub struct DeferredAttributes {
    pub path: PathBuf,
    pub attributes: EntryAttributes,
}

#[derive(Debug)]
pub enum ApplyOutcome {
    /// Object and attributes are in place
    Applied,
    /// Directory created; attributes still to be applied
    Deferred(DeferredAttributes),
    /// An existing object was left untouched
    Kept,
}

impl ArchiveEntry {
    /// Recreate this entry below `root`.
    pub fn apply_to(&self, root: &Path, options: &ApplyOptions) -> Result<ApplyOutcome> {
        let destination = self.destination(root)?;
        ensure_no_symlink_parent(root, &destination)?;

        match self.kind {
            EntryKind::Directory => self.apply_directory(destination, options),
            EntryKind::File => self.apply_file(&destination, options),
            EntryKind::Symlink => self.apply_symlink(&destination, options),
        }
    }

    fn apply_directory(&self, destination: PathBuf, options: &ApplyOptions) -> Result<ApplyOutcome> {
        match fs::symlink_metadata(&destination) {
            Ok(_) if !options.overwrite => return Ok(ApplyOutcome::Kept),
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                remove_existing(&destination)?;
                fs::create_dir_all(&destination)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(&destination)?,
            Err(e) => return Err(e.into()),
        }

        if self.attributes.is_empty() {
            return Ok(ApplyOutcome::Applied);
        }
        Ok(ApplyOutcome::Deferred(DeferredAttributes {
            path: destination,
            attributes: self.attributes,
        }))
    }

    fn apply_file(&self, destination: &Path, options: &ApplyOptions) -> Result<ApplyOutcome> {
        let exists = fs::symlink_metadata(destination).is_ok();
        if exists && !options.overwrite {
            return Ok(ApplyOutcome::Kept);
        }

        let parent = destination.parent().ok_or_else(|| {
            SnapshotError::Unsupported(format!("{} has no parent directory", destination.display()))
        })?;
        fs::create_dir_all(parent)?;

        let file_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{}.{}.partial", file_name, Uuid::new_v4()));

        let written = self.write_temp(&temp_path).and_then(|_| {
            if exists && fs::symlink_metadata(destination)?.is_dir() {
                // rename cannot replace a directory with a file
                fs::remove_dir_all(destination)?;
            }
            fs::rename(&temp_path, destination)
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!("Restored {} ({} bytes)", self.name, self.size());
        Ok(ApplyOutcome::Applied)
    }

    fn write_temp(&self, temp_path: &Path) -> io::Result<()> {
        let mut file = fs::File::create(temp_path)?;
        file.write_all(self.payload.as_deref().unwrap_or_default())?;
        file.sync_all()?;
        drop(file);
        self.attributes.apply_to_path(temp_path, false)
    }

    fn apply_symlink(&self, destination: &Path, options: &ApplyOptions) -> Result<ApplyOutcome> {
        let target = self.link_target.as_deref().ok_or_else(|| {
            SnapshotError::CorruptArchive(format!("symlink '{}' has no target", self.name))
        })?;

        if fs::symlink_metadata(destination).is_ok() {
            if !options.overwrite {
                return Ok(ApplyOutcome::Kept);
            }
            remove_existing(destination)?;
        } else if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        std::os::unix::fs::symlink(target, destination)?;
        self.attributes.apply_to_path(destination, true)?;
        Ok(ApplyOutcome::Applied)
    }
}

/// Remove whatever object sits at `path`, without following symlinks.
pub fn remove_existing(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Refuse destinations reached through a symlink below `root`, which could
/// redirect a write outside the root.
fn ensure_no_symlink_parent(root: &Path, destination: &Path) -> Result<()> {
    let Some(parent) = destination.parent() else {
        return Ok(());
    };
    let Ok(relative) = parent.strip_prefix(root) else {
        return Ok(());
    };

    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(SnapshotError::Unsupported(format!(
                    "{} is reached through symlink {}",
                    destination.display(),
                    current.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
