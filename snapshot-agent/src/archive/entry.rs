//! In-memory representation of one archive member.

use crate::fs::metadata::EntryAttributes;
use crate::utils::errors::{Result, SnapshotError};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Kind of filesystem object an entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One archived object with its metadata and optional payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Forward-slash separated path relative to the archive root
    pub name: String,

    pub kind: EntryKind,

    pub attributes: EntryAttributes,

    /// Target path, symlinks only
    pub link_target: Option<String>,

    /// File contents, regular files only
    pub payload: Option<Vec<u8>>,
}

impl ArchiveEntry {
    pub fn file(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            attributes: EntryAttributes::default(),
            link_target: None,
            payload: Some(payload),
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            attributes: EntryAttributes::default(),
            link_target: None,
            payload: None,
        }
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Symlink,
            attributes: EntryAttributes::default(),
            link_target: Some(target.into()),
            payload: None,
        }
    }

    pub fn with_attributes(mut self, attributes: EntryAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Payload length in bytes (zero for directories and symlinks)
    pub fn size(&self) -> u64 {
        self.payload.as_ref().map_or(0, |p| p.len() as u64)
    }

    /// Build an entry from the live object at `path`, archived under `name`.
    ///
    /// Symlinks are recorded as links, never followed. Sockets, FIFOs and
    /// device nodes fail with [`SnapshotError::Unsupported`].
    pub fn from_path(path: &Path, name: &str) -> Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        let attributes = EntryAttributes::from_metadata(&metadata);
        let file_type = metadata.file_type();

        let entry = if file_type.is_dir() {
            Self::directory(name)
        } else if file_type.is_file() {
            Self::file(name, fs::read(path)?)
        } else if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            let target = target.to_str().ok_or_else(|| {
                SnapshotError::Unsupported(format!(
                    "symlink target of {} is not valid UTF-8",
                    path.display()
                ))
            })?;
            Self::symlink(name, target)
        } else {
            return Err(SnapshotError::Unsupported(format!(
                "{} is not a regular file, directory or symlink",
                path.display()
            )));
        };

        Ok(entry.with_attributes(attributes))
    }

    /// Resolve the entry name under `root`, refusing names that would escape it.
    pub fn destination(&self, root: &Path) -> Result<PathBuf> {
        let relative = Path::new(self.name.trim_end_matches('/'));
        let mut destination = root.to_path_buf();
        let mut depth = 0usize;

        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    destination.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(SnapshotError::Unsupported(format!(
                        "entry name '{}' escapes the destination root",
                        self.name
                    )));
                }
            }
        }

        if depth == 0 {
            return Err(SnapshotError::Unsupported("entry has an empty name".to_string()));
        }
        Ok(destination)
    }
}

/// Archive name for a path below `root`: relative, forward-slash separated.
pub fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        SnapshotError::Unsupported(format!(
            "{} is outside {}",
            path.display(),
            root.display()
        ))
    })?;

    let parts = relative
        .components()
        .map(|c| {
            c.as_os_str().to_str().ok_or_else(|| {
                SnapshotError::Unsupported(format!("{} is not valid UTF-8", path.display()))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_from_path_regular_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("note.txt");
        fs::write(&path, b"0123456789")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;

        let entry = ArchiveEntry::from_path(&path, "Documents/note.txt")?;

        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.payload.as_deref(), Some(&b"0123456789"[..]));
        assert_eq!(entry.attributes.permissions, Some(0o644));
        assert!(entry.attributes.modified_at.is_some());
        assert_eq!(entry.size(), 10);

        Ok(())
    }

    #[test]
    fn test_from_path_directory_and_symlink() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path().join("cache");
        fs::create_dir(&dir)?;
        let link = temp_dir.path().join("current");
        std::os::unix::fs::symlink("cache", &link)?;

        let dir_entry = ArchiveEntry::from_path(&dir, "Library/cache")?;
        assert_eq!(dir_entry.kind, EntryKind::Directory);
        assert!(dir_entry.payload.is_none());
        assert!(dir_entry.link_target.is_none());

        let link_entry = ArchiveEntry::from_path(&link, "Library/current")?;
        assert_eq!(link_entry.kind, EntryKind::Symlink);
        assert_eq!(link_entry.link_target.as_deref(), Some("cache"));
        assert!(link_entry.payload.is_none());

        Ok(())
    }

    #[test]
    fn test_from_path_missing_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = ArchiveEntry::from_path(&temp_dir.path().join("gone"), "gone").unwrap_err();
        assert!(matches!(err, SnapshotError::Io(_)));
        assert!(err.is_skippable());
    }

    #[test]
    fn test_destination_rejects_escaping_names() {
        let root = Path::new("/data/root");

        let ok = ArchiveEntry::directory("Library/cache/").destination(root).unwrap();
        assert_eq!(ok, PathBuf::from("/data/root/Library/cache"));

        for name in ["../etc/passwd", "/etc/passwd", "Documents/../../x", "", "./"] {
            let err = ArchiveEntry::file(name, Vec::new()).destination(root).unwrap_err();
            assert!(matches!(err, SnapshotError::Unsupported(_)), "{name}");
        }
    }

    #[test]
    fn test_entry_name_is_relative_forward_slash() {
        let root = Path::new("/data/root");
        let name = entry_name(root, Path::new("/data/root/Library/Caches/db.sqlite")).unwrap();
        assert_eq!(name, "Library/Caches/db.sqlite");

        assert!(entry_name(root, Path::new("/elsewhere/file")).is_err());
    }
}
