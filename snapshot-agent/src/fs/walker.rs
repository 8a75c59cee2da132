//! Container tree enumeration and classification.
//!
//! Walks a container root and collects every file, directory and symlink the
//! current process may archive, then partitions them by category.

use super::category::{CategoryLayout, Classification};
use crate::utils::errors::Result;
use nix::unistd::{access, AccessFlags};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Substrings of root-relative paths to leave out
    pub exclude_patterns: Vec<String>,
}

impl WalkOptions {
    pub fn with_excludes<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude_patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Walk `root` and return the root-relative paths of all archivable objects.
///
/// Best effort: unreadable directories, vanished entries and objects the
/// process could not read, overwrite and delete are skipped without error.
/// Symlinks are reported as themselves and never followed.
pub fn enumerate(root: &Path, options: &WalkOptions) -> BTreeSet<PathBuf> {
    let mut paths = BTreeSet::new();

    let entries = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, root, &options.exclude_patterns));

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable path: {}", e);
                continue;
            }
        };

        if !is_archivable(entry.path(), entry.path_is_symlink()) {
            debug!("Skipping non-archivable path: {}", entry.path().display());
            continue;
        }

        if let Ok(relative) = entry.path().strip_prefix(root) {
            paths.insert(relative.to_path_buf());
        }
    }

    paths
}

/// Enumerate `root` and partition the result by category.
pub fn classify(root: &Path, layout: &CategoryLayout, options: &WalkOptions) -> Result<Classification> {
    layout.validate()?;
    if !std::fs::metadata(root)?.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        )
        .into());
    }

    Ok(Classification::from_paths(enumerate(root, options), layout))
}

/// Readable, writable and deletable by the current process.
///
/// A symlink is judged on deletability alone, since access checks on the
/// link would test its target.
pub fn is_archivable(path: &Path, is_symlink: bool) -> bool {
    let accessible = is_symlink || access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok();
    accessible && is_deletable(path)
}

fn is_deletable(path: &Path) -> bool {
    path.parent()
        .map(|parent| access(parent, AccessFlags::W_OK | AccessFlags::X_OK).is_ok())
        .unwrap_or(false)
}

/// Check if a directory entry's root-relative path contains an exclude pattern
fn should_exclude(entry: &DirEntry, root: &Path, patterns: &[String]) -> bool {
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
    let relative = relative.to_string_lossy();

    patterns.iter().any(|pattern| relative.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::category::Category;
    use std::fs;
    use tempfile::TempDir;

    fn sample_root() -> std::io::Result<TempDir> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("Documents/sub"))?;
        fs::create_dir_all(root.join("Library/Caches"))?;
        fs::create_dir_all(root.join("tmp"))?;
        fs::create_dir_all(root.join("SystemData"))?;
        fs::write(root.join("Documents/a.txt"), b"a")?;
        fs::write(root.join("Documents/sub/b.txt"), b"b")?;
        fs::write(root.join("Library/Caches/c.db"), b"c")?;
        fs::write(root.join("tmp/d.bin"), b"")?;
        fs::write(root.join("SystemData/e"), b"e")?;
        std::os::unix::fs::symlink("Caches/c.db", root.join("Library/link"))?;
        Ok(temp_dir)
    }

    #[test]
    fn test_enumerate_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let paths = enumerate(temp_dir.path(), &WalkOptions::default());
        assert!(paths.is_empty());
        Ok(())
    }

    #[test]
    fn test_enumerate_includes_dirs_and_symlinks() -> std::io::Result<()> {
        let temp_dir = sample_root()?;
        let paths = enumerate(temp_dir.path(), &WalkOptions::default());

        assert!(paths.contains(Path::new("Documents")));
        assert!(paths.contains(Path::new("Documents/sub")));
        assert!(paths.contains(Path::new("Documents/sub/b.txt")));
        assert!(paths.contains(Path::new("Library/link")));
        assert!(paths.contains(Path::new("SystemData/e")));
        Ok(())
    }

    #[test]
    fn test_exclude_patterns() -> std::io::Result<()> {
        let temp_dir = sample_root()?;
        fs::create_dir_all(temp_dir.path().join("tmp/.snapshot-staging"))?;
        fs::write(temp_dir.path().join("tmp/.snapshot-staging/documents.tar"), b"x")?;
        fs::write(temp_dir.path().join("tmp/snapshot.tar"), b"x")?;

        let options = WalkOptions::with_excludes(["tmp/.snapshot-staging", "tmp/snapshot.tar"]);
        let paths = enumerate(temp_dir.path(), &options);

        assert!(paths.contains(Path::new("tmp/d.bin")));
        assert!(!paths.iter().any(|p| p.to_string_lossy().contains("snapshot")));
        Ok(())
    }

    #[test]
    fn test_classify_partitions_root() -> Result<()> {
        let temp_dir = sample_root()?;
        let classification = classify(
            temp_dir.path(),
            &CategoryLayout::default(),
            &WalkOptions::default(),
        )?;

        let docs: Vec<_> = classification.get(Category::Documents).iter().cloned().collect();
        assert_eq!(
            docs,
            vec![
                PathBuf::from("Documents/a.txt"),
                PathBuf::from("Documents/sub"),
                PathBuf::from("Documents/sub/b.txt"),
            ]
        );
        assert_eq!(classification.library.len(), 3);
        assert_eq!(classification.scratch.len(), 1);
        assert!(!classification.library.contains(Path::new("SystemData/e")));
        Ok(())
    }

    #[test]
    fn test_classify_missing_root_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = classify(
            &temp_dir.path().join("missing"),
            &CategoryLayout::default(),
            &WalkOptions::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_archivable_regular_file() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("f");
        fs::write(&file, b"x")?;
        assert!(is_archivable(&file, false));
        assert!(!is_archivable(&temp_dir.path().join("missing"), false));
        Ok(())
    }
}
