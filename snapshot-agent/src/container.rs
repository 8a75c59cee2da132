//! Container manager - the single entry point for operations on one root.
//!
//! Every operation takes the manager's lock for its whole duration, so a
//! snapshot never observes a half-applied restore and two restores never
//! interleave. Callers simply queue.

use crate::fs::category::{Category, CategoryLayout, Classification};
use crate::fs::walker::{classify, WalkOptions};
use crate::restore::apply::{remove_existing, ApplyOptions};
use crate::restore::{RestoreEngine, RestoreReport};
use crate::snapshot::identity::IdentityProvider;
use crate::snapshot::staging::StagingNames;
use crate::snapshot::{join_error, SnapshotBuilder, SnapshotReport};
use crate::utils::errors::Result;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Per-root operation settings
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub layout: CategoryLayout,
    pub staging: StagingNames,
    /// Extra root-relative substrings left out of snapshots
    pub exclude_patterns: Vec<String>,
    /// Where snapshots are published; the scratch subtree when unset
    pub output: Option<PathBuf>,
    pub overwrite: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            layout: CategoryLayout::default(),
            staging: StagingNames::default(),
            exclude_patterns: Vec::new(),
            output: None,
            overwrite: true,
        }
    }
}

/// Purge execution result
#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub removed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct ManagerState {
    last_classification: Option<Classification>,
}

pub struct ContainerManager {
    root: PathBuf,
    settings: ContainerSettings,
    identity: Arc<dyn IdentityProvider>,
    state: Mutex<ManagerState>,
}

impl ContainerManager {
    pub fn new(root: PathBuf, settings: ContainerSettings, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            root,
            settings,
            identity,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    /// Classify the root as it is now.
    pub async fn classify(&self) -> Result<Classification> {
        let mut state = self.state.lock().await;

        let root = self.root.clone();
        let layout = self.settings.layout.clone();
        let mut patterns = self.settings.staging.exclude_patterns(&layout);
        patterns.extend(self.settings.exclude_patterns.iter().cloned());
        if let Some(relative) = self.settings.output.as_ref().and_then(|o| o.strip_prefix(&root).ok()) {
            patterns.push(relative.to_string_lossy().into_owned());
        }
        let options = WalkOptions::with_excludes(patterns);

        let classification = tokio::task::spawn_blocking(move || classify(&root, &layout, &options))
            .await
            .map_err(join_error)??;

        state.last_classification = Some(classification.clone());
        Ok(classification)
    }

    /// Most recent classification, if one has been taken since the last restore.
    pub async fn last_classification(&self) -> Option<Classification> {
        self.state.lock().await.last_classification.clone()
    }

    /// Build a snapshot of the root. Completes before returning.
    pub async fn snapshot(&self) -> Result<SnapshotReport> {
        let _state = self.state.lock().await;

        let mut builder = SnapshotBuilder::new(
            self.root.clone(),
            self.settings.layout.clone(),
            self.settings.staging.clone(),
            self.identity.clone(),
        )
        .with_excludes(self.settings.exclude_patterns.iter().cloned());
        if let Some(output) = &self.settings.output {
            builder = builder.with_output(output.clone());
        }

        builder.build().await
    }

    /// Restore an outer archive onto the root.
    pub async fn restore(&self, archive: &Path) -> Result<RestoreReport> {
        let mut state = self.state.lock().await;
        state.last_classification = None;

        RestoreEngine::new(
            self.root.clone(),
            self.settings.layout.clone(),
            self.settings.staging.clone(),
        )
        .with_options(ApplyOptions {
            overwrite: self.settings.overwrite,
        })
        .restore(archive)
        .await
    }

    /// Remove the contents of the three category directories. The
    /// directories themselves and everything else under the root stay.
    pub async fn purge(&self) -> Result<PurgeReport> {
        let mut state = self.state.lock().await;
        state.last_classification = None;

        let root = self.root.clone();
        let layout = self.settings.layout.clone();
        let report = tokio::task::spawn_blocking(move || purge_categories(&root, &layout))
            .await
            .map_err(join_error)??;

        info!(
            "Purged {}: {} removed, {} failed",
            self.root.display(),
            report.removed,
            report.failed
        );
        Ok(report)
    }
}

fn purge_categories(root: &Path, layout: &CategoryLayout) -> Result<PurgeReport> {
    layout.validate()?;
    let mut report = PurgeReport::default();

    for category in Category::ALL {
        let dir = root.join(layout.dir_path(category));
        let children = match fs::read_dir(&dir) {
            Ok(children) => children,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!("Cannot list {}: {}", dir.display(), e);
                report.failed += 1;
                continue;
            }
        };

        for child in children {
            let path = match child {
                Ok(child) => child.path(),
                Err(e) => {
                    warn!("Cannot read entry in {}: {}", dir.display(), e);
                    report.failed += 1;
                    continue;
                }
            };
            match remove_existing(&path) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveEntry, ArchiveReader, EntryKind};
    use crate::snapshot::identity::StaticIdentity;
    use crate::utils::errors::SnapshotError;
    use std::collections::BTreeMap;
    use std::fs::File;
    use std::io::BufReader;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn manager(root: &Path, settings: ContainerSettings) -> ContainerManager {
        let identity = StaticIdentity {
            name: Some("Notes".to_string()),
            ..StaticIdentity::default()
        };
        ContainerManager::new(root.to_path_buf(), settings, Arc::new(identity))
    }

    fn populate(root: &Path) -> io::Result<()> {
        fs::create_dir_all(root.join("Documents"))?;
        fs::create_dir_all(root.join("Library/cache"))?;
        fs::create_dir_all(root.join("tmp"))?;
        fs::create_dir_all(root.join("SystemData"))?;

        let note = root.join("Documents/note.txt");
        fs::write(&note, b"0123456789")?;
        fs::set_permissions(&note, fs::Permissions::from_mode(0o644))?;
        fs::write(root.join("tmp/scratch.bin"), b"")?;
        fs::write(root.join("SystemData/keep"), b"k")?;
        std::os::unix::fs::symlink("cache", root.join("Library/current"))?;
        Ok(())
    }

    /// Everything below the three category directories, keyed by relative name.
    fn tree(root: &Path) -> Result<BTreeMap<String, ArchiveEntry>> {
        let mut entries = BTreeMap::new();
        for dir in ["Documents", "Library", "tmp"] {
            for entry in walkdir::WalkDir::new(root.join(dir)).min_depth(1) {
                let entry = entry.map_err(io::Error::from)?;
                let name = crate::archive::entry_name(root, entry.path())?;
                if name.starts_with("tmp/snapshot.tar") {
                    continue;
                }
                entries.insert(name.clone(), ArchiveEntry::from_path(entry.path(), &name)?);
            }
        }
        Ok(entries)
    }

    #[tokio::test]
    async fn test_round_trip_restores_exact_tree() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let out_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let settings = ContainerSettings {
            output: Some(out_dir.path().join("snapshot.tar")),
            ..ContainerSettings::default()
        };
        let manager = manager(temp_dir.path(), settings);

        let before = tree(temp_dir.path())?;
        let report = manager.snapshot().await?;
        manager.purge().await?;
        assert!(tree(temp_dir.path())?.is_empty());

        let restored = manager.restore(&report.archive_path).await?;
        assert_eq!(restored.skipped_entries(), 0);

        let after = tree(temp_dir.path())?;
        assert_eq!(after, before);

        let note = &after["Documents/note.txt"];
        assert_eq!(note.payload.as_deref(), Some(&b"0123456789"[..]));
        assert_eq!(note.attributes.permissions, Some(0o644));
        assert_eq!(after["Library/cache"].kind, EntryKind::Directory);
        assert_eq!(after["tmp/scratch.bin"].size(), 0);
        assert_eq!(after["Library/current"].link_target.as_deref(), Some("cache"));
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_onto_empty_root() -> Result<()> {
        let source = TempDir::new()?;
        let target = TempDir::new()?;
        let out_dir = TempDir::new()?;
        populate(source.path())?;
        let settings = ContainerSettings {
            output: Some(out_dir.path().join("snapshot.tar")),
            ..ContainerSettings::default()
        };

        let before = tree(source.path())?;
        let report = manager(source.path(), settings.clone()).snapshot().await?;

        let restored = manager(target.path(), settings)
            .restore(&report.archive_path)
            .await?;
        assert_eq!(restored.skipped_entries(), 0);

        let after = tree(target.path())?;
        assert_eq!(after, before);
        assert_eq!(
            after["Library/cache"].attributes.modified_at,
            before["Library/cache"].attributes.modified_at
        );
        assert!(!target.path().join("SystemData").exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_operations_serialize() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let out_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let settings = ContainerSettings {
            output: Some(out_dir.path().join("snapshot.tar")),
            ..ContainerSettings::default()
        };
        let manager = manager(temp_dir.path(), settings);

        let first = manager.snapshot().await?;
        let archive = temp_dir.path().join("SystemData/snapshot.tar");
        fs::copy(&first.archive_path, &archive)?;
        let before = tree(temp_dir.path())?;

        let (snapshot, restore, purge) = tokio::join!(
            manager.snapshot(),
            manager.restore(&archive),
            manager.purge()
        );
        let snapshot = snapshot?;
        assert_eq!(restore?.skipped_entries(), 0);
        assert_eq!(purge?.failed, 0);

        // Waiters are served in arrival order, so the purge ran last.
        assert!(tree(temp_dir.path())?.is_empty());

        // The snapshot taken inside the join saw a whole tree.
        manager.restore(&snapshot.archive_path).await?;
        assert_eq!(tree(temp_dir.path())?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_double_restore_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let manager = manager(temp_dir.path(), ContainerSettings::default());

        let report = manager.snapshot().await?;
        // Keep the archive outside the scratch directory the restore rewrites.
        let archive = temp_dir.path().join("SystemData/snapshot.tar");
        fs::rename(&report.archive_path, &archive)?;
        let before = tree(temp_dir.path())?;

        manager.restore(&archive).await?;
        let once = tree(temp_dir.path())?;
        manager.restore(&archive).await?;
        let twice = tree(temp_dir.path())?;

        assert_eq!(once, before);
        assert_eq!(twice, once);
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_excludes_previous_snapshot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let manager = manager(temp_dir.path(), ContainerSettings::default());

        let first = manager.snapshot().await?;
        let second = manager.snapshot().await?;
        assert_eq!(first.archive_path, second.archive_path);

        // Unpack the scratch inner archive and check it never captured the
        // first snapshot or any staging directory.
        let outer = ArchiveReader::new(BufReader::new(File::open(&second.archive_path)?));
        let mut scratch = None;
        for entry in outer {
            let entry = entry?;
            if entry.name == Category::Scratch.archive_name() {
                scratch = entry.payload;
            }
        }
        let scratch = scratch.expect("scratch archive present");
        let names: Vec<String> = ArchiveReader::new(&scratch[..])
            .map(|e| e.map(|e| e.name))
            .collect::<Result<_>>()?;
        assert_eq!(names, vec!["tmp/scratch.bin"]);

        let classification = manager.classify().await?;
        assert_eq!(classification.scratch.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_empties_categories_only() -> Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let manager = manager(temp_dir.path(), ContainerSettings::default());

        let report = manager.purge().await?;

        // note.txt, cache/, current, scratch.bin
        assert_eq!(report.removed, 4);
        assert_eq!(report.failed, 0);
        for dir in ["Documents", "Library", "tmp"] {
            let path = temp_dir.path().join(dir);
            assert!(path.is_dir());
            assert_eq!(fs::read_dir(&path)?.count(), 0);
        }
        assert_eq!(fs::read(temp_dir.path().join("SystemData/keep"))?, b"k");
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails_restore() -> Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let archive = temp_dir.path().join("SystemData/garbage.tar");
        fs::write(&archive, vec![0x5a; 2048])?;
        let manager = manager(temp_dir.path(), ContainerSettings::default());

        let err = manager.restore(&archive).await.unwrap_err();

        assert!(matches!(err, SnapshotError::RestoreFailed { .. }));
        assert_eq!(fs::read(temp_dir.path().join("Documents/note.txt"))?, b"0123456789");
        assert!(!temp_dir.path().join("tmp/.restore-staging").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_without_overwrite_keeps_live_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let settings = ContainerSettings {
            overwrite: false,
            ..ContainerSettings::default()
        };
        let manager = manager(temp_dir.path(), settings);

        let report = manager.snapshot().await?;
        let archive = temp_dir.path().join("SystemData/snapshot.tar");
        fs::rename(&report.archive_path, &archive)?;
        let note = temp_dir.path().join("Documents/note.txt");
        fs::write(&note, b"edited")?;

        let restored = manager.restore(&archive).await?;

        assert_eq!(fs::read(&note)?, b"edited");
        assert!(restored.categories.iter().any(|c| c.kept > 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_clears_cached_classification() -> Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let manager = manager(temp_dir.path(), ContainerSettings::default());

        manager.classify().await?;
        assert!(manager.last_classification().await.is_some());

        let report = manager.snapshot().await?;
        let archive = temp_dir.path().join("SystemData/snapshot.tar");
        fs::rename(&report.archive_path, &archive)?;
        manager.restore(&archive).await?;

        assert!(manager.last_classification().await.is_none());
        Ok(())
    }
}
