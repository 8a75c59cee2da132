//! Category partition of a container root.

use crate::utils::errors::{Result, SnapshotError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// The three backed-up subtrees of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Documents,
    Library,
    Scratch,
}

impl Category {
    /// Every category, in the fixed order archives are written and restored.
    pub const ALL: [Category; 3] = [Category::Documents, Category::Library, Category::Scratch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Documents => "documents",
            Category::Library => "library",
            Category::Scratch => "scratch",
        }
    }

    /// Member name of this category's inner archive in the outer archive
    pub fn archive_name(&self) -> &'static str {
        match self {
            Category::Documents => "documents.tar",
            Category::Library => "library.tar",
            Category::Scratch => "scratch.tar",
        }
    }

    pub fn from_archive_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.archive_name() == name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root-relative directory names of the three category subtrees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryLayout {
    pub documents: String,
    pub library: String,
    pub scratch: String,
}

impl Default for CategoryLayout {
    fn default() -> Self {
        Self {
            documents: "Documents".to_string(),
            library: "Library".to_string(),
            scratch: "tmp".to_string(),
        }
    }
}

impl CategoryLayout {
    pub fn dir_name(&self, category: Category) -> &str {
        match category {
            Category::Documents => &self.documents,
            Category::Library => &self.library,
            Category::Scratch => &self.scratch,
        }
    }

    pub fn dir_path(&self, category: Category) -> &Path {
        Path::new(self.dir_name(category))
    }

    /// Names must be plain relative paths and no subtree may contain another.
    pub fn validate(&self) -> Result<()> {
        for category in Category::ALL {
            let dir = self.dir_path(category);
            let plain = dir.components().count() > 0
                && dir.components().all(|c| matches!(c, Component::Normal(_)));
            if !plain {
                return Err(SnapshotError::Config(format!(
                    "{} directory '{}' must be a non-empty relative path",
                    category,
                    self.dir_name(category)
                )));
            }
        }

        for (i, a) in Category::ALL.iter().enumerate() {
            for b in &Category::ALL[i + 1..] {
                let (pa, pb) = (self.dir_path(*a), self.dir_path(*b));
                if pa.starts_with(pb) || pb.starts_with(pa) {
                    return Err(SnapshotError::Config(format!(
                        "{} directory '{}' overlaps {} directory '{}'",
                        a,
                        self.dir_name(*a),
                        b,
                        self.dir_name(*b)
                    )));
                }
            }
        }

        Ok(())
    }

    /// Category of a root-relative path. The category directory itself is
    /// not a member; only what lies below it.
    pub fn classify(&self, relative: &Path) -> Option<Category> {
        Category::ALL.into_iter().find(|&category| {
            let dir = self.dir_path(category);
            relative.starts_with(dir) && relative != dir
        })
    }
}

/// Root-relative paths grouped by category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub documents: BTreeSet<PathBuf>,
    pub library: BTreeSet<PathBuf>,
    pub scratch: BTreeSet<PathBuf>,
}

impl Classification {
    /// Partition `paths`, dropping any that belong to no category.
    pub fn from_paths<I>(paths: I, layout: &CategoryLayout) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut classification = Self::default();
        for path in paths {
            if let Some(category) = layout.classify(&path) {
                classification.get_mut(category).insert(path);
            }
        }
        classification
    }

    pub fn get(&self, category: Category) -> &BTreeSet<PathBuf> {
        match category {
            Category::Documents => &self.documents,
            Category::Library => &self.library,
            Category::Scratch => &self.scratch,
        }
    }

    pub fn get_mut(&mut self, category: Category) -> &mut BTreeSet<PathBuf> {
        match category {
            Category::Documents => &mut self.documents,
            Category::Library => &mut self.library,
            Category::Scratch => &mut self.scratch,
        }
    }

    pub fn total(&self) -> usize {
        self.documents.len() + self.library.len() + self.scratch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_prefix() {
        let layout = CategoryLayout::default();

        assert_eq!(layout.classify(Path::new("Documents/a.txt")), Some(Category::Documents));
        assert_eq!(layout.classify(Path::new("Library/Caches/x")), Some(Category::Library));
        assert_eq!(layout.classify(Path::new("tmp/scratch.bin")), Some(Category::Scratch));

        assert_eq!(layout.classify(Path::new("Documents")), None);
        assert_eq!(layout.classify(Path::new("SystemData/x")), None);
        // Component-wise, not string prefix.
        assert_eq!(layout.classify(Path::new("tmpfiles/x")), None);
        assert_eq!(layout.classify(Path::new("Documents2/x")), None);
    }

    #[test]
    fn test_partition_never_double_counts() {
        let layout = CategoryLayout::default();
        let paths = [
            "Documents/a",
            "Documents/b/c",
            "Library/Preferences/p.plist",
            "tmp/t",
            "StoreKit/receipt",
            "Documents",
        ]
        .into_iter()
        .map(PathBuf::from);

        let classification = Classification::from_paths(paths, &layout);

        assert_eq!(classification.documents.len(), 2);
        assert_eq!(classification.library.len(), 1);
        assert_eq!(classification.scratch.len(), 1);
        assert_eq!(classification.total(), 4);
        for category in Category::ALL {
            for other in Category::ALL.into_iter().filter(|c| *c != category) {
                assert!(classification.get(category).is_disjoint(classification.get(other)));
            }
        }
    }

    #[test]
    fn test_default_layout_is_valid() {
        assert!(CategoryLayout::default().validate().is_ok());
    }

    #[test]
    fn test_overlapping_layout_rejected() {
        let layout = CategoryLayout {
            documents: "Library/Documents".to_string(),
            ..CategoryLayout::default()
        };
        assert!(matches!(layout.validate(), Err(SnapshotError::Config(_))));

        let same = CategoryLayout {
            scratch: "Documents".to_string(),
            ..CategoryLayout::default()
        };
        assert!(matches!(same.validate(), Err(SnapshotError::Config(_))));
    }

    #[test]
    fn test_non_relative_layout_rejected() {
        for bad in ["", "/tmp", "../tmp", "tmp/../Library"] {
            let layout = CategoryLayout {
                scratch: bad.to_string(),
                ..CategoryLayout::default()
            };
            assert!(layout.validate().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_archive_names_round_trip() {
        for category in Category::ALL {
            assert_eq!(Category::from_archive_name(category.archive_name()), Some(category));
        }
        assert_eq!(Category::from_archive_name("manifest.json"), None);
    }
}
