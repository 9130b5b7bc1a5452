//! Filesystem snapshots for artifact tracking.
//!
//! A snapshot records the set of files under an output root at one point in
//! time; diffing a pre- and post-execution snapshot yields the files a
//! persona produced. Paths are stored relative to the root in sorted order so
//! diffs are deterministic.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A point-in-time view of the files under a root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsSnapshot {
    root: PathBuf,
    files: BTreeSet<PathBuf>,
}

impl FsSnapshot {
    /// Capture all regular files under `root`, recorded relative to it.
    ///
    /// A missing root yields an empty snapshot; personas may create the
    /// output directory themselves.
    pub fn capture(root: &Path) -> std::io::Result<Self> {
        let mut files = BTreeSet::new();
        if root.exists() {
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = entry.map_err(std::io::Error::other)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .map_err(std::io::Error::other)?;
                files.insert(relative.to_path_buf());
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths in this snapshot, sorted.
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, relative: &Path) -> bool {
        self.files.contains(relative)
    }

    /// Files present in `post` but not in `self`, sorted.
    pub fn diff(&self, post: &FsSnapshot) -> Vec<PathBuf> {
        post.files.difference(&self.files).cloned().collect()
    }
}
