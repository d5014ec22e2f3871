//! Working-tree inventory.
//!
//! Walks the project root depth-first, applies the ignore rules, and
//! reports size and mtime per admitted file. Never opens file contents.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::ignore::IgnoreMatcher;
use crate::path::RelPath;
use crate::{Error, Result};

/// Size and mtime of one working-tree file, as seen during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingEntry {
    /// File size in bytes.
    pub size: u64,
    /// Last-modification time.
    pub mtime: SystemTime,
}

/// Scans the working tree under `root`.
///
/// Returns admitted files in lexicographic path order. The scan is
/// best-effort under concurrent mutation: entries that disappear mid-walk
/// are skipped with a warning. Symlinks are admitted only when their
/// resolved target lies inside the project root; anything else is skipped.
pub fn inventory(
    root: &Path,
    matcher: &IgnoreMatcher,
) -> Result<BTreeMap<RelPath, WorkingEntry>> {
    let root = root
        .canonicalize()
        .map_err(|e| Error::InvalidInput(format!("project root: {e}")))?;
    let mut files = BTreeMap::new();

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            match RelPath::from_native(entry.path(), &root) {
                Ok(rel) => !matcher.is_excluded(&rel),
                Err(_) => {
                    tracing::warn!(path = %entry.path().display(), "skipping unrepresentable path");
                    false
                }
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // Raced with a concurrent delete, or unreadable subtree.
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.depth() == 0 || entry.file_type().is_dir() {
            continue;
        }

        let path = entry.path();
        if entry.file_type().is_symlink() && !resolves_inside(path, &root) {
            tracing::warn!(path = %path.display(), "skipping symlink leaving the project root");
            continue;
        }

        // Stat through the link; a file deleted since the readdir is skipped.
        let meta = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "file disappeared during scan");
                continue;
            }
        };

        let rel = RelPath::from_native(path, &root)?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.insert(
            rel,
            WorkingEntry {
                size: meta.len(),
                mtime,
            },
        );
    }

    Ok(files)
}

/// Whether a symlink's resolved target stays inside `root`.
fn resolves_inside(path: &Path, root: &Path) -> bool {
    path.canonicalize()
        .is_ok_and(|target| target.starts_with(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn lists_files_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/model.py", b"m");
        write(dir.path(), "data/x.csv", b"x");
        write(dir.path(), "README.md", b"r");

        let matcher = IgnoreMatcher::defaults_only().unwrap();
        let inv = inventory(dir.path(), &matcher).unwrap();
        let paths: Vec<&str> = inv.keys().map(RelPath::as_str).collect();
        assert_eq!(paths, ["README.md", "data/x.csv", "src/model.py"]);
        assert_eq!(inv[&RelPath::new("data/x.csv").unwrap()].size, 1);
    }

    #[test]
    fn ignores_metadata_and_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".modelops-bundle/state.json", b"{}");
        write(dir.path(), ".git/HEAD", b"ref");
        write(dir.path(), "kept.txt", b"k");

        let matcher = IgnoreMatcher::defaults_only().unwrap();
        let inv = inventory(dir.path(), &matcher).unwrap();
        assert_eq!(inv.len(), 1);
        assert!(inv.contains_key(&RelPath::new("kept.txt").unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn skips_symlink_leaving_root() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "inside.txt", b"i");
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("leak"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path().join("inside.txt"), dir.path().join("alias"))
            .unwrap();

        let matcher = IgnoreMatcher::defaults_only().unwrap();
        let inv = inventory(dir.path(), &matcher).unwrap();
        assert!(inv.contains_key(&RelPath::new("inside.txt").unwrap()));
        assert!(inv.contains_key(&RelPath::new("alias").unwrap()));
        assert!(!inv.contains_key(&RelPath::new("leak").unwrap()));
    }
}
