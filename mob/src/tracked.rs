//! The persistent set of paths that belong to the bundle.
//!
//! Stored as `.modelops-bundle/tracked`: one POSIX path per line, sorted.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;

use crate::fsio::atomic_write;
use crate::path::RelPath;
use crate::Result;

/// Ordered, de-duplicated set of tracked project-relative paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedSet {
    paths: BTreeSet<RelPath>,
}

impl TrackedSet {
    /// Loads the tracked file; an absent file yields the empty set.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = BTreeSet::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            paths.insert(RelPath::new(line)?);
        }
        Ok(Self { paths })
    }

    /// Writes the set atomically, one path per line, sorted.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for p in &self.paths {
            out.push_str(p.as_str());
            out.push('\n');
        }
        atomic_write(path, out.as_bytes())?;
        Ok(())
    }

    /// Adds a path; returns `false` if it was already tracked.
    pub fn add(&mut self, path: RelPath) -> bool {
        self.paths.insert(path)
    }

    /// Removes a path; returns `false` if it was not tracked.
    pub fn remove(&mut self, path: &RelPath) -> bool {
        self.paths.remove(path)
    }

    /// Membership test.
    pub fn contains(&self, path: &RelPath) -> bool {
        self.paths.contains(path)
    }

    /// Replaces the whole set (pull mirror semantics).
    pub fn replace_with(&mut self, paths: impl IntoIterator<Item = RelPath>) {
        self.paths = paths.into_iter().collect();
    }

    /// Iterates in lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = &RelPath> {
        self.paths.iter()
    }

    /// Number of tracked paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// `true` when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl<'a> IntoIterator for &'a TrackedSet {
    type Item = &'a RelPath;
    type IntoIter = std::collections::btree_set::Iter<'a, RelPath>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.iter()
    }
}
