//! Content snapshot of the tracked file set.
//!
//! Hashes every tracked path that exists on disk, in parallel with a
//! bounded number of in-flight hashes. CPU-bound hashing runs on the
//! blocking pool.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::digest::Digest;
use crate::path::RelPath;
use crate::tracked::TrackedSet;
use crate::{Error, Result};

/// Digest and size of one tracked file at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Content digest.
    pub digest: Digest,
    /// File size in bytes.
    pub size: u64,
}

/// The hashed state of the tracked set.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Tracked files that exist on disk, with digest and size.
    pub files: BTreeMap<RelPath, SnapshotEntry>,
    /// Tracked paths absent from disk.
    pub missing: Vec<RelPath>,
}

impl Snapshot {
    /// Path → digest projection, the shape the diff engine consumes.
    pub fn digest_map(&self) -> BTreeMap<RelPath, Digest> {
        self.files
            .iter()
            .map(|(path, entry)| (path.clone(), entry.digest.clone()))
            .collect()
    }
}

/// Default hash concurrency: the logical CPU count.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

/// Hashes every tracked file under `root`.
///
/// Fails fast on the first unreadable file; a file that is simply absent
/// (or disappears between stat and hash) is reported in
/// [`Snapshot::missing`] instead.
pub async fn snapshot(root: &Path, tracked: &TrackedSet, concurrency: usize) -> Result<Snapshot> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks: JoinSet<Result<(RelPath, Option<SnapshotEntry>)>> = JoinSet::new();

    for path in tracked {
        let native = path.to_native(root);
        let path = path.clone();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))?;
            let hashed = tokio::task::spawn_blocking(move || hash_one(&native))
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))??;
            Ok((path, hashed))
        });
    }

    let mut out = Snapshot::default();
    while let Some(joined) = tasks.join_next().await {
        let (path, entry) = joined.map_err(|e| Error::Io(io::Error::other(e)))??;
        match entry {
            Some(entry) => {
                out.files.insert(path, entry);
            }
            None => out.missing.push(path),
        }
    }
    out.missing.sort();
    Ok(out)
}

/// Hashes one file; `Ok(None)` when the file is not present.
fn hash_one(native: &Path) -> Result<Option<SnapshotEntry>> {
    let meta = match std::fs::metadata(native) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match Digest::of_file(native) {
        Ok(digest) => Ok(Some(SnapshotEntry {
            digest,
            size: meta.len(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_tracked_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/model.py"), b"print('hi')").unwrap();

        let mut tracked = TrackedSet::default();
        tracked.add(RelPath::new("src/model.py").unwrap());
        tracked.add(RelPath::new("gone.txt").unwrap());

        let snap = snapshot(dir.path(), &tracked, 2).await.unwrap();
        assert_eq!(snap.files.len(), 1);
        assert_eq!(snap.missing, vec![RelPath::new("gone.txt").unwrap()]);

        let entry = &snap.files[&RelPath::new("src/model.py").unwrap()];
        assert_eq!(entry.size, 11);
        assert_eq!(entry.digest, Digest::of_bytes(b"print('hi')"));
    }

    #[tokio::test]
    async fn empty_tracked_set_is_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(dir.path(), &TrackedSet::default(), 1).await.unwrap();
        assert!(snap.files.is_empty());
        assert!(snap.missing.is_empty());
    }
}
