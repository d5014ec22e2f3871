//! Disk-backed content-addressable store for bundle objects.
//!
//! Every object is keyed by its SHA-256 digest and becomes visible only
//! after a verified, atomic promotion. Concurrent producers of the same
//! digest (including other processes sharing the cache) are serialized by
//! an OS advisory lock per digest.
//!
//! # Layout
//!
//! ```text
//! {root}/
//!   objects/sha256/{d0d1}/{d2d3}/{hex}        — verified immutable objects
//!   objects/sha256/{d0d1}/{d2d3}/{hex}.lock   — per-digest advisory locks
//!   objects/sha256/{d0d1}/{d2d3}/{hex}.tmp    — in-flight downloads
//! ```
//!
//! A crash mid-download leaves at worst a `.tmp` file; it is swept on the
//! next [`LocalCas::ensure_present`] call for that digest or by
//! [`LocalCas::sweep_temp`]. Promoted objects are always complete and
//! hash to their name.

use std::fs;
use std::future::Future;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs4::FileExt;
use sha2::{Digest as _, Sha256};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type accepted from fetch callbacks.
pub type FetchError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from content-addressable store operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The digest string is not `sha256:` followed by 64 lowercase hex chars.
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    /// Downloaded content did not hash to the declared digest.
    #[error("content for {digest} hashed to {actual}")]
    DigestMismatch {
        /// Digest the content was declared under.
        digest: String,
        /// Digest the downloaded bytes actually hash to.
        actual: String,
    },

    /// The requested object is not in the store.
    #[error("object not in store: {0}")]
    NotFound(String),

    /// A path inside the store resolved to a symlink.
    #[error("refusing symlink in store: {0}")]
    Symlink(PathBuf),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The fetch callback failed before any verification could run.
    #[error("fetch: {0}")]
    Fetch(#[source] FetchError),
}

/// How [`LocalCas::materialize`] places an object into the working tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Try reflink, then hardlink, then copy.
    #[default]
    Auto,
    /// Copy-on-write clone only (fails where unsupported).
    Reflink,
    /// Hard link only.
    Hardlink,
    /// Byte copy only.
    Copy,
}

/// Content-addressable object store rooted at a single directory.
///
/// The store may be shared across projects and processes; all mutations
/// are mediated by per-digest advisory file locks.
#[derive(Debug, Clone)]
pub struct LocalCas {
    /// Directory containing `objects/sha256/`.
    root: PathBuf,
}

impl LocalCas {
    /// Opens (or creates) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects").join("sha256"))?;
        Ok(Self { root })
    }

    /// Returns the store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the final on-disk path for a digest.
    ///
    /// The digest is validated strictly before any path is constructed.
    pub fn object_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = validate_digest(digest)?;
        Ok(self
            .root
            .join("objects")
            .join("sha256")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex))
    }

    /// Returns `true` if the object is present (no content verification).
    pub fn has(&self, digest: &str) -> Result<bool> {
        Ok(self.object_path(digest)?.is_file())
    }

    /// Ensures the object for `digest` is present and verified.
    ///
    /// If the object is absent, `fetch` is invoked with a temporary path to
    /// write the bytes to. The temp file is hashed; on match it is fsynced
    /// and atomically renamed into place. On any failure the temp file is
    /// unlinked before the per-digest lock is released, so the store never
    /// holds a partial or unverified object.
    ///
    /// Concurrent callers for the same digest serialize on an advisory file
    /// lock; at most one fetch results in a promoted object, and late
    /// arrivals observe the promoted object after lock acquisition.
    pub async fn ensure_present<F, Fut>(&self, digest: &str, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = std::result::Result<(), FetchError>>,
    {
        let final_path = self.object_path(digest)?;
        if final_path.is_file() {
            return Ok(final_path);
        }

        let shard_dir = final_path.parent().ok_or_else(|| {
            Error::Io(io::Error::other("object path has no parent directory"))
        })?;
        fs::create_dir_all(shard_dir)?;

        let _lock = DigestLock::acquire(lock_path(&final_path)).await?;

        // Another producer may have promoted the object while we waited.
        if final_path.is_file() {
            return Ok(final_path);
        }

        let tmp = tmp_path(&final_path);
        if tmp.exists() {
            // Stale leftover from a crashed producer; we hold the lock.
            fs::remove_file(&tmp)?;
        }

        let outcome = self.fetch_and_promote(digest, &final_path, &tmp, fetch).await;
        if outcome.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        outcome.map(|()| final_path)
    }

    /// Downloads into `tmp`, verifies, and promotes to `final_path`.
    ///
    /// Caller holds the per-digest lock and cleans up `tmp` on error.
    async fn fetch_and_promote<F, Fut>(
        &self,
        digest: &str,
        final_path: &Path,
        tmp: &Path,
        fetch: F,
    ) -> Result<()>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = std::result::Result<(), FetchError>>,
    {
        fetch(tmp.to_path_buf()).await.map_err(Error::Fetch)?;

        reject_symlink(tmp)?;
        let actual = {
            let path = tmp.to_path_buf();
            run_blocking(move || hash_file(&path)).await??
        };
        if actual != digest {
            return Err(Error::DigestMismatch {
                digest: digest.to_owned(),
                actual,
            });
        }

        {
            let tmp = tmp.to_path_buf();
            let final_path = final_path.to_path_buf();
            run_blocking(move || -> io::Result<()> {
                fs::File::open(&tmp)?.sync_all()?;
                fs::rename(&tmp, &final_path)?;
                if let Some(dir) = final_path.parent() {
                    fs::File::open(dir)?.sync_all()?;
                }
                Ok(())
            })
            .await??;
        }

        tracing::debug!(digest, "promoted object");
        Ok(())
    }

    /// Copies or links a stored object to `dest`.
    ///
    /// All modes write to `<dest>.partial` first and rename atomically, so
    /// readers of `dest` never observe partial content. The partial file is
    /// removed on any failure.
    pub fn materialize(&self, digest: &str, dest: &Path, mode: LinkMode) -> Result<()> {
        let src = self.object_path(digest)?;
        if !src.is_file() {
            return Err(Error::NotFound(digest.to_owned()));
        }
        reject_symlink(&src)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = partial_path(dest);
        if partial.exists() {
            fs::remove_file(&partial)?;
        }

        let outcome = place(&src, &partial, mode).and_then(|()| {
            fs::File::open(&partial)?.sync_all()?;
            fs::rename(&partial, dest)?;
            Ok(())
        });
        if outcome.is_err() {
            let _ = fs::remove_file(&partial);
        }
        outcome
    }

    /// Removes orphaned `.tmp` files older than `max_age`.
    ///
    /// Returns the number of files removed. In-flight downloads are
    /// protected by their age: a live producer refreshes its temp file's
    /// mtime continuously by writing to it.
    pub fn sweep_temp(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for shard in read_subdirs(&self.root.join("objects").join("sha256"))? {
            for sub in read_subdirs(&shard)? {
                for entry in fs::read_dir(&sub)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if !name.ends_with(".tmp") {
                        continue;
                    }
                    let Ok(meta) = entry.metadata() else { continue };
                    let old_enough = meta
                        .modified()
                        .ok()
                        .and_then(|m| now.duration_since(m).ok())
                        .is_some_and(|age| age >= max_age);
                    if old_enough && fs::remove_file(entry.path()).is_ok() {
                        tracing::debug!(path = %entry.path().display(), "swept stale temp file");
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Held per-digest advisory lock; released (and unlocked by the OS on
/// crash) when dropped. The lock file itself is left in place.
#[derive(Debug)]
struct DigestLock {
    file: fs::File,
}

impl DigestLock {
    /// Opens the lock file and blocks until the exclusive lock is held.
    async fn acquire(path: PathBuf) -> Result<Self> {
        let file = run_blocking(move || -> io::Result<fs::File> {
            let file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await??;
        Ok(Self { file })
    }
}

impl Drop for DigestLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Validates `sha256:` + 64 lowercase hex and returns the hex part.
fn validate_digest(digest: &str) -> Result<String> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| Error::InvalidDigest(digest.to_owned()))?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(Error::InvalidDigest(digest.to_owned()));
    }
    Ok(hex.to_owned())
}

/// Streams a file through SHA-256 and returns `sha256:{hex}`.
fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Runs a blocking closure on the tokio blocking pool.
async fn run_blocking<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)
}

/// Fails if `path` is a symlink.
fn reject_symlink(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path)?.file_type().is_symlink() {
        return Err(Error::Symlink(path.to_path_buf()));
    }
    Ok(())
}

/// Places `src` at `dst` according to the link mode.
fn place(src: &Path, dst: &Path, mode: LinkMode) -> Result<()> {
    match mode {
        LinkMode::Reflink => reflink_copy::reflink(src, dst).map_err(Error::Io),
        LinkMode::Hardlink => fs::hard_link(src, dst).map_err(Error::Io),
        LinkMode::Copy => fs::copy(src, dst).map(|_| ()).map_err(Error::Io),
        LinkMode::Auto => {
            if reflink_copy::reflink(src, dst).is_ok() {
                return Ok(());
            }
            if fs::hard_link(src, dst).is_ok() {
                return Ok(());
            }
            fs::copy(src, dst).map(|_| ()).map_err(Error::Io)
        }
    }
}

/// `{final}.lock`
fn lock_path(final_path: &Path) -> PathBuf {
    append_ext(final_path, "lock")
}

/// `{final}.tmp`
fn tmp_path(final_path: &Path) -> PathBuf {
    append_ext(final_path, "tmp")
}

/// `{dest}.partial`
fn partial_path(dest: &Path) -> PathBuf {
    append_ext(dest, "partial")
}

/// Appends `.{ext}` to the full file name (digest hex contains no dots,
/// so `with_extension` would be equivalent, but this is explicit).
fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

/// Lists subdirectories of `dir`; an absent dir yields an empty list.
fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const HELLO: &[u8] = b"hello world";
    // sha256 of "hello world"
    const HELLO_DIGEST: &str =
        "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn store() -> (tempfile::TempDir, LocalCas) {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::open(dir.path().join("cache")).unwrap();
        (dir, cas)
    }

    #[tokio::test]
    async fn fetch_verify_promote() {
        let (_dir, cas) = store();
        let path = cas
            .ensure_present(HELLO_DIGEST, |tmp| async move {
                tokio::fs::write(&tmp, HELLO).await?;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), HELLO);
        assert!(cas.has(HELLO_DIGEST).unwrap());
    }

    #[tokio::test]
    async fn digest_mismatch_unlinks_temp() {
        let (_dir, cas) = store();
        let err = cas
            .ensure_present(HELLO_DIGEST, |tmp| async move {
                tokio::fs::write(&tmp, b"corrupted").await?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(!cas.has(HELLO_DIGEST).unwrap());

        let final_path = cas.object_path(HELLO_DIGEST).unwrap();
        assert!(!tmp_path(&final_path).exists());
    }

    #[tokio::test]
    async fn cached_object_skips_fetch() {
        let (_dir, cas) = store();
        cas.ensure_present(HELLO_DIGEST, |tmp| async move {
            tokio::fs::write(&tmp, HELLO).await?;
            Ok(())
        })
        .await
        .unwrap();

        let called = Arc::new(AtomicUsize::new(0));
        let called2 = Arc::clone(&called);
        cas.ensure_present(HELLO_DIGEST, |_tmp| async move {
            called2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_fetch_once() {
        let (_dir, cas) = store();
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cas = cas.clone();
            let fetches = Arc::clone(&fetches);
            tasks.push(tokio::spawn(async move {
                cas.ensure_present(HELLO_DIGEST, |tmp| async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    tokio::fs::write(&tmp, HELLO).await?;
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_error_leaves_no_residue() {
        let (_dir, cas) = store();
        let err = cas
            .ensure_present(HELLO_DIGEST, |_tmp| async move {
                Err::<(), FetchError>("network down".into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
        assert!(!cas.has(HELLO_DIGEST).unwrap());
    }

    #[tokio::test]
    async fn stale_temp_is_replaced() {
        let (_dir, cas) = store();
        let final_path = cas.object_path(HELLO_DIGEST).unwrap();
        fs::create_dir_all(final_path.parent().unwrap()).unwrap();
        fs::write(tmp_path(&final_path), b"leftover from a crash").unwrap();

        let path = cas
            .ensure_present(HELLO_DIGEST, |tmp| async move {
                tokio::fs::write(&tmp, HELLO).await?;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), HELLO);
    }

    #[tokio::test]
    async fn materialize_modes() {
        let (dir, cas) = store();
        cas.ensure_present(HELLO_DIGEST, |tmp| async move {
            tokio::fs::write(&tmp, HELLO).await?;
            Ok(())
        })
        .await
        .unwrap();

        for (i, mode) in [LinkMode::Auto, LinkMode::Hardlink, LinkMode::Copy]
            .into_iter()
            .enumerate()
        {
            let dest = dir.path().join(format!("out/file-{i}"));
            cas.materialize(HELLO_DIGEST, &dest, mode).unwrap();
            assert_eq!(fs::read(&dest).unwrap(), HELLO);
            assert!(!partial_path(&dest).exists());
        }
    }

    #[test]
    fn materialize_missing_object() {
        let (dir, cas) = store();
        let err = cas
            .materialize(HELLO_DIGEST, &dir.path().join("out"), LinkMode::Copy)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn digest_validation() {
        let (_dir, cas) = store();
        for bad in [
            "sha256:short",
            "md5:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            "sha256:B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9",
            "sha256:../../../../etc/passwd",
        ] {
            assert!(cas.object_path(bad).is_err(), "accepted {bad}");
        }
    }

    #[tokio::test]
    async fn sweep_removes_old_temp_only() {
        let (_dir, cas) = store();
        let final_path = cas.object_path(HELLO_DIGEST).unwrap();
        fs::create_dir_all(final_path.parent().unwrap()).unwrap();
        fs::write(tmp_path(&final_path), b"orphan").unwrap();

        // Zero max age: everything qualifies.
        assert_eq!(cas.sweep_temp(Duration::ZERO).unwrap(), 1);
        // A fresh temp survives a one-hour threshold.
        fs::write(tmp_path(&final_path), b"orphan").unwrap();
        assert_eq!(cas.sweep_temp(Duration::from_secs(3600)).unwrap(), 0);
    }
}
