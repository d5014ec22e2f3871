//! Ownership of the `.modelops-bundle/` metadata directory.
//!
//! ```text
//! {project}/
//!   .modelops-bundle/
//!     config.yaml   — registry ref + storage policy
//!     tracked       — one POSIX path per line, sorted
//!     state.json    — last-sync record (atomically replaced)
//!     ignore        — optional user ignore rules
//!     .lock         — advisory project lock
//! }
//! ```
//!
//! Only one command at a time may mutate a project; concurrent
//! invocations fail fast with `ProjectBusy`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::config::BundleConfig;
use crate::ignore::IgnoreMatcher;
use crate::path::RelPath;
use crate::state::SyncState;
use crate::tracked::TrackedSet;
use crate::{Error, Result};

/// Name of the project metadata directory.
pub const META_DIR: &str = ".modelops-bundle";

/// A bundle project rooted at a working-tree directory.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
}

impl Project {
    /// Initializes a new project at `root`. Fails if one already exists.
    pub fn init(root: impl AsRef<Path>, registry_ref: &str) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;
        let meta = root.join(META_DIR);
        if meta.join("config.yaml").exists() {
            return Err(Error::InvalidInput(format!(
                "{} is already a bundle project",
                root.display()
            )));
        }
        fs::create_dir_all(&meta)?;

        let project = Self { root };
        let config = BundleConfig::new(registry_ref);
        config.validate()?;
        config.save(&project.config_path())?;
        TrackedSet::default().save(&project.tracked_path())?;
        Ok(project)
    }

    /// Opens the project whose metadata directory contains `root`, walking
    /// up from `start` like version control does.
    pub fn discover(start: impl AsRef<Path>) -> Result<Self> {
        let start = start.as_ref().canonicalize()?;
        let mut dir = start.as_path();
        loop {
            if dir.join(META_DIR).join("config.yaml").is_file() {
                return Ok(Self {
                    root: dir.to_path_buf(),
                });
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => {
                    return Err(Error::InvalidInput(format!(
                        "no bundle project found above {}",
                        start.display()
                    )));
                }
            }
        }
    }

    /// Opens a project rooted exactly at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;
        if !root.join(META_DIR).join("config.yaml").is_file() {
            return Err(Error::InvalidInput(format!(
                "{} is not a bundle project",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// The working-tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The metadata directory.
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    /// Path of `config.yaml`.
    pub fn config_path(&self) -> PathBuf {
        self.meta_dir().join("config.yaml")
    }

    /// Path of the tracked-paths file.
    pub fn tracked_path(&self) -> PathBuf {
        self.meta_dir().join("tracked")
    }

    /// Path of the sync-state file.
    pub fn state_path(&self) -> PathBuf {
        self.meta_dir().join("state.json")
    }

    /// Path of the optional user ignore file.
    pub fn ignore_path(&self) -> PathBuf {
        self.meta_dir().join("ignore")
    }

    /// Loads the project config.
    pub fn config(&self) -> Result<BundleConfig> {
        BundleConfig::load(&self.config_path())
    }

    /// Loads the tracked set.
    pub fn tracked(&self) -> Result<TrackedSet> {
        TrackedSet::load(&self.tracked_path())
    }

    /// Loads the sync state.
    pub fn sync_state(&self) -> Result<SyncState> {
        SyncState::load(&self.state_path())
    }

    /// Compiles the ignore matcher: user rules when the ignore file
    /// exists, otherwise the built-in defaults.
    pub fn ignore_matcher(&self) -> Result<IgnoreMatcher> {
        match fs::read_to_string(self.ignore_path()) {
            Ok(content) => IgnoreMatcher::from_lines(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => IgnoreMatcher::defaults_only(),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquires the project lock, failing fast if another process holds it.
    pub fn lock(&self) -> Result<ProjectLock> {
        let path = self.meta_dir().join(".lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(ProjectLock { file }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::ProjectBusy),
            Err(e) => Err(e.into()),
        }
    }

    /// Starts tracking paths. Without `force`, paths the ignore rules
    /// exclude are skipped and reported.
    pub fn track(&self, paths: Vec<RelPath>, force: bool) -> Result<TrackOutcome> {
        let matcher = self.ignore_matcher()?;
        let mut tracked = self.tracked()?;
        let mut outcome = TrackOutcome::default();

        for path in paths {
            if !path.to_native(&self.root).is_file() {
                return Err(Error::InvalidInput(format!("{path} does not exist")));
            }
            if !force && matcher.is_excluded(&path) {
                outcome.skipped.push(path);
                continue;
            }
            if tracked.add(path.clone()) {
                outcome.added.push(path);
            } else {
                outcome.already.push(path);
            }
        }

        tracked.save(&self.tracked_path())?;
        Ok(outcome)
    }

    /// Stops tracking paths; unknown paths are reported, not errors.
    pub fn untrack(&self, paths: Vec<RelPath>) -> Result<TrackOutcome> {
        let mut tracked = self.tracked()?;
        let mut outcome = TrackOutcome::default();
        for path in paths {
            if tracked.remove(&path) {
                outcome.added.push(path);
            } else {
                outcome.skipped.push(path);
            }
        }
        tracked.save(&self.tracked_path())?;
        Ok(outcome)
    }

    /// Resolves a user-supplied path (absolute or CWD-relative) into the
    /// project-relative form.
    pub fn rel_path(&self, raw: &str) -> Result<RelPath> {
        let candidate = Path::new(raw);
        if candidate.is_absolute() {
            return RelPath::from_native(&candidate.canonicalize()?, &self.root);
        }
        // Try as project-relative first, then relative to the CWD.
        if let Ok(rel) = RelPath::new(raw) {
            if rel.to_native(&self.root).exists() {
                return Ok(rel);
            }
        }
        let cwd = std::env::current_dir()?;
        RelPath::from_native(&cwd.join(candidate).canonicalize()?, &self.root)
    }
}

/// Paths affected by a track/untrack call.
#[derive(Debug, Clone, Default)]
pub struct TrackOutcome {
    /// Paths the operation changed.
    pub added: Vec<RelPath>,
    /// Paths skipped (ignored on track, unknown on untrack).
    pub skipped: Vec<RelPath>,
    /// Paths that were already in the requested state.
    pub already: Vec<RelPath>,
}

/// Held project lock; released on drop (or by the OS on crash).
#[derive(Debug)]
pub struct ProjectLock {
    file: fs::File,
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_discover_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        Project::init(dir.path(), "localhost:5555/p").unwrap();

        let sub = dir.path().join("src/deep");
        fs::create_dir_all(&sub).unwrap();
        let project = Project::discover(&sub).unwrap();
        assert_eq!(project.config().unwrap().registry_ref, "localhost:5555/p");
        assert!(project.tracked().unwrap().is_empty());
        assert_eq!(project.sync_state().unwrap(), SyncState::default());
    }

    #[test]
    fn double_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        Project::init(dir.path(), "r/p").unwrap();
        assert!(Project::init(dir.path(), "r/p").is_err());
    }

    #[test]
    fn lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::init(dir.path(), "r/p").unwrap();
        let held = project.lock().unwrap();
        assert!(matches!(project.lock(), Err(Error::ProjectBusy)));
        drop(held);
        project.lock().unwrap();
    }

    #[test]
    fn track_respects_ignores_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::init(dir.path(), "r/p").unwrap();
        fs::write(dir.path().join("model.py"), b"m").unwrap();
        fs::write(dir.path().join("scratch.swp"), b"s").unwrap();

        let outcome = project
            .track(
                vec![
                    RelPath::new("model.py").unwrap(),
                    RelPath::new("scratch.swp").unwrap(),
                ],
                false,
            )
            .unwrap();
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.skipped.len(), 1);

        let outcome = project
            .track(vec![RelPath::new("scratch.swp").unwrap()], true)
            .unwrap();
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(project.tracked().unwrap().len(), 2);
    }

    #[test]
    fn track_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::init(dir.path(), "r/p").unwrap();
        assert!(
            project
                .track(vec![RelPath::new("absent.txt").unwrap()], false)
                .is_err()
        );
    }
}
