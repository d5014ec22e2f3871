//! Record of the last successful sync with the registry.
//!
//! `last_synced_files` is the base of every three-way diff: the file set
//! that existed on the server when we last pushed or pulled. The digests
//! of the last push and pull double as the expected tag position for the
//! next push's race check. Written atomically, and only after all content
//! I/O of a sync has succeeded.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::fsio::atomic_write;
use crate::path::RelPath;
use crate::Result;

/// Persistent sync record (`.modelops-bundle/state.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncState {
    /// Manifest digest of our last successful push, updated to the remote
    /// digest on pull so it always names the tag position we last saw.
    pub last_push_digest: Option<Digest>,
    /// Manifest digest of the last successful pull.
    pub last_pull_digest: Option<Digest>,
    /// Server-side file set at the time of the last sync.
    #[serde(default)]
    pub last_synced_files: BTreeMap<RelPath, Digest>,
}

impl SyncState {
    /// Loads the state file; an absent file yields the pristine state.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Writes the state atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &raw)?;
        Ok(())
    }

    /// The digest we last saw the tag at, from either direction.
    pub fn last_known_digest(&self) -> Option<&Digest> {
        self.last_push_digest.as_ref().or(self.last_pull_digest.as_ref())
    }

    /// Records a successful push.
    pub fn record_push(&mut self, manifest_digest: Digest, files: BTreeMap<RelPath, Digest>) {
        self.last_push_digest = Some(manifest_digest);
        self.last_synced_files = files;
    }

    /// Records a successful pull. The remote digest also becomes the
    /// expected tag position for the next push's race check.
    pub fn record_pull(&mut self, remote_digest: Digest, files: BTreeMap<RelPath, Digest>) {
        self.last_pull_digest = Some(remote_digest.clone());
        self.last_push_digest = Some(remote_digest);
        self.last_synced_files = files;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(marker: u8) -> Digest {
        Digest::of_bytes(&[marker])
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = SyncState::default();
        state.record_push(
            digest(1),
            BTreeMap::from([(RelPath::new("a.txt").unwrap(), digest(2))]),
        );
        state.save(&path).unwrap();
        assert_eq!(SyncState::load(&path).unwrap(), state);
    }

    #[test]
    fn absent_file_is_pristine() {
        let dir = tempfile::tempdir().unwrap();
        let state = SyncState::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(state, SyncState::default());
        assert!(state.last_known_digest().is_none());
    }

    #[test]
    fn pull_updates_expected_tag_position() {
        let mut state = SyncState::default();
        state.record_push(digest(1), BTreeMap::new());
        state.record_pull(digest(2), BTreeMap::new());
        assert_eq!(state.last_known_digest(), Some(&digest(2)));
        assert_eq!(state.last_push_digest, Some(digest(2)));
    }
}
