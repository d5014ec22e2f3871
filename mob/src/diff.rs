//! Three-way diff between working tree, remote index, and sync base.
//!
//! For every path in the union of the three maps, the file is classified
//! by digest equality alone. `L` is the local snapshot, `R` the remote
//! index, `S` the server-side set at last sync (the base).

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::digest::Digest;
use crate::path::RelPath;

/// Lifecycle state of one path relative to the last sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Present locally, never synced, absent remotely.
    AddedLocal,
    /// Deleted locally since last sync; still on the remote.
    DeletedLocal,
    /// Edited locally since last sync; remote unchanged.
    ModifiedLocal,
    /// New on the remote since last sync; absent locally.
    AddedRemote,
    /// Deleted on the remote since last sync; local copy unchanged.
    DeletedRemote,
    /// Changed on the remote since last sync; local copy unchanged.
    ModifiedRemote,
    /// Both sides changed since last sync, to different content.
    Conflict,
    /// Same content everywhere that the path exists.
    Unchanged,
    /// In the working tree but not part of the bundle.
    Untracked,
}

impl FileState {
    /// Short human-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Self::AddedLocal => "added (local)",
            Self::DeletedLocal => "deleted (local)",
            Self::ModifiedLocal => "modified (local)",
            Self::AddedRemote => "added (remote)",
            Self::DeletedRemote => "deleted (remote)",
            Self::ModifiedRemote => "modified (remote)",
            Self::Conflict => "conflict",
            Self::Unchanged => "unchanged",
            Self::Untracked => "untracked",
        }
    }
}

/// Classification of one path, with the digests that drove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// The classified state.
    pub state: FileState,
    /// Local digest, if the file exists in the working tree.
    pub local: Option<Digest>,
    /// Remote digest, if the file exists in the remote index.
    pub remote: Option<Digest>,
    /// Base digest, if the file was in the last-synced set.
    pub base: Option<Digest>,
}

/// Classifies every path in `local ∪ remote ∪ base`.
pub fn three_way(
    local: &BTreeMap<RelPath, Digest>,
    remote: &BTreeMap<RelPath, Digest>,
    base: &BTreeMap<RelPath, Digest>,
) -> BTreeMap<RelPath, FileDiff> {
    let mut paths: BTreeSet<&RelPath> = BTreeSet::new();
    paths.extend(local.keys());
    paths.extend(remote.keys());
    paths.extend(base.keys());

    paths
        .into_iter()
        .map(|path| {
            let l = local.get(path);
            let r = remote.get(path);
            let s = base.get(path);
            let diff = FileDiff {
                state: classify(l, r, s),
                local: l.cloned(),
                remote: r.cloned(),
                base: s.cloned(),
            };
            (path.clone(), diff)
        })
        .collect()
}

/// The classification table. Both-sides-absent cannot occur for a path
/// drawn from the union, except when only the base has it (deleted on
/// both sides), which counts as unchanged.
fn classify(l: Option<&Digest>, r: Option<&Digest>, s: Option<&Digest>) -> FileState {
    match (l, r, s) {
        (Some(l), Some(r), Some(s)) => {
            if l == r {
                FileState::Unchanged
            } else if l == s {
                FileState::ModifiedRemote
            } else if r == s {
                FileState::ModifiedLocal
            } else {
                FileState::Conflict
            }
        }
        // Added on both sides since last sync.
        (Some(l), Some(r), None) => {
            if l == r {
                FileState::Unchanged
            } else {
                FileState::Conflict
            }
        }
        (Some(l), None, Some(s)) => {
            if l == s {
                FileState::DeletedRemote
            } else {
                // Locally edited, remotely deleted.
                FileState::Conflict
            }
        }
        (Some(_), None, None) => FileState::AddedLocal,
        (None, Some(r), Some(s)) => {
            if r == s {
                FileState::DeletedLocal
            } else {
                // Locally deleted, remotely edited.
                FileState::Conflict
            }
        }
        (None, Some(_), None) => FileState::AddedRemote,
        // Deleted on both sides.
        (None, None, Some(_)) => FileState::Unchanged,
        (None, None, None) => FileState::Unchanged,
    }
}
