//! Observable sync status of a bundle project.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::diff::{self, FileDiff};
use crate::path::RelPath;
use crate::registry::RegistryAdapter;
use crate::scan::WorkingEntry;
use crate::snapshot::Snapshot;
use crate::state::SyncState;
use crate::tracked::TrackedSet;
use crate::Result;

/// Where the project stands relative to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Working tree, remote, and last sync all agree.
    Clean,
    /// Local changes exist and the tag has never been pushed.
    LocalChanges,
    /// Local changes exist on top of the tag position we last synced.
    Ahead,
    /// The remote moved; the working tree matches the last sync.
    Behind,
    /// Both sides moved since the last sync.
    Diverged,
    /// The registry could not be reached.
    Unknown,
}

impl SyncStatus {
    /// Short human-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::LocalChanges => "local changes (never pushed)",
            Self::Ahead => "ahead of remote",
            Self::Behind => "behind remote",
            Self::Diverged => "diverged",
            Self::Unknown => "unknown (registry unreachable)",
        }
    }
}

/// Full status: the machine state plus per-file classification.
#[derive(Debug)]
pub struct StatusReport {
    /// The overall state.
    pub status: SyncStatus,
    /// Per-path classification against remote and base.
    pub diff: BTreeMap<RelPath, FileDiff>,
    /// Tracked paths missing from the working tree.
    pub missing: Vec<RelPath>,
    /// The tag's current digest, when resolvable.
    pub remote_digest: Option<crate::digest::Digest>,
}

/// Computes the project status against a tag.
///
/// Registry unreachability is not an error here: status degrades to
/// [`SyncStatus::Unknown`] with a local-only diff.
pub async fn compute_status(
    registry: &dyn RegistryAdapter,
    snapshot: &Snapshot,
    sync: &SyncState,
    tag: &str,
) -> Result<StatusReport> {
    let local = snapshot.digest_map();
    let base = &sync.last_synced_files;
    let local_moved = &local != base;

    let resolved = match registry.resolve_tag(tag).await {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::warn!(error = %e, tag, "registry unreachable; status unknown");
            return Ok(StatusReport {
                status: SyncStatus::Unknown,
                // Without the remote, diff against the base standing in
                // for it: only local-side states can appear.
                diff: diff::three_way(&local, base, base),
                missing: snapshot.missing.clone(),
                remote_digest: None,
            });
        }
    };

    let (remote, remote_digest) = match &resolved {
        Some(resolved) => {
            let index = match crate::plan::remote_index(registry, resolved).await {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!(error = %e, "bundle index unreadable; status unknown");
                    return Ok(StatusReport {
                        status: SyncStatus::Unknown,
                        diff: diff::three_way(&local, base, base),
                        missing: snapshot.missing.clone(),
                        remote_digest: Some(resolved.digest.clone()),
                    });
                }
            };
            (index.digest_map(), Some(resolved.digest.clone()))
        }
        None => (BTreeMap::new(), None),
    };

    let remote_moved = remote != *base;
    let status = match (local_moved, remote_moved) {
        (false, false) => SyncStatus::Clean,
        (true, false) if remote_digest.is_none() => SyncStatus::LocalChanges,
        (true, false) => SyncStatus::Ahead,
        (false, true) => SyncStatus::Behind,
        (true, true) => SyncStatus::Diverged,
    };

    Ok(StatusReport {
        status,
        diff: diff::three_way(&local, &remote, base),
        missing: snapshot.missing.clone(),
        remote_digest,
    })
}

/// Working-tree files that are not part of the bundle.
pub fn untracked(
    inventory: &BTreeMap<RelPath, WorkingEntry>,
    tracked: &TrackedSet,
) -> Vec<RelPath> {
    inventory
        .keys()
        .filter(|path| !tracked.contains(path))
        .cloned()
        .collect()
}
