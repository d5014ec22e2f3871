//! Plan construction for push and pull.
//!
//! Plans are computed over immutable digests captured at plan time and
//! carry everything an apply needs; nothing is decided mid-apply. The
//! tag-moved race check happens here (and once more immediately before
//! the manifest write).

use std::collections::{BTreeMap, BTreeSet};

use crate::blob::BlobAdapter;
use crate::diff::{self, FileDiff, FileState};
use crate::digest::Digest;
use crate::index::{BundleIndex, FileEntry, StorageKind};
use crate::manifest::ImageManifest;
use crate::path::RelPath;
use crate::policy::StoragePolicy;
use crate::registry::{BundleRef, RegistryAdapter, ResolvedTag};
use crate::snapshot::Snapshot;
use crate::state::SyncState;
use crate::{Error, Result};

/// One registry-layer upload.
#[derive(Debug, Clone)]
pub struct Upload {
    /// A path whose content is this blob (several paths may share it).
    pub path: RelPath,
    /// Blob digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
}

/// One external-blob upload.
#[derive(Debug, Clone)]
pub struct BlobUpload {
    /// A path whose content is this blob.
    pub path: RelPath,
    /// Blob digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Destination URI (content-addressed).
    pub uri: String,
}

/// Everything a push apply needs, resolved at plan time.
#[derive(Debug)]
pub struct PushPlan {
    /// Tag the manifest will be written under.
    pub tag: String,
    /// Tag position observed at plan time (the compare-and-set basis).
    pub previous_digest: Option<Digest>,
    /// The new bundle index.
    pub index: BundleIndex,
    /// Canonical index bytes (the config blob).
    pub index_bytes: Vec<u8>,
    /// Digest of the config blob.
    pub index_digest: Digest,
    /// Exact manifest bytes to push.
    pub manifest_bytes: Vec<u8>,
    /// Registry-layer blobs that are not yet on the registry.
    pub uploads_oci: Vec<Upload>,
    /// External blobs that are not yet in blob storage.
    pub uploads_blob: Vec<BlobUpload>,
    /// Paths present in the previous version but absent locally (mirror).
    pub deletions: Vec<RelPath>,
    /// Full classification, for diagnostics.
    pub diff: BTreeMap<RelPath, FileDiff>,
}

/// Builds a push plan.
///
/// Fails with `TagMoved` when the tag no longer points where the last
/// sync left it (unless `force`), and with a configuration error when a
/// file routes to blob storage without a provider.
pub async fn build_push_plan(
    registry: &dyn RegistryAdapter,
    blob: Option<&dyn BlobAdapter>,
    policy: &StoragePolicy,
    snapshot: &Snapshot,
    sync: &SyncState,
    tag: &str,
    force: bool,
) -> Result<PushPlan> {
    let previous = registry.resolve_tag(tag).await?;
    let previous_digest = previous.as_ref().map(|p| p.digest.clone());

    if !force && previous_digest.as_ref() != sync.last_push_digest.as_ref() {
        return Err(Error::TagMoved {
            tag: tag.to_owned(),
            expected: sync.last_push_digest.as_ref().map(ToString::to_string),
            found: previous_digest.as_ref().map(ToString::to_string),
        });
    }

    let previous_index = match &previous {
        Some(resolved) => Some(fetch_index(registry, resolved).await?.1),
        None => None,
    };
    let previous_files = previous_index
        .as_ref()
        .map(BundleIndex::digest_map)
        .unwrap_or_default();
    let previous_layers: BTreeSet<Digest> = previous_index
        .as_ref()
        .map(|index| {
            index
                .files
                .values()
                .filter(|e| e.storage == StorageKind::Oci)
                .map(|e| e.digest.clone())
                .collect()
        })
        .unwrap_or_default();

    let local = snapshot.digest_map();
    let diff = diff::three_way(&local, &previous_files, &sync.last_synced_files);

    // Classify every local file and assemble the new index.
    let mut files = BTreeMap::new();
    let mut uploads_oci = Vec::new();
    let mut uploads_blob = Vec::new();
    let mut queued: BTreeSet<Digest> = BTreeSet::new();

    for (path, entry) in &snapshot.files {
        let storage = policy.classify(path, entry.size)?;
        let blob_ref = match storage {
            StorageKind::Blob => Some(policy.blob_ref(&entry.digest)?),
            StorageKind::Oci => None,
        };
        files.insert(
            path.clone(),
            FileEntry {
                path: path.clone(),
                digest: entry.digest.clone(),
                size: entry.size,
                storage,
                blob_ref: blob_ref.clone(),
            },
        );

        if queued.contains(&entry.digest) {
            continue;
        }
        match storage {
            StorageKind::Oci => {
                if !previous_layers.contains(&entry.digest) {
                    queued.insert(entry.digest.clone());
                    uploads_oci.push(Upload {
                        path: path.clone(),
                        digest: entry.digest.clone(),
                        size: entry.size,
                    });
                }
            }
            StorageKind::Blob => {
                let adapter = blob.ok_or_else(|| {
                    Error::Configuration(format!(
                        "{path} routes to blob storage but no blob adapter is available"
                    ))
                })?;
                if !adapter.exists_by_digest(&entry.digest).await? {
                    queued.insert(entry.digest.clone());
                    uploads_blob.push(BlobUpload {
                        path: path.clone(),
                        digest: entry.digest.clone(),
                        size: entry.size,
                        uri: blob_ref.map(|r| r.uri).unwrap_or_default(),
                    });
                }
            }
        }
    }

    let deletions: Vec<RelPath> = previous_files
        .keys()
        .filter(|path| !snapshot.files.contains_key(*path))
        .cloned()
        .collect();

    let index = BundleIndex::new(files);
    let index_bytes = index.to_canonical_bytes()?;
    let index_digest = Digest::of_bytes(&index_bytes);
    let manifest_bytes = ImageManifest::for_bundle(&index, &index_bytes)?.to_bytes()?;

    tracing::debug!(
        tag,
        oci = uploads_oci.len(),
        blob = uploads_blob.len(),
        deletions = deletions.len(),
        "push plan ready"
    );

    Ok(PushPlan {
        tag: tag.to_owned(),
        previous_digest,
        index,
        index_bytes,
        index_digest,
        manifest_bytes,
        uploads_oci,
        uploads_blob,
        deletions,
        diff,
    })
}

/// One object to bring into the local cache and working tree.
#[derive(Debug, Clone)]
pub struct FetchItem {
    /// Destination path in the working tree.
    pub path: RelPath,
    /// Content digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Where the bytes live.
    pub storage: StorageKind,
    /// Blob URI for blob-routed content.
    pub blob_uri: Option<String>,
}

/// Everything a pull apply needs, resolved at plan time.
#[derive(Debug)]
pub struct PullPlan {
    /// Digest the reference resolved to; all content goes by this.
    pub remote_digest: Digest,
    /// The remote bundle index.
    pub index: BundleIndex,
    /// Files to fetch (absent locally, or different content).
    pub fetches: Vec<FetchItem>,
    /// Local files to delete.
    pub deletions: Vec<RelPath>,
    /// Full classification, for diagnostics.
    pub diff: BTreeMap<RelPath, FileDiff>,
}

/// Builds a pull plan.
///
/// The safety verdict rejects the whole operation when it would touch
/// local changes: modified-local, remote deletions of local files, or
/// conflicts, unless `overwrite` is set. Locally added files survive
/// unless `mirror` is also set.
pub async fn build_pull_plan(
    registry: &dyn RegistryAdapter,
    snapshot: &Snapshot,
    sync: &SyncState,
    reference: &BundleRef,
    overwrite: bool,
    mirror: bool,
) -> Result<PullPlan> {
    let (remote_digest, index) = match reference {
        BundleRef::Tag(tag) => {
            let resolved = registry
                .resolve_tag(tag)
                .await?
                .ok_or_else(|| Error::NotFound(format!("tag {tag:?}")))?;
            fetch_index(registry, &resolved).await?
        }
        BundleRef::Digest(digest) => {
            let manifest = registry.get_manifest(digest).await?;
            let resolved = ResolvedTag {
                digest: digest.clone(),
                manifest,
            };
            fetch_index(registry, &resolved).await?
        }
    };

    let local = snapshot.digest_map();
    let remote = index.digest_map();
    let diff = diff::three_way(&local, &remote, &sync.last_synced_files);

    if !overwrite {
        let violations: Vec<String> = diff
            .iter()
            .filter(|(_, d)| {
                matches!(
                    d.state,
                    FileState::ModifiedLocal | FileState::DeletedRemote | FileState::Conflict
                )
            })
            .map(|(path, d)| format!("  {} ({})", path, d.state.label()))
            .collect();
        if !violations.is_empty() {
            return Err(Error::SafetyGuard(violations.join("\n")));
        }
    }

    let fetches: Vec<FetchItem> = index
        .files
        .values()
        .filter(|entry| local.get(&entry.path) != Some(&entry.digest))
        .map(|entry| FetchItem {
            path: entry.path.clone(),
            digest: entry.digest.clone(),
            size: entry.size,
            storage: entry.storage,
            blob_uri: entry.blob_ref.as_ref().map(|r| r.uri.clone()),
        })
        .collect();

    let mut deletions = Vec::new();
    for (path, d) in &diff {
        let delete = match d.state {
            FileState::DeletedRemote => true,
            FileState::Conflict => d.local.is_some() && d.remote.is_none(),
            FileState::AddedLocal => mirror,
            _ => false,
        };
        if delete {
            deletions.push(path.clone());
        }
    }

    tracing::debug!(
        digest = %remote_digest,
        fetches = fetches.len(),
        deletions = deletions.len(),
        "pull plan ready"
    );

    Ok(PullPlan {
        remote_digest,
        index,
        fetches,
        deletions,
        diff,
    })
}

/// Parses a resolved manifest and fetches + validates its bundle index.
pub async fn remote_index(
    registry: &dyn RegistryAdapter,
    resolved: &ResolvedTag,
) -> Result<BundleIndex> {
    let manifest = ImageManifest::from_bytes(&resolved.manifest)?;
    let config_bytes = registry.get_blob(&manifest.config.digest).await?;
    let actual = Digest::of_bytes(&config_bytes);
    if actual != manifest.config.digest {
        return Err(Error::DigestMismatch {
            digest: manifest.config.digest.to_string(),
            actual: actual.to_string(),
        });
    }
    BundleIndex::from_bytes(&config_bytes)
}

async fn fetch_index(
    registry: &dyn RegistryAdapter,
    resolved: &ResolvedTag,
) -> Result<(Digest, BundleIndex)> {
    let index = remote_index(registry, resolved).await?;
    Ok((resolved.digest.clone(), index))
}
