//! Plan execution.
//!
//! Content uploads and downloads are idempotent by digest and run with
//! bounded parallelism. Persistent state (tag, tracked set, sync state)
//! changes only after every content operation has succeeded, so a crash
//! or cancellation mid-apply leaves the project recoverable: the next
//! sync re-transfers only what is missing.

use std::io;
use std::sync::Arc;

use mob_cas::{LinkMode, LocalCas};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::blob::BlobAdapter;
use crate::cancel::CancelToken;
use crate::digest::Digest;
use crate::index::StorageKind;
use crate::plan::{FetchItem, PullPlan, PushPlan};
use crate::project::Project;
use crate::registry::RegistryAdapter;
use crate::{Error, Result};

/// Default cap on concurrent transfers.
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 8;

/// Progress callback; receives short human-readable lines.
pub type StatusFn = dyn Fn(&str) + Send + Sync;

/// Result of a successful push apply.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    /// Digest the new manifest is stored under.
    pub manifest_digest: Digest,
    /// Registry-layer blobs uploaded.
    pub uploaded_oci: usize,
    /// External blobs uploaded.
    pub uploaded_blob: usize,
}

/// Result of a successful pull apply.
#[derive(Debug, Clone)]
pub struct PullOutcome {
    /// Digest the working tree now mirrors.
    pub remote_digest: Digest,
    /// Files fetched or re-materialized.
    pub fetched: usize,
    /// Local files deleted.
    pub deleted: usize,
}

/// Executes a push plan.
///
/// Upload order: external blobs, registry layers, config blob, then the
/// manifest — after re-resolving the tag one final time and failing with
/// `TagMoved` if it no longer matches the plan (compare-and-set best
/// effort; registries expose no native conditional PUT).
pub async fn apply_push(
    plan: &PushPlan,
    project: &Project,
    registry: Arc<dyn RegistryAdapter>,
    blob: Option<Arc<dyn BlobAdapter>>,
    cancel: &CancelToken,
    concurrency: usize,
    on_status: &StatusFn,
) -> Result<PushOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    // 1. External blobs.
    if !plan.uploads_blob.is_empty() {
        let adapter = blob.ok_or_else(|| {
            Error::Configuration("plan has blob uploads but no blob adapter".into())
        })?;
        on_status(&format!(
            "Uploading {} blob(s) to external storage...",
            plan.uploads_blob.len()
        ));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for upload in plan.uploads_blob.clone() {
            cancel.check()?;
            let adapter = Arc::clone(&adapter);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let src = upload.path.to_native(project.root());
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Io(io::Error::other(e)))?;
                cancel.check()?;
                tracing::debug!(digest = %upload.digest, uri = %upload.uri, "uploading blob");
                adapter.put_by_digest(&upload.digest, &src).await
            });
        }
        join_all(tasks).await?;
    }

    // 2. Registry layers.
    if !plan.uploads_oci.is_empty() {
        on_status(&format!(
            "Uploading {} layer(s) to the registry...",
            plan.uploads_oci.len()
        ));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for upload in plan.uploads_oci.clone() {
            cancel.check()?;
            let registry = Arc::clone(&registry);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let src = upload.path.to_native(project.root());
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Io(io::Error::other(e)))?;
                cancel.check()?;
                tracing::debug!(digest = %upload.digest, "uploading layer");
                registry.put_blob(&upload.digest, &src).await
            });
        }
        join_all(tasks).await?;
    }

    // 3. Config blob.
    cancel.check()?;
    on_status("Uploading bundle index...");
    registry
        .put_blob_bytes(&plan.index_digest, plan.index_bytes.clone())
        .await?;

    // 4. Re-check the tag, then write the manifest.
    cancel.check()?;
    let current = registry.resolve_tag(&plan.tag).await?;
    let current_digest = current.map(|r| r.digest);
    if current_digest != plan.previous_digest {
        return Err(Error::TagMoved {
            tag: plan.tag.clone(),
            expected: plan.previous_digest.as_ref().map(ToString::to_string),
            found: current_digest.as_ref().map(ToString::to_string),
        });
    }
    on_status(&format!("Writing manifest for tag {:?}...", plan.tag));
    let manifest_digest = registry
        .put_manifest(plan.manifest_bytes.clone(), Some(&plan.tag))
        .await?;

    // 5. Persist the sync record.
    let mut state = project.sync_state()?;
    state.record_push(manifest_digest.clone(), plan.index.digest_map());
    state.save(&project.state_path())?;

    Ok(PushOutcome {
        manifest_digest,
        uploaded_oci: plan.uploads_oci.len(),
        uploaded_blob: plan.uploads_blob.len(),
    })
}

/// Executes a pull plan: fetch into the cache, verify, materialize,
/// apply deletions, then persist tracked set and sync state.
///
/// Every content fetch goes by the digest captured at plan time; the tag
/// is never consulted again.
pub async fn apply_pull(
    plan: &PullPlan,
    project: &Project,
    registry: Arc<dyn RegistryAdapter>,
    blob: Option<Arc<dyn BlobAdapter>>,
    cas: &LocalCas,
    link_mode: LinkMode,
    cancel: &CancelToken,
    concurrency: usize,
    on_status: &StatusFn,
) -> Result<PullOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    if !plan.fetches.is_empty() {
        on_status(&format!("Fetching {} file(s)...", plan.fetches.len()));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for item in plan.fetches.clone() {
            cancel.check()?;
            let registry = Arc::clone(&registry);
            let blob = blob.clone();
            let cas = cas.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let dest = item.path.to_native(project.root());
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Io(io::Error::other(e)))?;
                cancel.check()?;
                fetch_one(&item, registry, blob, &cas).await?;
                cancel.check()?;
                let digest = item.digest.clone();
                tokio::task::spawn_blocking(move || cas.materialize(digest.as_str(), &dest, link_mode))
                    .await
                    .map_err(|e| Error::Io(io::Error::other(e)))??;
                Ok(())
            });
        }
        join_all(tasks).await?;
    }

    cancel.check()?;
    let mut deleted = 0;
    for path in &plan.deletions {
        let native = path.to_native(project.root());
        match std::fs::remove_file(&native) {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(%path, "deleted");
    }

    // The tracked set becomes the remote file set, plus any locally
    // added files this pull preserved (they stay part of the bundle).
    let preserved = plan.diff.iter().filter_map(|(path, d)| {
        (d.state == crate::diff::FileState::AddedLocal && !plan.deletions.contains(path))
            .then(|| path.clone())
    });
    let mut tracked = project.tracked()?;
    tracked.replace_with(plan.index.files.keys().cloned().chain(preserved));
    tracked.save(&project.tracked_path())?;

    let mut state = project.sync_state()?;
    state.record_pull(plan.remote_digest.clone(), plan.index.digest_map());
    state.save(&project.state_path())?;

    Ok(PullOutcome {
        remote_digest: plan.remote_digest.clone(),
        fetched: plan.fetches.len(),
        deleted,
    })
}

/// Brings one planned fetch into the cache, verified.
async fn fetch_one(
    item: &FetchItem,
    registry: Arc<dyn RegistryAdapter>,
    blob: Option<Arc<dyn BlobAdapter>>,
    cas: &LocalCas,
) -> Result<()> {
    let digest = item.digest.clone();
    match item.storage {
        StorageKind::Oci => {
            cas.ensure_present(digest.as_str(), |tmp| {
                let registry = Arc::clone(&registry);
                let digest = digest.clone();
                async move {
                    registry
                        .fetch_blob(&digest, &tmp)
                        .await
                        .map_err(|e| Box::new(e) as mob_cas::FetchError)
                }
            })
            .await?;
        }
        StorageKind::Blob => {
            let adapter = blob.ok_or_else(|| {
                Error::Configuration(format!(
                    "{} lives in blob storage but no provider is configured",
                    item.path
                ))
            })?;
            cas.ensure_present(digest.as_str(), |tmp| {
                let adapter = Arc::clone(&adapter);
                let digest = digest.clone();
                async move {
                    adapter
                        .get_by_digest(&digest, &tmp)
                        .await
                        .map_err(|e| Box::new(e) as mob_cas::FetchError)
                }
            })
            .await?;
        }
    }
    Ok(())
}

/// Awaits every task, surfacing the first error.
async fn join_all(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| Error::Io(io::Error::other(e)))??;
    }
    Ok(())
}
