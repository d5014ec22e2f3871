//! External blob-store adapters.
//!
//! The `fs` provider is a complete [`BlobAdapter`] over a local
//! directory, using the same content-addressed sharding as the blob URI
//! scheme. It backs tests and air-gapped setups. Cloud providers are
//! recognized in configuration but fail until their integrations land.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use mob::blob::{BlobAdapter, BlobLocation};
use mob::config::{BlobProvider, StorageConfig};
use mob::{Digest, Error, Result};

/// Blob store over a local directory; the configured container is the
/// directory path.
///
/// Objects land at `<container>/[<prefix>/]<d0d1>/<d2d3>/<hex>` via a
/// temp file and atomic rename, so concurrent writers of the same digest
/// are harmless and readers never see partial objects.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    location: BlobLocation,
    root: PathBuf,
}

impl FsBlobStore {
    /// Opens (or creates) the store for a `fs` provider config.
    pub fn open(location: BlobLocation) -> Result<Self> {
        let root = PathBuf::from(&location.container);
        std::fs::create_dir_all(&root)?;
        Ok(Self { location, root })
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        let mut path = self.root.clone();
        for segment in self.location.key_for(digest).split('/') {
            path.push(segment);
        }
        path
    }
}

#[async_trait]
impl BlobAdapter for FsBlobStore {
    async fn put_by_digest(&self, digest: &Digest, src: &Path) -> Result<()> {
        let dest = self.object_path(digest);
        if dest.is_file() {
            return Ok(());
        }
        let parent = dest
            .parent()
            .ok_or_else(|| Error::Io(io::Error::other("object path has no parent")))?;
        tokio::fs::create_dir_all(parent).await?;

        let tmp = dest.with_extension("tmp");
        let outcome = async {
            tokio::fs::copy(src, &tmp).await?;
            tokio::fs::rename(&tmp, &dest).await?;
            Ok(())
        }
        .await;
        if outcome.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        } else {
            tracing::debug!(digest = %digest, dest = %dest.display(), "stored blob");
        }
        outcome
    }

    async fn get_by_digest(&self, digest: &Digest, dest: &Path) -> Result<()> {
        let src = self.object_path(digest);
        match tokio::fs::copy(&src, dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {digest}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists_by_digest(&self, digest: &Digest) -> Result<bool> {
        Ok(self.object_path(digest).is_file())
    }

    fn uri_for(&self, digest: &Digest) -> String {
        self.location.uri_for(digest)
    }
}

/// Builds the blob adapter the storage config calls for.
///
/// `Ok(None)` when no provider is configured; a configuration error for
/// providers whose integration is not available in this build.
pub fn from_config(storage: &StorageConfig) -> Result<Option<Arc<dyn BlobAdapter>>> {
    let Some(location) = BlobLocation::from_config(storage)? else {
        return Ok(None);
    };
    match location.provider {
        BlobProvider::Fs => Ok(Some(Arc::new(FsBlobStore::open(location)?))),
        provider => Err(Error::Configuration(format!(
            "storage.provider {provider} is not available in this build; use \"fs\" or unset the provider"
        ))),
    }
}
