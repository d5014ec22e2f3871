//! Interface to external blob storage.
//!
//! Adapters move whole content-addressed objects; the destination key is
//! derived from the digest by [`BlobLocation::uri_for`], never chosen by
//! the adapter. Puts are idempotent: re-uploading an existing digest is a
//! no-op that succeeds.

use std::path::Path;

use async_trait::async_trait;

use crate::config::{BlobProvider, StorageConfig};
use crate::digest::Digest;
use crate::{Error, Result};

/// Where a bundle's blob objects live: provider + container + prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    /// Storage provider the URI scheme names.
    pub provider: BlobProvider,
    /// Container or bucket.
    pub container: String,
    /// Optional key prefix; empty elides the segment.
    pub prefix: String,
}

impl BlobLocation {
    /// Builds the location from storage config; `None` when no provider
    /// is configured.
    pub fn from_config(storage: &StorageConfig) -> Result<Option<Self>> {
        if !storage.has_provider() {
            return Ok(None);
        }
        if storage.container.is_empty() {
            return Err(Error::Configuration(format!(
                "storage.provider {} requires storage.container",
                storage.provider
            )));
        }
        Ok(Some(Self {
            provider: storage.provider,
            container: storage.container.clone(),
            prefix: storage.prefix.trim_matches('/').to_owned(),
        }))
    }

    /// Content-addressed URI for a digest:
    /// `<provider>://<container>/[<prefix>/]<d0d1>/<d2d3>/<hex>`.
    pub fn uri_for(&self, digest: &Digest) -> String {
        let hex = digest.hex();
        let shard = format!("{}/{}/{hex}", &hex[0..2], &hex[2..4]);
        if self.prefix.is_empty() {
            format!("{}://{}/{shard}", self.provider, self.container)
        } else {
            format!("{}://{}/{}/{shard}", self.provider, self.container, self.prefix)
        }
    }

    /// Relative object key inside the container (prefix + shards + hex).
    pub fn key_for(&self, digest: &Digest) -> String {
        let hex = digest.hex();
        let shard = format!("{}/{}/{hex}", &hex[0..2], &hex[2..4]);
        if self.prefix.is_empty() {
            shard
        } else {
            format!("{}/{shard}", self.prefix)
        }
    }
}

/// Interface the engine uses to talk to any external blob store.
#[async_trait]
pub trait BlobAdapter: Send + Sync {
    /// Uploads the file at `src` under the digest's derived key.
    /// Idempotent: succeeds immediately if the object already exists.
    async fn put_by_digest(&self, digest: &Digest, src: &Path) -> Result<()>;

    /// Downloads the object for `digest` to `dest`.
    async fn get_by_digest(&self, digest: &Digest, dest: &Path) -> Result<()>;

    /// Existence check, no content verification.
    async fn exists_by_digest(&self, digest: &Digest) -> Result<bool>;

    /// Content-addressed URI for a digest (pure).
    fn uri_for(&self, digest: &Digest) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(prefix: &str) -> BlobLocation {
        BlobLocation {
            provider: BlobProvider::Azure,
            container: "ml-artifacts".to_owned(),
            prefix: prefix.to_owned(),
        }
    }

    #[test]
    fn uri_shards_by_leading_hex() {
        let digest = Digest::parse(
            "sha256:abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789",
        )
        .unwrap();
        assert_eq!(
            location("models").uri_for(&digest),
            format!("azure://ml-artifacts/models/ab/cd/{}", digest.hex())
        );
        assert_eq!(
            location("").uri_for(&digest),
            format!("azure://ml-artifacts/ab/cd/{}", digest.hex())
        );
    }

    #[test]
    fn same_digest_same_uri() {
        let digest = Digest::of_bytes(b"payload");
        let loc = location("p");
        assert_eq!(loc.uri_for(&digest), loc.uri_for(&digest));
    }

    #[test]
    fn from_config_requires_container() {
        let mut storage = StorageConfig {
            provider: BlobProvider::S3,
            ..StorageConfig::default()
        };
        assert!(BlobLocation::from_config(&storage).is_err());
        storage.container = "bucket".to_owned();
        let loc = BlobLocation::from_config(&storage).unwrap().unwrap();
        assert_eq!(loc.provider, BlobProvider::S3);
        assert!(
            BlobLocation::from_config(&StorageConfig::default())
                .unwrap()
                .is_none()
        );
    }
}
