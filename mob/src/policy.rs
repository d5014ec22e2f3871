//! Routing of files between registry layers and external blob storage.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::blob::BlobLocation;
use crate::config::{StorageConfig, StorageMode};
use crate::digest::Digest;
use crate::index::{BlobRef, StorageKind};
use crate::path::RelPath;
use crate::{Error, Result};

/// Compiled storage policy for one bundle.
///
/// Decision order: force-OCI pattern, force-BLOB pattern, global mode,
/// then the size threshold. A blob verdict with no configured provider is
/// a configuration error, surfaced at plan time so an apply never
/// discovers it mid-flight.
#[derive(Debug)]
pub struct StoragePolicy {
    mode: StorageMode,
    threshold_bytes: u64,
    force_oci: GlobSet,
    force_blob: GlobSet,
    location: Option<BlobLocation>,
}

impl StoragePolicy {
    /// Compiles the policy from storage config.
    pub fn from_config(storage: &StorageConfig) -> Result<Self> {
        Ok(Self {
            mode: storage.mode,
            threshold_bytes: storage.threshold_bytes,
            force_oci: compile_set(&storage.force_oci_patterns)?,
            force_blob: compile_set(&storage.force_blob_patterns)?,
            location: BlobLocation::from_config(storage)?,
        })
    }

    /// The blob location, when a provider is configured.
    pub fn location(&self) -> Option<&BlobLocation> {
        self.location.as_ref()
    }

    /// Classifies one file.
    pub fn classify(&self, path: &RelPath, size: u64) -> Result<StorageKind> {
        let verdict = if self.force_oci.is_match(path.as_str()) {
            StorageKind::Oci
        } else if self.force_blob.is_match(path.as_str()) {
            StorageKind::Blob
        } else {
            match self.mode {
                StorageMode::OciInline => StorageKind::Oci,
                StorageMode::BlobOnly => StorageKind::Blob,
                StorageMode::Auto => {
                    if size >= self.threshold_bytes && self.location.is_some() {
                        StorageKind::Blob
                    } else {
                        StorageKind::Oci
                    }
                }
            }
        };

        if verdict == StorageKind::Blob && self.location.is_none() {
            return Err(Error::Configuration(format!(
                "{path} routes to blob storage but no storage.provider is configured"
            )));
        }
        Ok(verdict)
    }

    /// Blob reference for a blob-routed digest.
    pub fn blob_ref(&self, digest: &Digest) -> Result<BlobRef> {
        let location = self.location.as_ref().ok_or_else(|| {
            Error::Configuration("blob reference requested without a storage.provider".into())
        })?;
        Ok(BlobRef {
            uri: location.uri_for(digest),
        })
    }
}

fn compile_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    Error::Configuration(format!("bad storage pattern {pattern:?}: {e}"))
                })?,
        );
    }
    builder
        .build()
        .map_err(|e| Error::Configuration(format!("storage patterns: {e}")))
}
