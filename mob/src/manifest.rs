//! OCI image-manifest v1 model for bundle artifacts.
//!
//! One layer per registry-stored file. The standard title annotation on
//! each layer carries the full project-relative POSIX path, never a
//! basename: two files named `model.py` in different directories must
//! round-trip without colliding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::index::{BundleIndex, StorageKind};
use crate::path::RelPath;
use crate::{Error, Result};

/// Media type of the manifest document itself.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of the config blob (the serialized bundle index).
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.modelops.bundle.index.v1+json";

/// Media type of one file layer.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.modelops.bundle.file.v1";

/// Advisory artifact type; written on push, never used for identification.
pub const ARTIFACT_TYPE: &str = "application/vnd.modelops.bundle.v1";

/// Layer annotation holding the full project-relative path.
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// Manifest annotation holding the creation timestamp.
pub const CREATED_ANNOTATION: &str = "org.opencontainers.image.created";

/// Manifest annotation holding the producing tool version.
pub const TOOL_ANNOTATION: &str = "vnd.modelops.bundle.tool";

/// A content descriptor (config or layer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Content digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Optional descriptor annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// The full project-relative path recorded in the title annotation.
    pub fn title(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(TITLE_ANNOTATION))
            .map(String::as_str)
    }
}

/// An OCI image manifest for a bundle artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always `2`.
    pub schema_version: u32,
    /// Always [`MANIFEST_MEDIA_TYPE`].
    pub media_type: String,
    /// Advisory classification; registry support is inconsistent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// The config blob: canonical bundle-index bytes.
    pub config: Descriptor,
    /// One descriptor per registry-stored file.
    pub layers: Vec<Descriptor>,
    /// Manifest-level metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageManifest {
    /// Assembles the manifest for a bundle index whose canonical bytes
    /// are `index_bytes`. Layers appear in path order for determinism.
    pub fn for_bundle(index: &BundleIndex, index_bytes: &[u8]) -> Result<Self> {
        let config = Descriptor {
            media_type: CONFIG_MEDIA_TYPE.to_owned(),
            digest: Digest::of_bytes(index_bytes),
            size: index_bytes.len() as u64,
            annotations: None,
        };

        let layers = index
            .files
            .values()
            .filter(|entry| entry.storage == StorageKind::Oci)
            .map(|entry| Descriptor {
                media_type: LAYER_MEDIA_TYPE.to_owned(),
                digest: entry.digest.clone(),
                size: entry.size,
                annotations: Some(BTreeMap::from([(
                    TITLE_ANNOTATION.to_owned(),
                    entry.path.as_str().to_owned(),
                )])),
            })
            .collect();

        Ok(Self {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_owned(),
            artifact_type: Some(ARTIFACT_TYPE.to_owned()),
            config,
            layers,
            annotations: Some(BTreeMap::from([
                (CREATED_ANNOTATION.to_owned(), index.created.clone()),
                (TOOL_ANNOTATION.to_owned(), index.tool.version.clone()),
            ])),
        })
    }

    /// Serializes to the exact bytes that will be pushed (and hashed).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses manifest bytes fetched from a registry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        if manifest.schema_version != 2 {
            return Err(Error::InvalidInput(format!(
                "unsupported manifest schema version {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    /// Looks up a layer by digest.
    pub fn layer(&self, digest: &Digest) -> Option<&Descriptor> {
        self.layers.iter().find(|l| &l.digest == digest)
    }

    /// All layer digests, for upload dedup against a previous version.
    pub fn layer_digests(&self) -> impl Iterator<Item = &Digest> {
        self.layers.iter().map(|l| &l.digest)
    }
}

/// Paths recorded in layer titles, validated.
pub fn layer_paths(manifest: &ImageManifest) -> Result<Vec<RelPath>> {
    manifest
        .layers
        .iter()
        .map(|layer| {
            let title = layer.title().ok_or_else(|| {
                Error::InvalidInput(format!("layer {} has no title annotation", layer.digest))
            })?;
            RelPath::new(title)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BlobRef, FileEntry};

    fn index_with(paths: &[(&str, StorageKind)]) -> BundleIndex {
        let files = paths
            .iter()
            .enumerate()
            .map(|(i, (path, storage))| {
                let path = RelPath::new(*path).unwrap();
                let blob_ref = (*storage == StorageKind::Blob).then(|| BlobRef {
                    uri: "fs://c/ab/cd/abcd".to_owned(),
                });
                (
                    path.clone(),
                    FileEntry {
                        path,
                        digest: Digest::of_bytes(&[i as u8]),
                        size: 10,
                        storage: *storage,
                        blob_ref,
                    },
                )
            })
            .collect();
        BundleIndex::new(files)
    }

    #[test]
    fn layers_carry_full_paths() {
        let index = index_with(&[
            ("lib/model.py", StorageKind::Oci),
            ("src/model.py", StorageKind::Oci),
            ("data/weights.bin", StorageKind::Blob),
        ]);
        let bytes = index.to_canonical_bytes().unwrap();
        let manifest = ImageManifest::for_bundle(&index, &bytes).unwrap();

        // Blob-routed files are not layers.
        assert_eq!(manifest.layers.len(), 2);
        let titles: Vec<_> = manifest.layers.iter().filter_map(Descriptor::title).collect();
        assert_eq!(titles, ["lib/model.py", "src/model.py"]);

        assert_eq!(manifest.config.digest, Digest::of_bytes(&bytes));
        assert_eq!(manifest.config.media_type, CONFIG_MEDIA_TYPE);
    }

    #[test]
    fn manifest_bytes_round_trip() {
        let index = index_with(&[("a.txt", StorageKind::Oci)]);
        let bytes = index.to_canonical_bytes().unwrap();
        let manifest = ImageManifest::for_bundle(&index, &bytes).unwrap();
        let wire = manifest.to_bytes().unwrap();
        assert_eq!(ImageManifest::from_bytes(&wire).unwrap(), manifest);
    }

    #[test]
    fn layer_paths_require_titles() {
        let index = index_with(&[("a.txt", StorageKind::Oci)]);
        let bytes = index.to_canonical_bytes().unwrap();
        let mut manifest = ImageManifest::for_bundle(&index, &bytes).unwrap();
        assert_eq!(layer_paths(&manifest).unwrap().len(), 1);

        manifest.layers[0].annotations = None;
        assert!(layer_paths(&manifest).is_err());
    }
}
