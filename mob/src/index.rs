//! The bundle's authoritative file manifest, stored as the OCI config blob.
//!
//! Serialization is canonical: compact JSON, lexicographically ordered
//! keys, fixed field order. Serializing the same logical index twice
//! yields byte-identical output, so the config blob's digest is stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::digest::Digest;
use crate::path::RelPath;
use crate::{Error, Result};

/// Schema version written by this tool.
pub const INDEX_VERSION: &str = "1.0";

/// Tool name recorded in every index.
pub const TOOL_NAME: &str = "modelops-bundle";

/// Where a file's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// A content-addressed layer in the OCI registry.
    Oci,
    /// An object in external blob storage.
    Blob,
}

/// Pointer to a file's object in external blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlobRef {
    /// Content-addressed URI, e.g. `azure://bundles/ab/cd/abcd…`.
    pub uri: String,
}

/// One tracked file in a bundle version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
    /// Project-relative POSIX path; equals this entry's map key.
    pub path: RelPath,
    /// Content digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Storage routing for this file.
    pub storage: StorageKind,
    /// Present iff `storage` is [`StorageKind::Blob`].
    #[serde(rename = "blobRef", default, skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<BlobRef>,
}

/// Tool identity stamped into the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Tool version.
    pub version: String,
}

/// Immutable content manifest of one bundle version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleIndex {
    /// Schema version, currently `"1.0"`.
    pub version: String,
    /// Creation time, RFC 3339 UTC.
    pub created: String,
    /// Tool that wrote this index.
    pub tool: ToolInfo,
    /// Every tracked file, keyed by path.
    pub files: BTreeMap<RelPath, FileEntry>,
}

impl BundleIndex {
    /// Builds a new index over `files`, stamped with the current time.
    pub fn new(files: BTreeMap<RelPath, FileEntry>) -> Self {
        let created = OffsetDateTime::now_utc()
            .replace_nanosecond(0)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"));
        Self {
            version: INDEX_VERSION.to_owned(),
            created,
            tool: ToolInfo {
                name: TOOL_NAME.to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
            files,
        }
    }

    /// Canonical byte serialization (pure: same index, same bytes).
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Digest of the canonical bytes; what the OCI config descriptor names.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of_bytes(&self.to_canonical_bytes()?))
    }

    /// Parses and validates an index fetched from a registry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let index: Self = serde_json::from_slice(bytes)?;
        index.validate()?;
        Ok(index)
    }

    /// Checks the structural invariants.
    pub fn validate(&self) -> Result<()> {
        if !self.version.starts_with("1.") {
            return Err(Error::InvalidInput(format!(
                "unsupported bundle index version {:?}",
                self.version
            )));
        }
        for (key, entry) in &self.files {
            if key != &entry.path {
                return Err(Error::InvalidInput(format!(
                    "index entry {key} disagrees with its path field {}",
                    entry.path
                )));
            }
            let blob = entry.storage == StorageKind::Blob;
            if blob != entry.blob_ref.is_some() {
                return Err(Error::InvalidInput(format!(
                    "index entry {key}: blobRef must be present exactly for blob storage"
                )));
            }
        }
        Ok(())
    }

    /// Path → digest projection for the diff engine.
    pub fn digest_map(&self) -> BTreeMap<RelPath, Digest> {
        self.files
            .iter()
            .map(|(path, entry)| (path.clone(), entry.digest.clone()))
            .collect()
    }

    /// Total payload size in bytes.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|entry| entry.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, marker: u8, storage: StorageKind) -> (RelPath, FileEntry) {
        let path = RelPath::new(path).unwrap();
        let blob_ref = (storage == StorageKind::Blob).then(|| BlobRef {
            uri: "fs://store/ab/cd/abcd".to_owned(),
        });
        (
            path.clone(),
            FileEntry {
                path,
                digest: Digest::of_bytes(&[marker]),
                size: u64::from(marker),
                storage,
                blob_ref,
            },
        )
    }

    #[test]
    fn canonical_bytes_are_stable_and_sorted() {
        let index = BundleIndex::new(BTreeMap::from([
            entry("src/model.py", 1, StorageKind::Oci),
            entry("data/x.csv", 2, StorageKind::Oci),
        ]));
        let a = index.to_canonical_bytes().unwrap();
        let b = index.to_canonical_bytes().unwrap();
        assert_eq!(a, b);

        let text = String::from_utf8(a).unwrap();
        let data_at = text.find("data/x.csv").unwrap();
        let src_at = text.find("src/model.py").unwrap();
        assert!(data_at < src_at, "files must serialize in path order");
        assert!(text.starts_with("{\"version\":\"1.0\""));
    }

    #[test]
    fn round_trip_preserves_digest() {
        let index = BundleIndex::new(BTreeMap::from([
            entry("a.bin", 3, StorageKind::Blob),
            entry("b.txt", 4, StorageKind::Oci),
        ]));
        let bytes = index.to_canonical_bytes().unwrap();
        let back = BundleIndex::from_bytes(&bytes).unwrap();
        assert_eq!(back, index);
        assert_eq!(back.digest().unwrap(), index.digest().unwrap());
    }

    #[test]
    fn blob_entry_without_ref_is_rejected() {
        let (path, mut broken) = entry("a.bin", 3, StorageKind::Blob);
        broken.blob_ref = None;
        let index = BundleIndex::new(BTreeMap::from([(path, broken)]));
        assert!(index.validate().is_err());
    }

    #[test]
    fn key_path_disagreement_is_rejected() {
        let (_, entry_a) = entry("a.txt", 1, StorageKind::Oci);
        let index = BundleIndex::new(BTreeMap::from([(RelPath::new("b.txt").unwrap(), entry_a)]));
        assert!(index.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = br#"{"version":"1.0","created":"2024-01-15T10:30:00Z","tool":{"name":"modelops-bundle","version":"0"},"files":{},"sneaky":1}"#;
        assert!(BundleIndex::from_bytes(raw).is_err());
    }

    #[test]
    fn empty_index_is_valid() {
        let index = BundleIndex::new(BTreeMap::new());
        index.validate().unwrap();
        assert_eq!(index.total_size(), 0);
        assert!(index.digest().is_ok());
    }
}
