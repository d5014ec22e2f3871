//! Interface the engine uses to talk to any OCI registry.
//!
//! An adapter is bound to one repository at construction. All content
//! operations are by digest; tags appear only in [`RegistryAdapter::resolve_tag`]
//! and [`RegistryAdapter::put_manifest`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;

use crate::digest::Digest;
use crate::{Error, Result};

/// What the user asked to sync against: a mutable tag or a pinned digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleRef {
    /// A mutable, human-readable tag name.
    Tag(String),
    /// An immutable manifest digest.
    Digest(Digest),
}

impl FromStr for BundleRef {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        if raw.starts_with("sha256:") {
            return Ok(Self::Digest(Digest::parse(raw)?));
        }
        if raw.is_empty() || raw.contains('/') || raw.contains(':') {
            return Err(Error::InvalidInput(format!("invalid tag {raw:?}")));
        }
        Ok(Self::Tag(raw.to_owned()))
    }
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => f.write_str(tag),
            Self::Digest(digest) => f.write_str(digest.as_str()),
        }
    }
}

/// A tag resolution: the registry's own digest plus the raw manifest.
///
/// The digest comes from the registry's content-digest metadata, never
/// from re-serializing the manifest: round-tripped JSON diverges on
/// whitespace and would produce a different hash.
#[derive(Debug, Clone)]
pub struct ResolvedTag {
    /// The registry's digest for the manifest.
    pub digest: Digest,
    /// Manifest bytes exactly as received.
    pub manifest: Vec<u8>,
}

/// Operations the engine requires from an OCI registry.
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    /// Resolves a tag; `Ok(None)` when the tag does not exist.
    async fn resolve_tag(&self, tag: &str) -> Result<Option<ResolvedTag>>;

    /// Fetches raw manifest bytes by digest.
    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Fetches a small blob (config-sized) into memory.
    async fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Streams a blob to a file at `dest`.
    async fn fetch_blob(&self, digest: &Digest, dest: &Path) -> Result<()>;

    /// Uploads the file at `src` as a blob. Idempotent by digest.
    async fn put_blob(&self, digest: &Digest, src: &Path) -> Result<()>;

    /// Uploads an in-memory blob. Idempotent by digest.
    async fn put_blob_bytes(&self, digest: &Digest, data: Vec<u8>) -> Result<()>;

    /// Writes manifest bytes; if `tag` is given, points it at them.
    /// Returns the digest the manifest is stored under: the SHA-256 of
    /// the exact bytes sent.
    async fn put_manifest(&self, manifest: Vec<u8>, tag: Option<&str>) -> Result<Digest>;

    /// Lists the repository's tags.
    async fn list_tags(&self) -> Result<Vec<String>>;
}
