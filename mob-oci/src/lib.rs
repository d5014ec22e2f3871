//! OCI registry adapter. Powered by [`oci_client`].
//!
//! Implements the engine's [`RegistryAdapter`] against any OCI
//! distribution registry: tag resolution via the registry's own content
//! digest, streaming blob pulls, idempotent blob pushes, and raw manifest
//! writes. Transient failures retry with exponential backoff and jitter;
//! not-found and authorization failures surface immediately.

use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use mob::manifest::MANIFEST_MEDIA_TYPE;
use mob::registry::{RegistryAdapter, ResolvedTag};
use mob::{Digest, Error, Result};
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::OciDescriptor;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference, RegistryOperation};
use rand::Rng;
use tokio::io::AsyncWriteExt;

/// Manifest media types accepted when resolving a tag.
const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    MANIFEST_MEDIA_TYPE,
    "application/vnd.oci.artifact.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// Default connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-blob read timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Backoff policy for transient registry failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
    /// Random jitter added to each delay, in milliseconds.
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter_ms: 250,
        }
    }
}

/// Options for constructing an [`OciRegistry`].
#[derive(Debug)]
pub struct OciOptions {
    /// Use plain HTTP (local development registries).
    pub insecure: bool,
    /// Registry credentials. Defaults to anonymous.
    pub auth: RegistryAuth,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Per-request read timeout (covers one blob transfer).
    pub read_timeout: Duration,
}

impl Default for OciOptions {
    fn default() -> Self {
        Self {
            insecure: false,
            auth: RegistryAuth::Anonymous,
            retry: RetryConfig::default(),
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
        }
    }
}

/// [`RegistryAdapter`] over one repository of an OCI registry.
pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
    registry: String,
    repository: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for OciRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciRegistry")
            .field("registry", &self.registry)
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

/// Retries a registry call with exponential backoff and jitter.
///
/// The call expression is re-evaluated on every attempt, so each retry
/// builds a fresh request future.
macro_rules! retrying {
    ($self:expr, $what:literal, $call:expr) => {{
        let mut attempt: u32 = 1;
        let mut delay = $self.retry.initial_delay;
        loop {
            match $call.await {
                Ok(value) => break Ok(value),
                Err(e) => {
                    let msg = e.to_string();
                    if attempt >= $self.retry.max_attempts || !is_retryable(&msg) {
                        break Err(map_registry_error($what, &msg));
                    }
                    tracing::warn!(attempt, error = %msg, concat!("retrying ", $what));
                    tokio::time::sleep(delay + jitter($self.retry.jitter_ms)).await;
                    delay = (delay * 2).min($self.retry.max_delay);
                    attempt += 1;
                }
            }
        }
    }};
}

impl OciRegistry {
    /// Binds an adapter to `registry_ref` (`<host>/<repo>`).
    pub fn connect(registry_ref: &str, options: OciOptions) -> Result<Self> {
        let parsed: Reference = registry_ref
            .parse()
            .map_err(|e| Error::Configuration(format!("registry_ref {registry_ref:?}: {e}")))?;

        let protocol = if options.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            connect_timeout: Some(options.connect_timeout),
            read_timeout: Some(options.read_timeout),
            ..ClientConfig::default()
        });

        Ok(Self {
            client,
            auth: options.auth,
            registry: parsed.registry().to_owned(),
            repository: parsed.repository().to_owned(),
            retry: options.retry,
        })
    }

    fn tag_reference(&self, tag: &str) -> Reference {
        Reference::with_tag(self.registry.clone(), self.repository.clone(), tag.to_owned())
    }

    fn digest_reference(&self, digest: &Digest) -> Reference {
        Reference::with_digest(
            self.registry.clone(),
            self.repository.clone(),
            digest.to_string(),
        )
    }

    fn descriptor(digest: &Digest) -> OciDescriptor {
        OciDescriptor {
            media_type: mob::manifest::LAYER_MEDIA_TYPE.to_owned(),
            digest: digest.to_string(),
            ..OciDescriptor::default()
        }
    }

    async fn authorize(&self, reference: &Reference, operation: RegistryOperation) -> Result<()> {
        self.client
            .auth(reference, &self.auth, operation)
            .await
            .map_err(|e| Error::Network(format!("authenticating to {}: {e}", self.registry)))?;
        Ok(())
    }
}

#[async_trait]
impl RegistryAdapter for OciRegistry {
    async fn resolve_tag(&self, tag: &str) -> Result<Option<ResolvedTag>> {
        let reference = self.tag_reference(tag);
        let outcome = retrying!(self, "resolve tag", async {
            self.client
                .pull_manifest_raw(&reference, &self.auth, ACCEPTED_MANIFEST_TYPES)
                .await
        });
        match outcome {
            // The digest accompanies the response (content-digest
            // metadata); the manifest bytes are never re-serialized.
            Ok((manifest, digest)) => Ok(Some(ResolvedTag {
                digest: Digest::parse(digest)?,
                manifest: manifest.to_vec(),
            })),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        let reference = self.digest_reference(digest);
        let (manifest, received) = retrying!(self, "fetch manifest", async {
            self.client
                .pull_manifest_raw(&reference, &self.auth, ACCEPTED_MANIFEST_TYPES)
                .await
        })?;
        if received != digest.as_str() {
            return Err(Error::DigestMismatch {
                digest: digest.to_string(),
                actual: received,
            });
        }
        Ok(manifest.to_vec())
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let reference = self.tag_reference("latest");
        self.authorize(&reference, RegistryOperation::Pull).await?;
        let descriptor = Self::descriptor(digest);
        let buf = retrying!(self, "fetch blob", async {
            let mut buf = Cursor::new(Vec::new());
            self.client
                .pull_blob(&reference, &descriptor, &mut buf)
                .await
                .map(|()| buf.into_inner())
        })?;
        Ok(buf)
    }

    async fn fetch_blob(&self, digest: &Digest, dest: &Path) -> Result<()> {
        let reference = self.tag_reference("latest");
        self.authorize(&reference, RegistryOperation::Pull).await?;
        let descriptor = Self::descriptor(digest);
        retrying!(self, "download blob", async {
            let mut file = match tokio::fs::File::create(dest).await {
                Ok(file) => file,
                Err(e) => return Err(oci_client::errors::OciDistributionError::IoError(e)),
            };
            self.client
                .pull_blob(&reference, &descriptor, &mut file)
                .await?;
            file.flush()
                .await
                .map_err(oci_client::errors::OciDistributionError::IoError)
        })?;
        Ok(())
    }

    async fn put_blob(&self, digest: &Digest, src: &Path) -> Result<()> {
        let data = tokio::fs::read(src).await?;
        self.put_blob_bytes(digest, data).await
    }

    async fn put_blob_bytes(&self, digest: &Digest, data: Vec<u8>) -> Result<()> {
        let reference = self.tag_reference("latest");
        self.authorize(&reference, RegistryOperation::Push).await?;
        retrying!(self, "upload blob", async {
            self.client
                .push_blob(&reference, data.clone(), digest.as_str())
                .await
        })?;
        Ok(())
    }

    async fn put_manifest(&self, manifest: Vec<u8>, tag: Option<&str>) -> Result<Digest> {
        // The digest is the hash of the exact bytes sent; registries are
        // required to store the manifest under precisely this digest.
        let digest = Digest::of_bytes(&manifest);
        let reference = match tag {
            Some(tag) => self.tag_reference(tag),
            None => self.digest_reference(&digest),
        };
        self.authorize(&reference, RegistryOperation::Push).await?;
        let content_type: http::HeaderValue = MANIFEST_MEDIA_TYPE
            .parse()
            .map_err(|e| Error::InvalidInput(format!("manifest media type: {e}")))?;
        retrying!(self, "write manifest", async {
            self.client
                .push_manifest_raw(&reference, manifest.clone(), content_type.clone())
                .await
        })?;
        Ok(digest)
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        let reference = self.tag_reference("latest");
        let response = retrying!(self, "list tags", async {
            self.client
                .list_tags(&reference, &self.auth, None, None)
                .await
        })?;
        Ok(response.tags)
    }
}

/// Failures worth retrying: anything that is not a definitive registry
/// verdict (missing content, rejected credentials, malformed request).
fn is_retryable(message: &str) -> bool {
    !(is_not_found(message)
        || message.contains("unauthorized")
        || message.contains("Unauthorized")
        || message.contains("authentication"))
}

fn is_not_found(message: &str) -> bool {
    message.contains("404")
        || message.contains("not found")
        || message.contains("NotFound")
        || message.contains("MANIFEST_UNKNOWN")
        || message.contains("NAME_UNKNOWN")
        || message.contains("BLOB_UNKNOWN")
}

fn map_registry_error(what: &str, message: &str) -> Error {
    if is_not_found(message) {
        Error::NotFound(format!("{what}: {message}"))
    } else {
        Error::Network(format!("{what}: {message}"))
    }
}

fn jitter(max_ms: u64) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(is_not_found("server error 404 for https://r/v2/x"));
        assert!(is_not_found("OCI API error: MANIFEST_UNKNOWN"));
        assert!(!is_retryable("401 Unauthorized"));
        assert!(!is_retryable("manifest not found"));
        assert!(is_retryable("connection reset by peer"));
        assert!(is_retryable("server error 503"));
    }

    #[test]
    fn connect_parses_registry_ref() {
        let adapter =
            OciRegistry::connect("localhost:5555/models/demo", OciOptions::default()).unwrap();
        assert_eq!(adapter.registry, "localhost:5555");
        assert_eq!(adapter.repository, "models/demo");
        assert!(OciRegistry::connect("", OciOptions::default()).is_err());
    }
}
