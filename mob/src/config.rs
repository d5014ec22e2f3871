//! Project configuration (`.modelops-bundle/config.yaml`).

use std::fmt;
use std::path::{Path, PathBuf};

use mob_cas::LinkMode;
use serde::{Deserialize, Serialize};

use crate::fsio::atomic_write;
use crate::{Error, Result};

/// Default storage threshold: files at or above 50 MiB go to blob storage.
pub const DEFAULT_THRESHOLD_BYTES: u64 = 52_428_800;

/// Tag used when the user gives none.
pub const DEFAULT_TAG: &str = "latest";

/// Per-project bundle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleConfig {
    /// The bundle's home: `<host>/<repo>`.
    pub registry_ref: String,
    /// Tag used when none is given.
    #[serde(default = "default_tag")]
    pub default_tag: String,
    /// File-routing policy between registry layers and blob storage.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Override for the shared object-cache directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// How cached objects are placed into the working tree.
    #[serde(default)]
    pub cache_link_mode: LinkMode,
}

impl BundleConfig {
    /// Creates a config with defaults for everything but the registry ref.
    pub fn new(registry_ref: impl Into<String>) -> Self {
        Self {
            registry_ref: registry_ref.into(),
            default_tag: default_tag(),
            storage: StorageConfig::default(),
            cache_dir: None,
            cache_link_mode: LinkMode::default(),
        }
    }

    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self)?;
        atomic_write(path, raw.as_bytes())?;
        Ok(())
    }

    /// Rejects configurations that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.registry_ref.is_empty() {
            return Err(Error::Configuration("registry_ref is empty".into()));
        }
        self.storage.validate()
    }

    /// Resolves the object-cache root: explicit config, then the
    /// `MOB_CACHE_DIR` environment variable, then the user cache dir.
    pub fn cache_root(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("MOB_CACHE_DIR") {
            return PathBuf::from(dir);
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("modelops-bundle")
    }
}

/// Storage-routing section of the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Global routing mode.
    pub mode: StorageMode,
    /// In `auto` mode, files at or above this size go to blob storage.
    pub threshold_bytes: u64,
    /// External blob-store provider; [`BlobProvider::None`] means OCI-only.
    pub provider: BlobProvider,
    /// Provider-specific container or bucket name.
    pub container: String,
    /// Optional key prefix inside the container.
    pub prefix: String,
    /// Globs forced onto the registry-layer path regardless of size.
    pub force_oci_patterns: Vec<String>,
    /// Globs forced onto blob storage regardless of size.
    pub force_blob_patterns: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Auto,
            threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            provider: BlobProvider::None,
            container: String::new(),
            prefix: String::new(),
            force_oci_patterns: Vec::new(),
            force_blob_patterns: Vec::new(),
        }
    }
}

impl StorageConfig {
    /// Returns `true` if an external blob provider is configured.
    pub fn has_provider(&self) -> bool {
        self.provider != BlobProvider::None
    }

    fn validate(&self) -> Result<()> {
        if self.has_provider() && self.container.is_empty() {
            return Err(Error::Configuration(format!(
                "storage.provider {} requires storage.container",
                self.provider
            )));
        }
        if self.mode == StorageMode::BlobOnly && !self.has_provider() {
            return Err(Error::Configuration(
                "storage.mode blob-only requires a storage.provider".into(),
            ));
        }
        Ok(())
    }
}

/// Global file-routing mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Route by size threshold.
    #[default]
    Auto,
    /// Everything as registry layers.
    OciInline,
    /// Everything to blob storage.
    BlobOnly,
}

/// External blob-store provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobProvider {
    /// No external store; every file is a registry layer.
    #[default]
    #[serde(rename = "")]
    None,
    /// Azure Blob Storage.
    Azure,
    /// Amazon S3.
    S3,
    /// Google Cloud Storage.
    Gcs,
    /// Local-filesystem store (testing and air-gapped setups).
    Fs,
}

impl fmt::Display for BlobProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self {
            Self::None => "",
            Self::Azure => "azure",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
            Self::Fs => "fs",
        };
        f.write_str(scheme)
    }
}

fn default_tag() -> String {
    DEFAULT_TAG.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_round_trip() {
        let config: BundleConfig =
            serde_yaml::from_str("registry_ref: localhost:5555/models/demo\n").unwrap();
        assert_eq!(config.default_tag, "latest");
        assert_eq!(config.storage.threshold_bytes, DEFAULT_THRESHOLD_BYTES);
        assert_eq!(config.storage.mode, StorageMode::Auto);
        assert!(!config.storage.has_provider());

        let out = serde_yaml::to_string(&config).unwrap();
        let back: BundleConfig = serde_yaml::from_str(&out).unwrap();
        assert_eq!(back.registry_ref, config.registry_ref);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<BundleConfig>(
            "registry_ref: r\nfrobnicate: true\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn provider_parses_from_yaml() {
        let config: BundleConfig = serde_yaml::from_str(
            "registry_ref: r\nstorage:\n  provider: azure\n  container: bundles\n",
        )
        .unwrap();
        assert_eq!(config.storage.provider, BlobProvider::Azure);
        config.validate().unwrap();
    }

    #[test]
    fn blob_only_without_provider_is_config_error() {
        let config: BundleConfig =
            serde_yaml::from_str("registry_ref: r\nstorage:\n  mode: blob-only\n").unwrap();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn provider_requires_container() {
        let config: BundleConfig =
            serde_yaml::from_str("registry_ref: r\nstorage:\n  provider: s3\n").unwrap();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
