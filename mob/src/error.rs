//! Error types for bundle operations.

use std::io;

/// Alias for `Result<T, mob::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by bundle engine operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed digest, illegal path, or otherwise invalid user input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The configuration cannot support the requested operation.
    #[error("configuration: {0}")]
    Configuration(String),

    /// Local filesystem error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Transient registry or blob-store failure; retrying may help.
    #[error("network: {0}")]
    Network(String),

    /// A tag, manifest, or blob is absent from the registry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Fetched content did not hash to its declared digest.
    #[error("content for {digest} hashed to {actual}")]
    DigestMismatch {
        /// Digest the content was declared under.
        digest: String,
        /// Digest the fetched bytes actually hash to.
        actual: String,
    },

    /// The tag moved since the last sync; pull to reconcile, then push.
    #[error("tag {tag:?} moved since last sync (expected {expected:?}, found {found:?}); pull to reconcile, then push")]
    TagMoved {
        /// The tag that was checked.
        tag: String,
        /// Digest recorded at the last sync, if any.
        expected: Option<String>,
        /// Digest the tag currently resolves to, if any.
        found: Option<String>,
    },

    /// Pulling would overwrite or delete local state.
    #[error("refusing to touch local changes (pass --overwrite to proceed):\n{0}")]
    SafetyGuard(String),

    /// Another process holds this project's lock.
    #[error("another process is operating on this project")]
    ProjectBusy,

    /// A cancellation signal was observed.
    #[error("operation canceled")]
    Canceled,

    /// JSON (de)serialization error for persisted state or manifests.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML error while reading or writing the project config.
    #[error("config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) => 2,
            Self::Configuration(_) | Self::Yaml(_) => 3,
            Self::Network(_) | Self::NotFound(_) => 4,
            Self::SafetyGuard(_) => 5,
            Self::TagMoved { .. } => 6,
            Self::DigestMismatch { .. } => 7,
            Self::Canceled => 8,
            _ => 1,
        }
    }
}

impl From<mob_cas::Error> for Error {
    fn from(e: mob_cas::Error) -> Self {
        match e {
            mob_cas::Error::DigestMismatch { digest, actual } => {
                Self::DigestMismatch { digest, actual }
            }
            mob_cas::Error::InvalidDigest(d) => Self::InvalidInput(format!("invalid digest {d:?}")),
            mob_cas::Error::NotFound(d) => Self::NotFound(format!("cached object {d}")),
            mob_cas::Error::Symlink(p) => {
                Self::InvalidInput(format!("symlink in cache: {}", p.display()))
            }
            mob_cas::Error::Io(e) => Self::Io(e),
            // Fetch callbacks in this crate always box a `mob::Error`.
            mob_cas::Error::Fetch(inner) => match inner.downcast::<Self>() {
                Ok(e) => *e,
                Err(other) => Self::Network(other.to_string()),
            },
            other => Self::Io(io::Error::other(other.to_string())),
        }
    }
}
