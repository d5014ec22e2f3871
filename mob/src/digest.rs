//! SHA-256 content digests in canonical `sha256:{hex}` form.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

/// Chunk size for streamed file hashing.
const HASH_CHUNK: usize = 1024 * 1024;

/// A validated `sha256:` + 64-lowercase-hex content digest.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(String);

impl Digest {
    /// Parses and validates a digest string.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let hex = raw
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidInput(format!("invalid digest {raw:?}")))?;
        let well_formed = hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(Error::InvalidInput(format!("invalid digest {raw:?}")));
        }
        Ok(Self(raw))
    }

    /// Hashes a byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("sha256:{:x}", Sha256::digest(bytes)))
    }

    /// Hashes a file in streamed chunks to bound memory.
    ///
    /// A file that disappears mid-hash surfaces as an I/O error from the
    /// underlying read, which callers may treat as retryable.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(format!("sha256:{:x}", hasher.finalize())))
    }

    /// The full `sha256:{hex}` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 64-character hex part.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }

    /// Abbreviated form for human-facing output (`sha256:ab12cd34`).
    pub fn short(&self) -> String {
        format!("sha256:{}", &self.hex()[..8])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_canonical() {
        let d = Digest::parse(
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        )
        .unwrap();
        assert_eq!(d.hex().len(), 64);
        assert_eq!(d.short(), "sha256:b94d27b9");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in [
            "",
            "sha256:",
            "sha256:abc",
            "sha512:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            "sha256:B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9",
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcdeg",
        ] {
            assert!(Digest::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn bytes_and_file_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(Digest::of_file(&path).unwrap(), Digest::of_bytes(b"hello world"));
    }
}
