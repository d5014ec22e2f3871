//! Project-relative POSIX paths.
//!
//! Every persisted or wire-serialized path in a bundle is a [`RelPath`]:
//! forward slashes, relative to the project root, with no `.`/`..`
//! components. Conversion to the platform's native form happens only at
//! disk I/O time.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// A validated project-relative POSIX path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelPath(String);

impl RelPath {
    /// Validates and wraps a POSIX-form relative path.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate(&path)?;
        Ok(Self(path))
    }

    /// Converts a native path under `root` into its project-relative form.
    pub fn from_native(path: &Path, root: &Path) -> Result<Self> {
        let rel = path.strip_prefix(root).map_err(|_| {
            Error::InvalidInput(format!("{} is outside the project root", path.display()))
        })?;
        let mut segments = Vec::new();
        for component in rel.components() {
            match component {
                std::path::Component::Normal(part) => {
                    segments.push(part.to_str().ok_or_else(|| {
                        Error::InvalidInput(format!("non-UTF-8 path: {}", path.display()))
                    })?);
                }
                other => {
                    return Err(Error::InvalidInput(format!(
                        "unexpected path component {other:?} in {}",
                        path.display()
                    )));
                }
            }
        }
        Self::new(segments.join("/"))
    }

    /// Returns the POSIX string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves this path against a native root directory.
    pub fn to_native(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for segment in self.0.split('/') {
            out.push(segment);
        }
        out
    }

    /// Returns `true` if this path is `dir` or lies underneath it.
    pub fn starts_with_dir(&self, dir: &str) -> bool {
        let dir = dir.trim_end_matches('/');
        self.0 == dir || self.0.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for RelPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for RelPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Rejects absolute, traversing, and otherwise malformed paths.
fn validate(path: &str) -> Result<()> {
    let fail = |why: &str| Err(Error::InvalidInput(format!("illegal path {path:?}: {why}")));
    if path.is_empty() {
        return fail("empty");
    }
    if path.contains('\0') {
        return fail("embedded NUL");
    }
    if path.contains('\\') {
        return fail("backslash; paths are POSIX-form");
    }
    if path.starts_with('/') {
        return fail("absolute path");
    }
    if path.ends_with('/') {
        return fail("trailing slash");
    }
    for segment in path.split('/') {
        match segment {
            "" => return fail("empty component"),
            "." | ".." => return fail("relative component"),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_normal_paths() {
        for ok in ["a", "src/model.py", "data/weights.bin", "deep/ly/nest/ed/file"] {
            assert!(RelPath::new(ok).is_ok(), "rejected {ok}");
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in [
            "",
            "/etc/passwd",
            "a/../b",
            "./a",
            "..",
            "a//b",
            "a/",
            "a\\b",
            "a\0b",
        ] {
            assert!(RelPath::new(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn native_round_trip() {
        let root = Path::new("/proj");
        let rel = RelPath::new("src/model.py").unwrap();
        let native = rel.to_native(root);
        assert_eq!(RelPath::from_native(&native, root).unwrap(), rel);
    }

    #[test]
    fn dir_prefix() {
        let rel = RelPath::new("src/model.py").unwrap();
        assert!(rel.starts_with_dir("src"));
        assert!(rel.starts_with_dir("src/"));
        assert!(!rel.starts_with_dir("sr"));
        assert!(RelPath::new("src").unwrap().starts_with_dir("src"));
    }
}
