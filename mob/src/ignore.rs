//! Include/exclude rules for workspace scanning.
//!
//! Rules are globs over project-relative POSIX paths. A trailing `/`
//! matches the whole directory subtree. Precedence: explicit includes
//! override explicit excludes, which override the built-in defaults.
//! Force-added tracked paths bypass the matcher entirely.

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

use crate::path::RelPath;
use crate::{Error, Result};

/// Patterns that are always excluded: our own metadata, VCS internals,
/// OS junk, and editor autosaves.
const DEFAULT_EXCLUDES: &[&str] = &[
    ".modelops-bundle/",
    ".git/",
    ".hg/",
    ".svn/",
    "**/.DS_Store",
    "**/Thumbs.db",
    "**/desktop.ini",
    "**/*.swp",
    "**/*.swo",
    "**/*~",
    "**/.#*",
];

/// One user rule: a glob, either re-including or excluding matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// The glob pattern, POSIX-form.
    pub pattern: String,
    /// `true` re-includes matches that a later rule or default excludes.
    pub include: bool,
}

impl Rule {
    /// Parses one line of an ignore file: `!pattern` re-includes,
    /// anything else excludes. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        match line.strip_prefix('!') {
            Some(rest) => Some(Self {
                pattern: rest.to_owned(),
                include: true,
            }),
            None => Some(Self {
                pattern: line.to_owned(),
                include: false,
            }),
        }
    }
}

/// Compiled matcher deciding which working-tree paths the scanner admits.
#[derive(Debug)]
pub struct IgnoreMatcher {
    includes: GlobSet,
    excludes: GlobSet,
    defaults: GlobSet,
}

impl IgnoreMatcher {
    /// Compiles a matcher from user rules plus the built-in defaults.
    pub fn new(rules: &[Rule]) -> Result<Self> {
        let mut includes = GlobSetBuilder::new();
        let mut excludes = GlobSetBuilder::new();
        for rule in rules {
            let target = if rule.include { &mut includes } else { &mut excludes };
            for glob in compile(&rule.pattern)? {
                target.add(glob);
            }
        }
        let mut defaults = GlobSetBuilder::new();
        for pattern in DEFAULT_EXCLUDES {
            for glob in compile(pattern)? {
                defaults.add(glob);
            }
        }
        Ok(Self {
            includes: build(includes)?,
            excludes: build(excludes)?,
            defaults: build(defaults)?,
        })
    }

    /// Matcher with only the built-in defaults.
    pub fn defaults_only() -> Result<Self> {
        Self::new(&[])
    }

    /// Parses rules from ignore-file content (one pattern per line).
    pub fn from_lines(content: &str) -> Result<Self> {
        let rules: Vec<Rule> = content.lines().filter_map(Rule::parse).collect();
        Self::new(&rules)
    }

    /// Returns `true` if the path should be skipped by the scanner.
    pub fn is_excluded(&self, path: &RelPath) -> bool {
        let p = path.as_str();
        if self.includes.is_match(p) {
            return false;
        }
        self.excludes.is_match(p) || self.defaults.is_match(p)
    }
}

/// Compiles one pattern; `dir/` expands to the directory itself plus its
/// whole subtree.
fn compile(pattern: &str) -> Result<Vec<Glob>> {
    let expansions = match pattern.strip_suffix('/') {
        Some(dir) => vec![dir.to_owned(), format!("{dir}/**")],
        None => vec![pattern.to_owned()],
    };
    expansions
        .iter()
        .map(|raw| {
            GlobBuilder::new(raw)
                .literal_separator(true)
                .build()
                .map_err(|e| Error::InvalidInput(format!("bad ignore pattern {pattern:?}: {e}")))
        })
        .collect()
}

fn build(builder: GlobSetBuilder) -> Result<GlobSet> {
    builder
        .build()
        .map_err(|e| Error::InvalidInput(format!("ignore rules: {e}")))
}
