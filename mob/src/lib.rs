//! Bundle engine: version model code and data as OCI artifacts.
//!
//! A bundle is a set of tracked files published to a container registry
//! as one artifact: small files as content-addressed layers, large files
//! in external blob storage, and the authoritative file manifest (the
//! bundle index) as the config blob. Every version is identified by an
//! immutable manifest digest; every file by its SHA-256.
//!
//! # Architecture
//!
//! ```text
//! plan/apply (push, pull)
//!  ├── snapshot   — hash the tracked working tree
//!  ├── diff       — three-way: local vs remote vs last sync
//!  ├── policy     — route files to registry layers or blob storage
//!  ├── index      — canonical file manifest (the OCI config blob)
//!  ├── registry   — RegistryAdapter trait (implemented by mob-oci)
//!  ├── blob       — BlobAdapter trait (implemented by mob-blob)
//!  └── mob-cas    — verified content-addressable cache
//! ```
//!
//! Syncs are two-phase: a plan is computed over digests captured up
//! front, then applied with one final tag re-check, so concurrent tag
//! movement surfaces as a conflict instead of silent clobbering.

pub mod apply;
pub mod blob;
pub mod cancel;
pub mod config;
pub mod diff;
pub mod digest;
mod error;
mod fsio;
pub mod ignore;
pub mod index;
pub mod manifest;
pub mod path;
pub mod plan;
pub mod policy;
pub mod project;
pub mod registry;
pub mod scan;
pub mod snapshot;
pub mod state;
pub mod status;
pub mod tracked;

pub use error::{Error, Result};

pub use crate::digest::Digest;
pub use crate::path::RelPath;
pub use crate::project::Project;
