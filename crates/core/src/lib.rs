//! Isolate Core - hashing, metadata and tree primitives for isolated file sets
//!
//! This crate provides the storage-independent layer:
//! - Digest algorithms (SHA-1, BLAKE3) and streaming file hashing
//! - Per-file metadata records and their computation
//! - Input expansion (directories, in-root symlinks, blacklist)
//! - Manifest documents and the low-churn splitting builder
//! - Tree materialization by relative path or by content hash

pub mod error;
pub mod expand;
pub mod fs;
pub mod hash;
pub mod manifest;
pub mod materialize;
pub mod metadata;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use expand::{expand_directories_and_symlinks, Blacklist};
pub use hash::{Digest, HashAlgo, Hasher};
pub use manifest::{Manifest, ManifestBuilder, ManifestEntry, MANIFEST_VERSION};
pub use materialize::{create_isolated_tree, Layout, LinkMode, MaterializeStats, TreeMaterializer};
pub use metadata::{file_to_metadata, FileMetadata, ReadOnly};

/// Structural self-check implemented by every persisted entity.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}
