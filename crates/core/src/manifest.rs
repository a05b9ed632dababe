//! Manifest documents and the low-churn splitting builder
//!
//! A manifest maps root-relative paths to the content identity needed to rebuild
//! them. Large, rarely changing subtrees are moved into child manifests so that
//! their digests stay stable while the primary manifest churns.

use crate::error::{Error, IoResultExt, Result};
use crate::fs::atomic_write;
use crate::hash::{hash_bytes, Digest, HashAlgo};
use crate::metadata::{FileMetadata, ReadOnly};
use crate::Validate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Version emitted in every manifest
pub const MANIFEST_VERSION: &str = "1.4";

/// Prefix always split into its own child manifest
pub const TEST_DATA_PREFIX: &str = "test/data/";

/// One file of a manifest; `t`/`T` bookkeeping never appears here
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Digest>,
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ManifestEntry {
    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }
}

impl From<&FileMetadata> for ManifestEntry {
    fn from(meta: &FileMetadata) -> Self {
        Self {
            hash: meta.hash,
            symlink_target: meta.symlink_target.clone(),
            mode: meta.mode,
            size: meta.size,
        }
    }
}

impl Validate for ManifestEntry {
    fn validate(&self) -> Result<()> {
        if self.symlink_target.is_some() && (self.hash.is_some() || self.size.is_some()) {
            return Err(Error::mapping(format!("symlink entry cannot carry content: {:?}", self)));
        }
        if self.hash.is_some() != self.size.is_some() {
            return Err(Error::mapping(format!("'h' and 's' must be set together: {:?}", self)));
        }
        Ok(())
    }
}

/// A serialized file set, primary or child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub algo: HashAlgo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    pub files: BTreeMap<String, ManifestEntry>,
    /// Digests of child manifests, in extraction order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<ReadOnly>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_cwd: Option<String>,
    pub version: String,
}

impl Manifest {
    pub fn new(algo: HashAlgo) -> Self {
        Self {
            algo,
            command: Vec::new(),
            files: BTreeMap::new(),
            includes: Vec::new(),
            read_only: None,
            relative_cwd: None,
            version: MANIFEST_VERSION.to_string(),
        }
    }

    /// Canonical bytes: sorted keys, compact separators
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| Error::Json {
            what: "manifest",
            source,
        })
    }

    /// Content identity of this manifest, as referenced from `includes`
    pub fn digest(&self) -> Result<Digest> {
        Ok(hash_bytes(self.algo, &self.to_bytes()?))
    }

    /// Write atomically and return the digest of the written bytes
    pub fn save(&self, path: &Path) -> Result<Digest> {
        let bytes = self.to_bytes()?;
        atomic_write(path, &bytes)?;
        Ok(hash_bytes(self.algo, &bytes))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_path(path)?;
        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|source| Error::Json {
            what: "manifest",
            source,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Total content size in bytes
    pub fn total_size(&self) -> u64 {
        self.files.values().filter_map(|e| e.size).sum()
    }
}

impl Validate for Manifest {
    fn validate(&self) -> Result<()> {
        let major = self.version.split('.').next().unwrap_or_default();
        if major != "1" {
            return Err(Error::mapping(format!("unsupported manifest version '{}'", self.version)));
        }
        for (path, entry) in &self.files {
            if path.is_empty() || path.starts_with('/') || path.split('/').any(|c| c == "..") {
                return Err(Error::mapping(format!("invalid manifest path '{}'", path)));
            }
            entry.validate()?;
            if let Some(hash) = entry.hash {
                if hash.algo() != self.algo {
                    return Err(Error::mapping(format!(
                        "{} is hashed with {} in a {} manifest",
                        path,
                        hash.algo(),
                        self.algo
                    )));
                }
            }
        }
        if let Some(include) = self.includes.iter().find(|d| d.algo() != self.algo) {
            return Err(Error::mapping(format!("include {} uses the wrong algorithm", include)));
        }
        Ok(())
    }
}

/// Serializes a file set, splitting low-churn prefixes into child manifests
///
/// `test/data/` is always split first; further prefixes follow in the order
/// they are added.
pub struct ManifestBuilder {
    manifest: Manifest,
    prefixes: Vec<String>,
}

impl ManifestBuilder {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            prefixes: vec![TEST_DATA_PREFIX.to_string()],
        }
    }

    /// Add a root-relative directory to split out; `.` and empty prefixes are ignored
    pub fn split_prefix(mut self, prefix: &str) -> Self {
        let trimmed = prefix.trim_end_matches('/');
        if trimmed.is_empty() || trimmed == "." {
            debug!("Not splitting on prefix '{}'", prefix);
            return self;
        }
        self.prefixes.push(format!("{}/", trimmed));
        self
    }

    /// Split into (primary, children); the primary's `includes` lists child digests
    pub fn build(self) -> Result<(Manifest, Vec<Manifest>)> {
        let mut primary = self.manifest;
        let mut children = Vec::new();

        for prefix in &self.prefixes {
            let extracted: Vec<String> = primary
                .files
                .keys()
                .filter(|path| path.starts_with(prefix.as_str()))
                .cloned()
                .collect();
            if extracted.is_empty() {
                continue;
            }

            let mut child = Manifest::new(primary.algo);
            child.version = primary.version.clone();
            for path in extracted {
                if let Some(entry) = primary.files.remove(&path) {
                    child.files.insert(path, entry);
                }
            }
            debug!("Split {} files under {} into a child manifest", child.files.len(), prefix);
            children.push(child);
        }

        primary.includes = children
            .iter()
            .map(Manifest::digest)
            .collect::<Result<Vec<_>>>()?;
        Ok((primary, children))
    }

    /// Write children to `<stem>.<index>.isolated`, then the primary to `path`
    ///
    /// Returns the written file names, children first.
    pub fn save(self, path: &Path) -> Result<Vec<String>> {
        let (primary, children) = self.build()?;

        let mut written = Vec::with_capacity(children.len() + 1);
        for (index, child) in children.iter().enumerate() {
            let child_path = child_manifest_path(path, index)?;
            child.save(&child_path)?;
            written.push(file_name(&child_path)?);
        }

        let digest = primary.save(path)?;
        written.push(file_name(path)?);
        info!(
            "Wrote {} ({} files, {} children, {})",
            path.display(),
            primary.files.len(),
            children.len(),
            digest
        );
        Ok(written)
    }
}

/// `<dir>/foo.isolated` -> `<dir>/foo.<index>.isolated`
pub fn child_manifest_path(primary: &Path, index: usize) -> Result<PathBuf> {
    let name = file_name(primary)?;
    let stem = name.strip_suffix(".isolated").unwrap_or(&name);
    Ok(primary.with_file_name(format!("{}.{}.isolated", stem, index)))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::mapping(format!("{} has no usable file name", path.display())))
}
