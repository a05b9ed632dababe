//! Per-file metadata records and their computation from the file system

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{hash_file_sized, Digest, HashAlgo};
use crate::Validate;
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Read-only policy applied to a materialized tree
///
/// Persisted as an integer: 0 = writable, 1 = files read-only, 2 = everything
/// read-only (directories included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ReadOnly {
    Writable,
    Files,
    Tree,
}

impl ReadOnly {
    pub fn level(self) -> u8 {
        match self {
            Self::Writable => 0,
            Self::Files => 1,
            Self::Tree => 2,
        }
    }

    /// Whether materialized files must not be writable
    pub fn restricts_files(self) -> bool {
        self != Self::Writable
    }
}

impl TryFrom<u8> for ReadOnly {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Writable),
            1 => Ok(Self::Files),
            2 => Ok(Self::Tree),
            other => Err(format!("invalid read_only value {}", other)),
        }
    }
}

impl From<ReadOnly> for u8 {
    fn from(value: ReadOnly) -> Self {
        value.level()
    }
}

/// Metadata tracked for one path of the dependency set
///
/// Exactly one of these shapes is valid:
/// - `symlink_target` set (no hash, no size)
/// - `hash` and `size` set
/// - neither, pending hashing (`touched` and `mtime` may be present)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMetadata {
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Digest>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    /// Modification time in nanoseconds since the epoch; bookkeeping for the fast path
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(rename = "T", default, skip_serializing_if = "std::ops::Not::not")]
    pub touched: bool,
}

impl FileMetadata {
    /// A record awaiting hashing
    pub fn pending() -> Self {
        Self::default()
    }

    /// A touched record awaiting hashing
    pub fn touched() -> Self {
        Self {
            touched: true,
            ..Self::default()
        }
    }

    pub fn file(hash: Digest, size: u64) -> Self {
        Self {
            hash: Some(hash),
            size: Some(size),
            ..Self::default()
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        Self {
            symlink_target: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }

    /// Neither content nor link target known yet
    pub fn is_pending(&self) -> bool {
        self.hash.is_none() && self.size.is_none() && self.symlink_target.is_none()
    }
}

impl Validate for FileMetadata {
    fn validate(&self) -> Result<()> {
        if self.symlink_target.is_some() && (self.hash.is_some() || self.size.is_some()) {
            return Err(Error::mapping(format!(
                "symlink entry cannot carry content: {:?}",
                self
            )));
        }
        match (&self.hash, self.size) {
            (Some(_), None) => Err(Error::mapping(format!("hash without size: {:?}", self))),
            (None, Some(_)) => Err(Error::mapping(format!("size without hash: {:?}", self))),
            _ => Ok(()),
        }
    }
}

/// Compute the metadata of `path`, reusing `prev` where it is provably current
///
/// The previous hash (or link target) is reused only when the modification
/// time, and for files the size, are unchanged; otherwise the content is read
/// again. Touched entries only need to exist: they are recorded as empty
/// content so they never influence the cache key.
pub fn file_to_metadata(
    path: &Path,
    prev: &FileMetadata,
    read_only: Option<ReadOnly>,
    algo: HashAlgo,
) -> Result<FileMetadata> {
    let stat = match std::fs::symlink_metadata(path) {
        Ok(stat) => stat,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::mapping(format!("{} is missing", path.display())));
        }
        Err(e) => return Err(e).with_path(path),
    };

    if prev.touched {
        return Ok(FileMetadata {
            hash: Some(algo.empty_digest()),
            size: Some(0),
            touched: true,
            ..FileMetadata::default()
        });
    }

    let is_link = stat.file_type().is_symlink();
    let mut out = FileMetadata {
        mtime: Some(mtime_nanos(&stat)),
        ..FileMetadata::default()
    };

    if is_link {
        if prev.mtime == out.mtime && prev.symlink_target.is_some() {
            out.symlink_target = prev.symlink_target.clone();
        } else {
            let target = std::fs::read_link(path).with_path(path)?;
            let target = target.to_str().ok_or_else(|| {
                Error::mapping(format!("{} points to a non UTF-8 path", path.display()))
            })?;
            out.symlink_target = Some(target.to_string());
        }
        return Ok(out);
    }

    if stat.is_dir() {
        return Err(Error::mapping(format!(
            "{} is a directory, expected a file",
            path.display()
        )));
    }

    out.mode = normalized_mode(&stat, read_only);
    let size = stat.len();
    out.size = Some(size);

    let reusable = prev
        .hash
        .filter(|h| h.algo() == algo && prev.mtime == out.mtime && prev.size == out.size);
    out.hash = match reusable {
        Some(hash) => Some(hash),
        None => {
            debug!("Hashing {}", path.display());
            Some(hash_file_sized(path, size, algo)?)
        }
    };

    Ok(out)
}

/// Permission bits as they should be reproduced on the consumer side
///
/// Group-write and all "other" bits are dropped; owner-write is dropped when the
/// tree is read-only; group-execute mirrors owner-execute.
#[cfg(unix)]
fn normalized_mode(stat: &Metadata, read_only: Option<ReadOnly>) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;

    let mut mode = stat.permissions().mode() & 0o7777;
    mode &= !(0o020 | 0o007);
    if read_only.is_some_and(ReadOnly::restricts_files) {
        mode &= !0o200;
    }
    if mode & 0o100 != 0 {
        mode |= 0o010;
    } else {
        mode &= !0o010;
    }
    Some(mode)
}

#[cfg(not(unix))]
fn normalized_mode(_stat: &Metadata, _read_only: Option<ReadOnly>) -> Option<u32> {
    None
}

fn mtime_nanos(stat: &Metadata) -> i64 {
    let nanos = match stat.modified().map(|t| t.duration_since(UNIX_EPOCH)) {
        Ok(Ok(d)) => d.as_nanos() as i128,
        Ok(Err(before_epoch)) => -(before_epoch.duration().as_nanos() as i128),
        Err(_) => 0,
    };
    nanos.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
