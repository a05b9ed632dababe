//! Digest algorithms and streaming file hashing

use crate::error::{Error, IoResultExt, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Digest as _;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Files at least this large are hashed through a memory map
pub const MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hash algorithm used for file content and manifest identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgo {
    #[default]
    #[serde(rename = "sha-1")]
    Sha1,
    #[serde(rename = "blake3")]
    Blake3,
}

impl HashAlgo {
    /// Human-readable name, as persisted in manifests and state files
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha-1",
            Self::Blake3 => "blake3",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sha-1" => Ok(Self::Sha1),
            "blake3" => Ok(Self::Blake3),
            other => Err(Error::state(format!("unknown algo '{}'", other))),
        }
    }

    /// Digest length in bytes
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Blake3 => 32,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            Self::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            Self::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Digest of zero bytes of input
    pub fn empty_digest(self) -> Digest {
        hash_bytes(self, b"")
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A content digest tagged with the algorithm that produced it
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Digest {
    Sha1([u8; 20]),
    Blake3([u8; 32]),
}

impl Digest {
    pub fn algo(&self) -> HashAlgo {
        match self {
            Self::Sha1(_) => HashAlgo::Sha1,
            Self::Blake3(_) => HashAlgo::Blake3,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(bytes) => bytes,
            Self::Blake3(bytes) => bytes,
        }
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Parse a hex digest; the algorithm is implied by its length
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::mapping(format!("invalid digest '{}': {}", s, e)))?;
        match bytes.len() {
            20 => {
                let mut out = [0u8; 20];
                out.copy_from_slice(&bytes);
                Ok(Self::Sha1(out))
            }
            32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&bytes);
                Ok(Self::Blake3(out))
            }
            n => Err(Error::mapping(format!(
                "invalid digest '{}': unsupported length {} bytes",
                s, n
            ))),
        }
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}:{})", self.algo(), self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher for building digests across multiple chunks
pub enum Hasher {
    Sha1(sha1::Sha1),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Self::Sha1(h) => Digest::Sha1(h.finalize().into()),
            Self::Blake3(h) => Digest::Blake3(*h.finalize().as_bytes()),
        }
    }
}

/// Hash bytes with the given algorithm
pub fn hash_bytes(algo: HashAlgo, data: &[u8]) -> Digest {
    let mut hasher = algo.hasher();
    hasher.update(data);
    hasher.finalize()
}

/// Hash a file by streaming its content
pub fn hash_file(path: &Path, algo: HashAlgo) -> Result<Digest> {
    let mut file = File::open(path).with_path(path)?;
    let mut hasher = algo.hasher();

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer).with_path(path)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Hash a file using memory-mapped I/O (for large files)
pub fn hash_file_mmap(path: &Path, algo: HashAlgo) -> Result<Digest> {
    use memmap2::Mmap;

    let file = File::open(path).with_path(path)?;
    // The mapping is only read while the file handle is alive.
    let mmap = unsafe { Mmap::map(&file) }.with_path(path)?;
    Ok(hash_bytes(algo, &mmap))
}

/// Hash a file of known size, picking the read strategy by size
pub fn hash_file_sized(path: &Path, size: u64, algo: HashAlgo) -> Result<Digest> {
    if size >= MMAP_THRESHOLD {
        hash_file_mmap(path, algo)
    } else {
        hash_file(path, algo)
    }
}
