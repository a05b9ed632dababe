//! Error taxonomy shared by the core and state crates

use std::path::{Path, PathBuf};

/// Errors raised while mapping, hashing, loading or materializing file sets
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A referenced input is missing, inconsistent, or outside the root
    #[error("mapping error: {0}")]
    Mapping(String),

    /// A persisted state file failed OS/version/algorithm/schema validation
    #[error("state error: {0}")]
    State(String),

    /// The dependency description is malformed
    #[error("description error: {0}")]
    Description(String),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn description(msg: impl Into<String>) -> Self {
        Self::Description(msg.into())
    }

    /// Whether this is a validation failure of persisted state
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }
}

/// Result type used throughout isolate-core and isolate-state
pub type Result<T> = std::result::Result<T, Error>;

/// Attach the offending path to an `io::Error`
pub trait IoResultExt<T> {
    fn with_path(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: &Path) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
