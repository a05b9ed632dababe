//! Persistent incremental state kept next to a manifest as `<manifest>.state`
//!
//! The state is OS specific and versioned: a file written by another platform,
//! another state revision or another hash algorithm is discarded rather than
//! trusted.

use isolate_core::fs::{atomic_write, from_slash, normalize_path, relative_path, to_slash};
use isolate_core::{
    Digest, Error, FileMetadata, HashAlgo, Manifest, ManifestEntry, ReadOnly, Result, Validate,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// `<manifest version>.<state revision>`; any other value invalidates a state file
pub const STATE_VERSION: &str = "1.4.2";

/// Paths added to or removed from the tracked set by one refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSetDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Entries whose touched flag flipped and must be recomputed
    pub reset: Vec<String>,
}

impl FileSetDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reset.is_empty()
    }
}

/// Everything remembered between two refreshes of one manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SavedState {
    #[serde(rename = "OS")]
    pub os: String,
    pub algo: HashAlgo,
    /// Child manifest file names written by the last save
    #[serde(default)]
    pub child_isolated_files: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub config_variables: BTreeMap<String, String>,
    /// Digest of the description file as of the last refresh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_digest: Option<Digest>,
    #[serde(default)]
    pub extra_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub files: BTreeMap<String, FileMetadata>,
    /// Description path, relative to the state's directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolate_file: Option<String>,
    #[serde(default)]
    pub path_variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<ReadOnly>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,
    pub version: String,

    /// Directory holding the manifest and this state
    #[serde(skip)]
    basedir: PathBuf,
}

impl SavedState {
    /// An empty state rooted at `basedir`
    pub fn new(basedir: &Path, algo: HashAlgo) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            algo,
            child_isolated_files: Vec::new(),
            command: Vec::new(),
            config_variables: BTreeMap::new(),
            description_digest: None,
            extra_variables: BTreeMap::new(),
            files: BTreeMap::new(),
            isolate_file: None,
            path_variables: BTreeMap::new(),
            read_only: None,
            relative_cwd: None,
            root_dir: None,
            version: STATE_VERSION.to_string(),
            basedir: normalize_path(basedir),
        }
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Decode and validate a state document
    ///
    /// Every failure is a state error. A recorded description that no longer
    /// exists is forgotten so it can be specified again.
    pub fn load(data: &[u8], basedir: &Path) -> Result<Self> {
        let mut state: SavedState = serde_json::from_slice(data)
            .map_err(|e| Error::state(format!("invalid state document: {}", e)))?;
        state.basedir = normalize_path(basedir);

        state.validate().map_err(|e| match e {
            Error::State(_) => e,
            other => Error::state(other.to_string()),
        })?;

        if let Some(description) = state.isolate_filepath() {
            if !description.is_file() {
                info!(
                    "Description {} is gone; it must be specified again",
                    description.display()
                );
                state.isolate_file = None;
                state.description_digest = None;
            }
        }
        Ok(state)
    }

    /// Load `path`, falling back to an empty state when it is absent or invalid
    pub fn load_file(path: &Path, basedir: &Path, algo: HashAlgo) -> Self {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved state at {}", path.display());
                return Self::new(basedir, algo);
            }
            Err(e) => {
                warn!("Discarding unreadable state {}: {}", path.display(), e);
                return Self::new(basedir, algo);
            }
        };

        match Self::load(&data, basedir) {
            Ok(state) if state.algo != algo => {
                warn!(
                    "Discarding state {} hashed with {} (configured: {})",
                    path.display(),
                    state.algo,
                    algo
                );
                Self::new(basedir, algo)
            }
            Ok(state) => state,
            Err(e) => {
                warn!("Discarding state {}: {}", path.display(), e);
                Self::new(basedir, algo)
            }
        }
    }

    /// Persist atomically as compact JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec(self).map_err(|source| Error::Json {
            what: "state",
            source,
        })?;
        atomic_write(path, &data)
    }

    pub fn update_config(&mut self, config_variables: &BTreeMap<String, String>) {
        self.config_variables
            .extend(config_variables.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Record the description path and merge path/extra variables
    ///
    /// A state is bound to a single description; a different one is an error.
    pub fn update(
        &mut self,
        description: &Path,
        path_variables: &BTreeMap<String, String>,
        extra_variables: &BTreeMap<String, String>,
    ) -> Result<()> {
        let relative = self.relative_to_basedir(description)?;
        if let Some(recorded) = &self.isolate_file {
            if *recorded != relative {
                return Err(Error::state(format!(
                    "state is bound to {} but {} was given",
                    recorded, relative
                )));
            }
        }
        self.isolate_file = Some(relative);
        self.extra_variables
            .extend(extra_variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.path_variables
            .extend(path_variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    /// Diff the tracked set against the description's current file set
    ///
    /// New paths get pending records, vanished paths are dropped and a record
    /// whose touched flag flips starts over. `command`, `read_only` and
    /// `relative_cwd` are replaced as given.
    pub fn update_isolated(
        &mut self,
        command: Vec<String>,
        infiles: &[String],
        touched: &[String],
        read_only: Option<ReadOnly>,
        relative_cwd: String,
    ) -> FileSetDiff {
        let touched_set: BTreeSet<&str> = touched.iter().map(String::as_str).collect();
        let wanted: BTreeSet<&str> = infiles
            .iter()
            .map(String::as_str)
            .chain(touched_set.iter().copied())
            .collect();

        let mut diff = FileSetDiff::default();

        self.files.retain(|path, _| {
            let keep = wanted.contains(path.as_str());
            if !keep {
                diff.removed.push(path.clone());
            }
            keep
        });

        for path in &wanted {
            let is_touched = touched_set.contains(path);
            let fresh = || {
                if is_touched {
                    FileMetadata::touched()
                } else {
                    FileMetadata::pending()
                }
            };
            match self.files.get_mut(*path) {
                None => {
                    self.files.insert(path.to_string(), fresh());
                    diff.added.push(path.to_string());
                }
                Some(meta) if meta.touched != is_touched => {
                    *meta = fresh();
                    diff.reset.push(path.to_string());
                }
                Some(_) => {}
            }
        }

        self.command = command;
        self.read_only = read_only;
        self.relative_cwd = Some(relative_cwd);

        debug!(
            "update_isolated: +{} -{} ~{}",
            diff.added.len(),
            diff.removed.len(),
            diff.reset.len()
        );
        diff
    }

    /// The manifest document for the tracked set, bookkeeping stripped
    pub fn to_manifest(&self) -> Manifest {
        let mut manifest = Manifest::new(self.algo);
        manifest.command = self.command.clone();
        manifest.files = self
            .files
            .iter()
            .map(|(path, meta)| (path.clone(), ManifestEntry::from(meta)))
            .collect();
        manifest.read_only = self.read_only;
        manifest.relative_cwd = self.relative_cwd.clone().filter(|cwd| !cwd.is_empty());
        manifest
    }

    /// Absolute path of the recorded description
    pub fn isolate_filepath(&self) -> Option<PathBuf> {
        self.isolate_file
            .as_ref()
            .map(|rel| normalize_path(&self.basedir.join(from_slash(rel))))
    }

    /// `path` relative to the state's directory, `/`-separated
    pub fn relative_to_basedir(&self, path: &Path) -> Result<String> {
        to_slash(&relative_path(&normalize_path(path), &self.basedir))
    }
}

impl Validate for SavedState {
    fn validate(&self) -> Result<()> {
        if self.os != std::env::consts::OS {
            return Err(Error::state(format!("Unexpected OS {}", self.os)));
        }
        if self.version != STATE_VERSION {
            return Err(Error::state(format!("Unsupported version '{}'", self.version)));
        }
        for (path, meta) in &self.files {
            meta.validate()
                .map_err(|e| Error::state(format!("{}: {}", path, e)))?;
            if let Some(hash) = meta.hash {
                if hash.algo() != self.algo {
                    return Err(Error::state(format!(
                        "{} was hashed with {}, state uses {}",
                        path,
                        hash.algo(),
                        self.algo
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for SavedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn vars(f: &mut fmt::Formatter<'_>, name: &str, map: &BTreeMap<String, String>) -> fmt::Result {
            write!(f, "  {}:", name)?;
            for (k, v) in map {
                write!(f, "\n    {}={}", k, v)?;
            }
            writeln!(f)
        }

        writeln!(f, "SavedState(")?;
        writeln!(f, "  command: {:?}", self.command)?;
        writeln!(f, "  files: {}", self.files.len())?;
        writeln!(f, "  isolate_file: {}", self.isolate_file.as_deref().unwrap_or("None"))?;
        writeln!(
            f,
            "  read_only: {}",
            self.read_only.map(|r| r.level().to_string()).unwrap_or_else(|| "None".into())
        )?;
        writeln!(f, "  relative_cwd: {}", self.relative_cwd.as_deref().unwrap_or("None"))?;
        writeln!(f, "  child_isolated_files: {:?}", self.child_isolated_files)?;
        vars(f, "path_variables", &self.path_variables)?;
        vars(f, "config_variables", &self.config_variables)?;
        vars(f, "extra_variables", &self.extra_variables)?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolate_core::hash::hash_bytes;
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn hashed(content: &[u8]) -> FileMetadata {
        FileMetadata::file(hash_bytes(HashAlgo::Sha1, content), content.len() as u64)
    }

    #[test]
    fn test_update_isolated_diff() {
        let temp = TempDir::new().unwrap();
        let mut state = SavedState::new(temp.path(), HashAlgo::Sha1);
        state.update_isolated(vec![], &strings(&["a", "b", "c"]), &[], None, ".".into());
        state.files.insert("b".into(), hashed(b"b"));

        let diff = state.update_isolated(
            strings(&["run"]),
            &strings(&["b", "c", "d"]),
            &[],
            Some(ReadOnly::Files),
            "sub".into(),
        );

        assert_eq!(diff.added, vec!["d"]);
        assert_eq!(diff.removed, vec!["a"]);
        assert!(diff.reset.is_empty());
        assert_eq!(state.files.keys().collect::<Vec<_>>(), vec!["b", "c", "d"]);
        // Surviving entries keep their cached metadata
        assert_eq!(state.files["b"], hashed(b"b"));
        assert!(state.files["d"].is_pending());
        assert_eq!(state.command, vec!["run"]);
        assert_eq!(state.read_only, Some(ReadOnly::Files));
        assert_eq!(state.relative_cwd.as_deref(), Some("sub"));
    }

    #[test]
    fn test_read_only_is_overwritten_wholesale() {
        let temp = TempDir::new().unwrap();
        let mut state = SavedState::new(temp.path(), HashAlgo::Sha1);
        state.update_isolated(vec![], &[], &[], Some(ReadOnly::Tree), ".".into());
        state.update_isolated(vec![], &[], &[], None, ".".into());
        assert_eq!(state.read_only, None);
    }

    #[test]
    fn test_touched_flip_resets_entry() {
        let temp = TempDir::new().unwrap();
        let mut state = SavedState::new(temp.path(), HashAlgo::Sha1);
        state.files.insert("log".into(), hashed(b"content"));

        let diff = state.update_isolated(vec![], &[], &strings(&["log"]), None, ".".into());
        assert_eq!(diff.reset, vec!["log"]);
        assert_eq!(state.files["log"], FileMetadata::touched());

        let diff = state.update_isolated(vec![], &strings(&["log"]), &[], None, ".".into());
        assert_eq!(diff.reset, vec!["log"]);
        assert!(state.files["log"].is_pending());
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("foo.isolated.state");
        let mut state = SavedState::new(temp.path(), HashAlgo::Sha1);
        state.update_isolated(strings(&["x"]), &strings(&["a"]), &[], Some(ReadOnly::Files), ".".into());
        state.files.insert("a".into(), hashed(b"a"));
        state.root_dir = Some(temp.path().to_path_buf());
        state.save(&path).unwrap();

        let loaded = SavedState::load_file(&path, temp.path(), HashAlgo::Sha1);
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let temp = TempDir::new().unwrap();
        let state = SavedState::new(temp.path(), HashAlgo::Sha1);
        let value = serde_json::to_value(&state).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["OS"], std::env::consts::OS);
        assert_eq!(obj["algo"], "sha-1");
        assert_eq!(obj["version"], STATE_VERSION);
        for absent in ["isolate_file", "read_only", "relative_cwd", "root_dir", "description_digest"] {
            assert!(!obj.contains_key(absent), "{} should be omitted", absent);
        }
    }

    #[test]
    fn test_os_and_version_mismatch_are_state_errors() {
        let temp = TempDir::new().unwrap();
        let state = SavedState::new(temp.path(), HashAlgo::Sha1);
        let mut value = serde_json::to_value(&state).unwrap();

        value["OS"] = "plan9".into();
        let err = SavedState::load(value.to_string().as_bytes(), temp.path()).unwrap_err();
        assert!(err.is_state());

        value["OS"] = std::env::consts::OS.into();
        value["version"] = "1.4.1".into();
        let err = SavedState::load(value.to_string().as_bytes(), temp.path()).unwrap_err();
        assert!(err.is_state());

        // load_file falls back to an empty state
        let path = temp.path().join("foo.isolated.state");
        std::fs::write(&path, value.to_string()).unwrap();
        let loaded = SavedState::load_file(&path, temp.path(), HashAlgo::Sha1);
        assert_eq!(loaded.version, STATE_VERSION);
        assert!(loaded.files.is_empty());
    }

    #[test]
    fn test_unknown_fields_and_algo_are_state_errors() {
        let temp = TempDir::new().unwrap();
        let base = serde_json::to_value(SavedState::new(temp.path(), HashAlgo::Sha1)).unwrap();

        let mut extra = base.clone();
        extra["bogus"] = 1.into();
        assert!(SavedState::load(extra.to_string().as_bytes(), temp.path())
            .unwrap_err()
            .is_state());

        let mut algo = base;
        algo["algo"] = "md5".into();
        assert!(SavedState::load(algo.to_string().as_bytes(), temp.path())
            .unwrap_err()
            .is_state());
    }

    #[test]
    fn test_inconsistent_metadata_is_state_error() {
        let temp = TempDir::new().unwrap();
        let mut value = serde_json::to_value(SavedState::new(temp.path(), HashAlgo::Sha1)).unwrap();
        value["files"] = serde_json::json!({"a": {"s": 3}});
        assert!(SavedState::load(value.to_string().as_bytes(), temp.path())
            .unwrap_err()
            .is_state());
    }

    #[test]
    fn test_algo_mismatch_discards_state() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("foo.isolated.state");
        let mut state = SavedState::new(temp.path(), HashAlgo::Sha1);
        state.files.insert("a".into(), hashed(b"a"));
        state.save(&path).unwrap();

        let loaded = SavedState::load_file(&path, temp.path(), HashAlgo::Blake3);
        assert_eq!(loaded.algo, HashAlgo::Blake3);
        assert!(loaded.files.is_empty());
    }

    #[test]
    fn test_stale_description_is_dropped_on_load() {
        let temp = TempDir::new().unwrap();
        let description = temp.path().join("foo.isolate");
        std::fs::write(&description, "{}").unwrap();

        let mut state = SavedState::new(temp.path(), HashAlgo::Sha1);
        state
            .update(&description, &BTreeMap::new(), &BTreeMap::new())
            .unwrap();
        assert_eq!(state.isolate_file.as_deref(), Some("foo.isolate"));
        let data = serde_json::to_vec(&state).unwrap();

        let kept = SavedState::load(&data, temp.path()).unwrap();
        assert_eq!(kept.isolate_filepath(), Some(description.clone()));

        std::fs::remove_file(&description).unwrap();
        let dropped = SavedState::load(&data, temp.path()).unwrap();
        assert!(dropped.isolate_file.is_none());
    }

    #[test]
    fn test_update_rejects_a_different_description() {
        let temp = TempDir::new().unwrap();
        let mut state = SavedState::new(temp.path(), HashAlgo::Sha1);
        let mut extra = BTreeMap::new();
        extra.insert("EXECUTABLE_SUFFIX".to_string(), String::new());

        state
            .update(&temp.path().join("a.isolate"), &BTreeMap::new(), &extra)
            .unwrap();
        assert_eq!(state.extra_variables, extra);
        assert!(state
            .update(&temp.path().join("b.isolate"), &BTreeMap::new(), &BTreeMap::new())
            .unwrap_err()
            .is_state());
    }

    #[test]
    fn test_to_manifest_strips_bookkeeping() {
        let temp = TempDir::new().unwrap();
        let mut state = SavedState::new(temp.path(), HashAlgo::Sha1);
        let mut meta = hashed(b"a");
        meta.mtime = Some(42);
        state.files.insert("a".into(), meta);
        state.config_variables.insert("OS".into(), "linux".into());
        state.relative_cwd = Some(".".into());

        let manifest = state.to_manifest();
        let json = String::from_utf8(manifest.to_bytes().unwrap()).unwrap();
        assert!(!json.contains("\"t\""));
        assert!(!json.contains("config_variables"));
        assert!(json.contains("\"relative_cwd\":\".\""));
        assert_eq!(manifest.version, isolate_core::MANIFEST_VERSION);
        assert!(STATE_VERSION.starts_with(isolate_core::MANIFEST_VERSION));
    }

    #[test]
    fn test_display_summary() {
        let temp = TempDir::new().unwrap();
        let mut state = SavedState::new(temp.path(), HashAlgo::Sha1);
        state.path_variables.insert("PRODUCT_DIR".into(), "../out".into());
        let text = state.to_string();
        assert!(text.starts_with("SavedState("));
        assert!(text.contains("files: 0"));
        assert!(text.contains("PRODUCT_DIR=../out"));
    }
}
