//! Refresh cycle: description + saved state -> hashed file set -> manifests

use crate::description::{eval_variables, DescriptionSource};
use crate::paths::PathNormalizer;
use crate::saved_state::{FileSetDiff, SavedState};
use isolate_core::fs::{from_slash, normalize_path, to_slash};
use isolate_core::hash::hash_file;
use isolate_core::{
    expand_directories_and_symlinks, file_to_metadata, Blacklist, Digest, Error, FileMetadata,
    HashAlgo, ManifestBuilder, ManifestEntry, Result,
};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Path variable naming the build output directory, split into its own manifest
pub const PRODUCT_DIR: &str = "PRODUCT_DIR";

/// `foo.isolated` -> `foo.isolated.state`
pub fn isolatedfile_to_state(isolated: &Path) -> PathBuf {
    let mut path = isolated.as_os_str().to_os_string();
    path.push(".state");
    PathBuf::from(path)
}

/// User supplied variables, by kind
#[derive(Debug, Clone, Default)]
pub struct Variables {
    pub config: BTreeMap<String, String>,
    pub path: BTreeMap<String, String>,
    pub extra: BTreeMap<String, String>,
}

/// Inputs of one refresh; paths are absolute
pub struct LoadRequest<'a> {
    pub cwd: &'a Path,
    /// Description file
    pub isolate: Option<&'a Path>,
    /// Primary manifest; `None` for throwaway runs that are never saved
    pub isolated: Option<&'a Path>,
    pub variables: &'a Variables,
    /// Only keep files under this root-relative prefix (may use path variables)
    pub subdir: Option<&'a str>,
    /// Reuse the saved state as is, if its description is unchanged
    pub skip_update: bool,
    pub blacklist: &'a Blacklist,
    pub ignore_broken_items: bool,
    pub algo: HashAlgo,
}

/// Everything an object store needs: the files plus the manifests describing them
#[derive(Debug, Clone)]
pub struct ArchivalSet {
    pub root_dir: PathBuf,
    pub files: BTreeMap<String, ManifestEntry>,
    /// Directory holding the manifests
    pub manifest_dir: PathBuf,
    /// Manifest file names, children and primary
    pub manifests: BTreeMap<String, ManifestEntry>,
    pub primary_name: String,
    pub primary_digest: Digest,
}

/// A saved state bound to the manifest it belongs to
pub struct CompleteState {
    isolated_filepath: Option<PathBuf>,
    pub saved_state: SavedState,
}

impl CompleteState {
    pub fn new(isolated_filepath: Option<PathBuf>, saved_state: SavedState) -> Self {
        Self {
            isolated_filepath,
            saved_state,
        }
    }

    /// Load the state stored next to `isolated`; never reads the manifest itself
    pub fn load_files(isolated: &Path, algo: HashAlgo) -> Result<Self> {
        let basedir = isolated
            .parent()
            .ok_or_else(|| Error::mapping(format!("{} has no parent", isolated.display())))?;
        let saved_state = SavedState::load_file(&isolatedfile_to_state(isolated), basedir, algo);
        Ok(Self::new(Some(normalize_path(isolated)), saved_state))
    }

    pub fn isolated_filepath(&self) -> Option<&Path> {
        self.isolated_filepath.as_deref()
    }

    pub fn root_dir(&self) -> Option<&Path> {
        self.saved_state.root_dir.as_deref()
    }

    /// Whether the description is byte-identical to the one last refreshed from
    pub fn description_is_current(&self, description: &Path) -> bool {
        match (self.saved_state.description_digest, hash_file(description, self.saved_state.algo)) {
            (Some(recorded), Ok(current)) => recorded == current,
            _ => false,
        }
    }

    /// Read the description and merge its file set into the saved state
    ///
    /// Infers the root directory and working directory, expands directory
    /// inputs and returns the diff against the previous file set. Nothing is
    /// hashed here.
    pub fn load_description(
        &mut self,
        source: &dyn DescriptionSource,
        description: &Path,
        request: &LoadRequest<'_>,
    ) -> Result<FileSetDiff> {
        info!(
            "CompleteState.load_description({}, {}, ignore_broken_items={})",
            request.cwd.display(),
            description.display(),
            request.ignore_broken_items
        );
        let saved = &mut self.saved_state;

        // Config variables select what the description yields, so merge them first.
        saved.update_config(&request.variables.config);
        let loaded = source.load(description, &saved.config_variables)?;

        let normalizer = PathNormalizer::new(&loaded.base_dir);
        let path_variables =
            normalizer.normalize_path_variables(request.cwd, &request.variables.path)?;
        saved.update(description, &path_variables, &request.variables.extra)?;

        let mut command_variables = saved.path_variables.clone();
        command_variables.extend(saved.config_variables.clone());
        command_variables.extend(saved.extra_variables.clone());
        let command = eval_all(&loaded.command, &command_variables)?;

        let mut file_variables = saved.path_variables.clone();
        file_variables.extend(saved.extra_variables.clone());
        let infiles = eval_all(&loaded.infiles, &file_variables)?;
        let touched = eval_all(&loaded.touched, &file_variables)?;

        // Path variables count as inputs when looking for the root.
        let root_dir = normalizer.determine_root_dir(
            infiles
                .iter()
                .chain(&touched)
                .chain(saved.path_variables.values())
                .map(String::as_str),
        );
        let relative_cwd = normalizer.relative_cwd(&root_dir)?;
        normalizer.verify_variables_inside_root(&root_dir, &saved.path_variables)?;

        let infiles = normalizer.relocate(&root_dir, &infiles)?;
        let mut touched = normalizer.relocate(&root_dir, &touched)?;

        let infiles = expand_directories_and_symlinks(
            &root_dir,
            &infiles,
            request.blacklist,
            cfg!(unix),
            request.ignore_broken_items,
        )?;

        if request.ignore_broken_items {
            let before = touched.len();
            touched.retain(|path| root_dir.join(from_slash(path)).exists());
            if touched.len() != before {
                info!("Removed {} invalid touched entries", before - touched.len());
            }
        }

        saved.description_digest = Some(hash_file(description, saved.algo)?);
        saved.root_dir = Some(root_dir);
        let diff = saved.update_isolated(command, &infiles, &touched, loaded.read_only, relative_cwd);
        debug!("{}", self);
        Ok(diff)
    }

    /// Compute metadata for every tracked file, optionally restricted to `subdir`
    ///
    /// Files are hashed in parallel; the map is only updated once the whole
    /// batch succeeded. `progress` is called once per processed file.
    pub fn files_to_metadata<F>(&mut self, subdir: Option<&str>, progress: F) -> Result<()>
    where
        F: Fn(u64) + Sync,
    {
        let root_dir = self
            .root_dir()
            .ok_or_else(|| Error::state("root directory is unknown; the state was never refreshed"))?
            .to_path_buf();

        if let Some(subdir) = subdir {
            let before = self.saved_state.files.len();
            self.saved_state.files.retain(|path, _| is_within(path, subdir));
            debug!(
                "Restricted to {}: {} of {} files",
                subdir,
                self.saved_state.files.len(),
                before
            );
        }

        let read_only = self.saved_state.read_only;
        let algo = self.saved_state.algo;
        let updates = self
            .saved_state
            .files
            .par_iter()
            .map(|(path, prev)| {
                let meta = file_to_metadata(&root_dir.join(from_slash(path)), prev, read_only, algo)?;
                progress(1);
                Ok((path.clone(), meta))
            })
            .collect::<Result<Vec<(String, FileMetadata)>>>()?;

        self.saved_state.files.extend(updates);
        Ok(())
    }

    /// Write the manifest(s), then the state; returns the manifest file names
    pub fn save_files(&mut self) -> Result<Vec<String>> {
        let isolated = self
            .isolated_filepath
            .clone()
            .ok_or_else(|| Error::state("cannot save a state that has no manifest path"))?;
        debug!("Dumping to {}", isolated.display());

        let mut builder = ManifestBuilder::new(self.saved_state.to_manifest());
        if let Some(prefix) = self.product_dir_prefix()? {
            builder = builder.split_prefix(&prefix);
        }
        let written = builder.save(&isolated)?;

        self.saved_state.child_isolated_files = written[..written.len().saturating_sub(1)].to_vec();
        let total_bytes: u64 = self.saved_state.files.values().filter_map(|m| m.size).sum();
        if total_bytes > 0 {
            debug!("Total size: {} bytes", total_bytes);
        }

        let state_path = isolatedfile_to_state(&isolated);
        debug!("Dumping to {}", state_path.display());
        self.saved_state.save(&state_path)?;
        Ok(written)
    }

    /// `PRODUCT_DIR` rewritten relative to the root, if it lies inside it
    pub fn product_dir_prefix(&self) -> Result<Option<String>> {
        let Some(product_dir) = self
            .saved_state
            .path_variables
            .get(PRODUCT_DIR)
            .filter(|v| !v.is_empty())
        else {
            return Ok(None);
        };
        let relative_cwd = self.saved_state.relative_cwd.as_deref().unwrap_or(".");
        let prefix = normalize_path(&from_slash(relative_cwd).join(from_slash(product_dir)));
        if prefix.starts_with("..") {
            return Ok(None);
        }
        Ok(Some(to_slash(&prefix)?))
    }

    /// Resolve path variables in a subdir filter, relative to the root
    pub fn translate_subdir(&self, subdir: &str) -> Result<String> {
        let relative_cwd = from_slash(self.saved_state.relative_cwd.as_deref().unwrap_or("."));
        let variables = self
            .saved_state
            .path_variables
            .iter()
            .map(|(k, v)| {
                let translated = normalize_path(&relative_cwd.join(from_slash(v)));
                Ok((k.clone(), to_slash(&translated)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        eval_variables(subdir, &variables)
    }

    /// Files plus the manifests written by the last save
    pub fn archival_set(&self) -> Result<ArchivalSet> {
        let isolated = self
            .isolated_filepath
            .as_deref()
            .ok_or_else(|| Error::state("no manifest path to archive"))?;
        let root_dir = self
            .root_dir()
            .ok_or_else(|| Error::state("root directory is unknown"))?
            .to_path_buf();
        let manifest_dir = isolated
            .parent()
            .ok_or_else(|| Error::mapping(format!("{} has no parent", isolated.display())))?
            .to_path_buf();
        let primary_name = isolated
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::mapping(format!("{} has no usable name", isolated.display())))?
            .to_string();

        let algo = self.saved_state.algo;
        let mut manifests = BTreeMap::new();
        let mut primary_digest = None;
        for name in self
            .saved_state
            .child_isolated_files
            .iter()
            .chain(std::iter::once(&primary_name))
        {
            let path = manifest_dir.join(name);
            let size = std::fs::metadata(&path)
                .map_err(|_| Error::mapping(format!("{} is missing", path.display())))?
                .len();
            let hash = hash_file(&path, algo)?;
            if *name == primary_name {
                primary_digest = Some(hash);
            }
            manifests.insert(
                name.clone(),
                ManifestEntry {
                    hash: Some(hash),
                    size: Some(size),
                    ..ManifestEntry::default()
                },
            );
        }
        let primary_digest = primary_digest
            .ok_or_else(|| Error::mapping(format!("{} was not written", primary_name)))?;

        Ok(ArchivalSet {
            root_dir,
            files: self
                .saved_state
                .files
                .iter()
                .map(|(path, meta)| (path.clone(), ManifestEntry::from(meta)))
                .collect(),
            manifest_dir,
            manifests,
            primary_name,
            primary_digest,
        })
    }
}

impl fmt::Display for CompleteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CompleteState(")?;
        writeln!(
            f,
            "  root_dir: {}",
            self.root_dir().map(|p| p.display().to_string()).unwrap_or_else(|| "None".into())
        )?;
        write!(f, "  saved_state: ")?;
        for (i, line) in self.saved_state.to_string().lines().enumerate() {
            if i > 0 {
                write!(f, "\n  ")?;
            }
            f.write_str(line)?;
        }
        write!(f, ")")
    }
}

fn eval_all(items: &[String], variables: &BTreeMap<String, String>) -> Result<Vec<String>> {
    items.iter().map(|item| eval_variables(item, variables)).collect()
}

/// Load (and unless skipped, refresh) the state for a request
///
/// - With a manifest path, the state next to it is loaded; otherwise a
///   throwaway state rooted at `cwd` is used
/// - A description different from the recorded one discards the saved state
/// - `skip_update` is only honoured while the description is unchanged
pub fn load_complete_state<F>(
    request: &LoadRequest<'_>,
    source: &dyn DescriptionSource,
    progress: F,
) -> Result<CompleteState>
where
    F: Fn(u64) + Sync,
{
    let mut state = match request.isolated {
        Some(isolated) => CompleteState::load_files(isolated, request.algo)?,
        None => CompleteState::new(None, SavedState::new(request.cwd, request.algo)),
    };

    let description = match request.isolate {
        None => match state.saved_state.isolate_filepath() {
            Some(recorded) => Some(recorded),
            None if request.skip_update => None,
            None => return Err(Error::description("A description file is required")),
        },
        Some(isolate) => {
            if let Some(recorded) = state.saved_state.isolate_file.clone() {
                let given = state.saved_state.relative_to_basedir(isolate)?;
                if given != recorded {
                    warn!(
                        "--isolate {} != {} as saved; discarding saved state",
                        given, recorded
                    );
                    let basedir = state.saved_state.basedir().to_path_buf();
                    state = CompleteState::new(
                        state.isolated_filepath.clone(),
                        SavedState::new(&basedir, request.algo),
                    );
                }
            }
            Some(normalize_path(isolate))
        }
    };

    let mut skip_update = request.skip_update;
    if skip_update {
        if let Some(description) = &description {
            if !state.description_is_current(description) {
                info!(
                    "{} changed since the last refresh; refreshing anyway",
                    description.display()
                );
                skip_update = false;
            }
        }
    }

    if !skip_update {
        let description = description
            .as_deref()
            .ok_or_else(|| Error::description("A description file is required"))?;
        state.load_description(source, description, request)?;
    }

    let subdir = request
        .subdir
        .map(|subdir| state.translate_subdir(subdir))
        .transpose()?;

    if !skip_update {
        state.files_to_metadata(subdir.as_deref(), progress)?;
    }
    Ok(state)
}

/// Whether the slash-separated `path` is `subdir` or lies below it
fn is_within(path: &str, subdir: &str) -> bool {
    let subdir = subdir.trim_end_matches('/');
    if subdir.is_empty() {
        return true;
    }
    match path.strip_prefix(subdir) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
