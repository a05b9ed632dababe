//! Path variable normalization and root directory inference
//!
//! Description inputs are written relative to the directory holding the
//! description (the base directory) and may climb out of it with `..`. The
//! root directory is the shallowest ancestor any input reaches; every stored
//! path is rewritten relative to it.

use isolate_core::fs::{from_slash, normalize_path, path_starts_with, relative_path, to_slash};
use isolate_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Resolves description paths against a base directory
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    base_dir: PathBuf,
}

impl PathNormalizer {
    /// `base_dir` must be absolute
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: normalize_path(base_dir),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Rewrite each path variable relative to the base directory
    ///
    /// Values are resolved against `cwd` and must name existing directories.
    pub fn normalize_path_variables(
        &self,
        cwd: &Path,
        variables: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        info!(
            "normalize_path_variables({}, {:?}, {})",
            cwd.display(),
            variables,
            self.base_dir.display()
        );

        variables
            .iter()
            .map(|(key, value)| {
                let native: String = value
                    .trim()
                    .chars()
                    .map(|c| if c == '/' || c == '\\' { std::path::MAIN_SEPARATOR } else { c })
                    .collect();
                let normalized = normalize_path(&cwd.join(native));
                if !normalized.is_dir() {
                    return Err(Error::mapping(format!(
                        "{}={} is not a directory",
                        key,
                        normalized.display()
                    )));
                }
                let relative = to_slash(&relative_path(&normalized, &self.base_dir))?;
                debug!("Translated variable {} from {} to {}", key, value, relative);
                Ok((key.clone(), relative))
            })
            .collect()
    }

    /// Shallowest ancestor of the base directory reached by any `..` prefix
    pub fn determine_root_dir<'a, I>(&self, paths: I) -> PathBuf
    where
        I: IntoIterator<Item = &'a str>,
    {
        let depth = paths.into_iter().map(leading_parent_dirs).max().unwrap_or(0);
        let mut root = self.base_dir.clone();
        for _ in 0..depth {
            if !root.pop() {
                break;
            }
        }
        root
    }

    /// Path from `root_dir` to the base directory, `.` when they are equal
    pub fn relative_cwd(&self, root_dir: &Path) -> Result<String> {
        to_slash(&relative_path(&self.base_dir, &normalize_path(root_dir)))
    }

    /// Every path variable, resolved against the base directory, must lie inside `root_dir`
    pub fn verify_variables_inside_root(
        &self,
        root_dir: &Path,
        variables: &BTreeMap<String, String>,
    ) -> Result<()> {
        for (key, value) in variables {
            let dest = normalize_path(&self.base_dir.join(from_slash(value)));
            if !path_starts_with(root_dir, &dest) {
                return Err(Error::mapping(format!(
                    "Path variable {}={} points outside the inferred root directory {}; {}",
                    key,
                    value,
                    root_dir.display(),
                    dest.display()
                )));
            }
        }
        Ok(())
    }

    /// Rewrite base-relative paths relative to `root_dir`, keeping trailing `/`
    pub fn relocate(&self, root_dir: &Path, paths: &[String]) -> Result<Vec<String>> {
        let root_dir = normalize_path(root_dir);
        paths
            .iter()
            .map(|path| {
                if Path::new(path).is_absolute() {
                    return Err(Error::mapping(format!("Can't map absolute path {}", path)));
                }
                let absolute = normalize_path(&self.base_dir.join(from_slash(path)));
                if !path_starts_with(&root_dir, &absolute) {
                    return Err(Error::mapping(format!(
                        "{} is outside the root directory {}",
                        path,
                        root_dir.display()
                    )));
                }
                let mut relocated = to_slash(&relative_path(&absolute, &root_dir))?;
                if path.ends_with('/') && !relocated.ends_with('/') {
                    relocated.push('/');
                }
                Ok(relocated)
            })
            .collect()
    }
}

/// Number of leading `..` components once the path is normalized
fn leading_parent_dirs(path: &str) -> usize {
    normalize_path(&from_slash(path))
        .components()
        .take_while(|c| matches!(c, Component::ParentDir))
        .count()
}
