//! Tree materialization
//!
//! Rebuilds a directory from a manifest file map, either at each file's
//! relative path (an execution tree) or under its hex digest (a
//! content-addressed staging directory for an object store).
//!
//! All writes complete before the permission pass runs.

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{change_tree_read_only, from_slash, normalize_path};
use crate::manifest::ManifestEntry;
use crate::metadata::ReadOnly;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How a regular file is reproduced at its destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkMode {
    Hardlink,
    /// Hardlink, copying instead when linking fails (e.g. across devices)
    #[default]
    HardlinkWithFallback,
    Symlink,
    Copy,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hardlink => "hardlink",
            Self::HardlinkWithFallback => "hardlink-with-fallback",
            Self::Symlink => "symlink",
            Self::Copy => "copy",
        })
    }
}

/// Destination naming
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Layout {
    #[default]
    ByRelativePath,
    /// Files named by hex digest; symlinks are skipped
    ByContentHash,
}

/// Counters reported by [`TreeMaterializer::recreate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    /// Regular files written
    pub files: usize,
    /// Symlinks recreated
    pub symlinks: usize,
    /// Content-addressed files already present with the right size
    pub reused: usize,
    /// Entries not materialized (symlinks and duplicate digests in content layout)
    pub skipped: usize,
    /// Bytes written for regular files
    pub bytes: u64,
}

enum Outcome {
    File(u64),
    Symlink,
    Reused,
}

struct Job<'a> {
    relfile: &'a str,
    entry: &'a ManifestEntry,
    outfile: PathBuf,
}

/// Recreates a tree of files under `outdir` from sources under `indir`
#[derive(Debug, Clone)]
pub struct TreeMaterializer {
    outdir: PathBuf,
    indir: PathBuf,
    link_mode: LinkMode,
    layout: Layout,
    read_only: Option<ReadOnly>,
    permission_pass: bool,
}

impl TreeMaterializer {
    pub fn new(outdir: impl Into<PathBuf>, indir: impl Into<PathBuf>) -> Self {
        Self {
            outdir: outdir.into(),
            indir: indir.into(),
            link_mode: LinkMode::default(),
            layout: Layout::default(),
            read_only: None,
            permission_pass: false,
        }
    }

    pub fn link_mode(mut self, link_mode: LinkMode) -> Self {
        self.link_mode = link_mode;
        self
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Apply this read-only policy to the whole destination once every file is written
    pub fn read_only(mut self, read_only: Option<ReadOnly>) -> Self {
        self.read_only = read_only;
        self.permission_pass = true;
        self
    }

    pub fn recreate(&self, files: &BTreeMap<String, ManifestEntry>) -> Result<MaterializeStats> {
        info!(
            "recreate_tree(outdir={}, indir={}, files={}, mode={}, layout={:?})",
            self.outdir.display(),
            self.indir.display(),
            files.len(),
            self.link_mode,
            self.layout
        );

        if !self.outdir.is_dir() {
            info!("Creating {}", self.outdir.display());
            fs::create_dir_all(&self.outdir).with_path(&self.outdir)?;
        }

        let mut stats = MaterializeStats::default();
        let jobs = self.plan(files, &mut stats)?;

        let outcomes = jobs
            .par_iter()
            .map(|job| self.materialize_one(job))
            .collect::<Result<Vec<_>>>()?;

        for outcome in outcomes {
            match outcome {
                Outcome::File(bytes) => {
                    stats.files += 1;
                    stats.bytes += bytes;
                }
                Outcome::Symlink => stats.symlinks += 1,
                Outcome::Reused => stats.reused += 1,
            }
        }

        if self.permission_pass {
            change_tree_read_only(&self.outdir, self.read_only)?;
        }

        debug!("Materialized {:?}", stats);
        Ok(stats)
    }

    /// Resolve destinations; in content layout drop symlinks and duplicate digests
    fn plan<'a>(
        &self,
        files: &'a BTreeMap<String, ManifestEntry>,
        stats: &mut MaterializeStats,
    ) -> Result<Vec<Job<'a>>> {
        let mut jobs = Vec::with_capacity(files.len());
        let mut seen = HashSet::new();

        for (relfile, entry) in files {
            let outfile = match self.layout {
                Layout::ByRelativePath => self.outdir.join(from_slash(relfile)),
                Layout::ByContentHash => {
                    if entry.is_symlink() {
                        stats.skipped += 1;
                        continue;
                    }
                    let hash = match (entry.hash, entry.size) {
                        (Some(hash), Some(_)) => hash,
                        _ => {
                            return Err(Error::mapping(format!(
                                "Misconfigured item {}: {:?}",
                                relfile, entry
                            )))
                        }
                    };
                    if !seen.insert(hash) {
                        stats.skipped += 1;
                        continue;
                    }
                    self.outdir.join(hash.to_hex())
                }
            };
            jobs.push(Job {
                relfile,
                entry,
                outfile,
            });
        }
        Ok(jobs)
    }

    fn materialize_one(&self, job: &Job<'_>) -> Result<Outcome> {
        let outfile = &job.outfile;

        if self.layout == Layout::ByRelativePath {
            if let Some(parent) = outfile.parent() {
                fs::create_dir_all(parent).with_path(parent)?;
            }
            if let Some(target) = &job.entry.symlink_target {
                debug!("Symlink: {} -> {}", outfile.display(), target);
                create_symlink(target, outfile)?;
                return Ok(Outcome::Symlink);
            }
        } else if let Ok(existing) = fs::metadata(outfile) {
            // Size-only check: a same-sized file under the same digest is
            // taken as already present without re-reading it.
            if existing.is_file() && Some(existing.len()) == job.entry.size {
                return Ok(Outcome::Reused);
            }
            warn!("Overwriting {}", outfile.display());
            fs::remove_file(outfile).with_path(outfile)?;
        }

        let infile = self.indir.join(from_slash(job.relfile));
        if job.entry.size == Some(0) {
            if !infile.is_file() {
                return Err(Error::mapping(format!("{} is missing", infile.display())));
            }
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(outfile)
                .map_err(|e| existing_or_io(e, outfile))?;
            return Ok(Outcome::File(0));
        }

        link_file(outfile, &infile, self.link_mode)?;
        Ok(Outcome::File(job.entry.size.unwrap_or(0)))
    }
}

/// Reproduce `infile` at `outfile` with the given mode
///
/// The source must be a file and the destination must not exist.
pub fn link_file(outfile: &Path, infile: &Path, mode: LinkMode) -> Result<()> {
    if !infile.is_file() {
        return Err(Error::mapping(format!("{} is missing", infile.display())));
    }
    if fs::symlink_metadata(outfile).is_ok() {
        return Err(Error::mapping(format!("{} already exists", outfile.display())));
    }

    match mode {
        LinkMode::Hardlink => fs::hard_link(infile, outfile).with_path(outfile),
        LinkMode::HardlinkWithFallback => match fs::hard_link(infile, outfile) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "Failed to hardlink {} to {} ({}); copying instead",
                    infile.display(),
                    outfile.display(),
                    e
                );
                copy_readable(infile, outfile)
            }
        },
        LinkMode::Symlink => {
            let target = if infile.is_absolute() {
                normalize_path(infile)
            } else {
                std::env::current_dir()
                    .with_path(infile)?
                    .join(infile)
            };
            create_symlink(&target.to_string_lossy(), outfile)
        }
        LinkMode::Copy => copy_readable(infile, outfile),
    }
}

/// Copy and make sure the owner can read the result
fn copy_readable(infile: &Path, outfile: &Path) -> Result<()> {
    fs::copy(infile, outfile).with_path(outfile)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(outfile).with_path(outfile)?.permissions();
        if perms.mode() & 0o400 == 0 {
            perms.set_mode(perms.mode() | 0o400);
            fs::set_permissions(outfile, perms).with_path(outfile)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| existing_or_io(e, link))
}

#[cfg(windows)]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(target, link).map_err(|e| existing_or_io(e, link))
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(target: &str, link: &Path) -> Result<()> {
    Err(Error::mapping(format!(
        "cannot create symlink {} -> {} on this platform",
        link.display(),
        target
    )))
}

fn existing_or_io(e: std::io::Error, path: &Path) -> Error {
    if e.kind() == std::io::ErrorKind::AlreadyExists {
        Error::mapping(format!("{} already exists", path.display()))
    } else {
        Error::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

/// Build an execution tree and return the directory the command starts in
///
/// Read-only trees are always copied so the source inodes keep their
/// permissions; writable trees are hardlinked when possible.
pub fn create_isolated_tree(
    outdir: &Path,
    root_dir: &Path,
    files: &BTreeMap<String, ManifestEntry>,
    relative_cwd: &str,
    read_only: Option<ReadOnly>,
) -> Result<PathBuf> {
    let link_mode = if read_only.is_some_and(ReadOnly::restricts_files) {
        LinkMode::Copy
    } else {
        LinkMode::HardlinkWithFallback
    };

    TreeMaterializer::new(outdir, root_dir)
        .link_mode(link_mode)
        .recreate(files)?;

    let cwd = normalize_path(&outdir.join(from_slash(relative_cwd)));
    if !cwd.is_dir() {
        fs::create_dir_all(&cwd).with_path(&cwd)?;
    }
    change_tree_read_only(outdir, read_only)?;
    Ok(cwd)
}
