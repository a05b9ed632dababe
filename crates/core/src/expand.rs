//! Expansion of dependency inputs into concrete files
//!
//! Inputs are root-relative, `/`-separated paths:
//! 1. An entry ending in `/` names a directory; every file below it is listed
//! 2. Any other entry names a single file (or symlink)
//! 3. Symlinks pointing inside the root are recorded and followed
//! 4. Directory listings skip blacklisted names (`*.git`, `*.svn`, `*.pyc` by default)

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{from_slash, normalize_path, path_starts_with, relative_path, to_slash};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Patterns excluded from directory listings unless configured otherwise
pub const DEFAULT_PATTERNS: &[&str] = &["*.git", "*.svn", "*.pyc"];

const MAX_SYMLINK_HOPS: usize = 40;

/// Gitignore-style patterns excluded from directory expansion
#[derive(Debug, Clone)]
pub struct Blacklist {
    matcher: Gitignore,
    patterns: Vec<String>,
}

impl Blacklist {
    /// Compile a blacklist; each pattern uses gitignore syntax
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.trim().is_empty() {
                return Err(Error::mapping("empty blacklist pattern"));
            }
            builder.add_line(None, pattern).map_err(|e| {
                Error::mapping(format!("invalid blacklist pattern '{}': {}", pattern, e))
            })?;
        }
        let matcher = builder
            .build()
            .map_err(|e| Error::mapping(format!("invalid blacklist: {}", e)))?;

        Ok(Self {
            matcher,
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether a root-relative path is excluded
    pub fn is_blacklisted(&self, relpath: &Path, is_dir: bool) -> bool {
        self.matcher.matched(relpath, is_dir).is_ignore()
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        let mut builder = GitignoreBuilder::new("");
        for pattern in DEFAULT_PATTERNS {
            // The built-in patterns are plain globs and always compile.
            let _ = builder.add_line(None, pattern);
        }
        Self {
            matcher: builder.build().unwrap_or_else(|_| Gitignore::empty()),
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Expand root-relative inputs into a sorted, deduplicated file list
///
/// With `ignore_broken_items`, an input that cannot be mapped is logged and
/// skipped instead of failing the whole expansion.
pub fn expand_directories_and_symlinks(
    root_dir: &Path,
    infiles: &[String],
    blacklist: &Blacklist,
    follow_symlinks: bool,
    ignore_broken_items: bool,
) -> Result<Vec<String>> {
    let mut expander = Expander {
        root: normalize_path(root_dir),
        blacklist,
        follow_symlinks,
        visited: HashSet::new(),
        out: BTreeSet::new(),
    };

    for relfile in infiles {
        match expander.expand(relfile) {
            Ok(()) => {}
            Err(e) if ignore_broken_items => {
                warn!("Ignoring broken item {}: {}", relfile, e);
            }
            Err(e) => return Err(e),
        }
    }

    debug!(
        "Expanded {} inputs into {} files",
        infiles.len(),
        expander.out.len()
    );
    Ok(expander.out.into_iter().collect())
}

struct Expander<'a> {
    root: PathBuf,
    blacklist: &'a Blacklist,
    follow_symlinks: bool,
    /// Resolved directories already listed; breaks symlink loops
    visited: HashSet<PathBuf>,
    out: BTreeSet<String>,
}

impl Expander<'_> {
    fn expand(&mut self, relfile: &str) -> Result<()> {
        let native = Path::new(relfile);
        if native.is_absolute() {
            return Err(Error::mapping(format!("Can't map absolute path {}", relfile)));
        }
        let normalized = normalize_path(&from_slash(relfile));
        if normalized.starts_with("..") {
            return Err(Error::mapping(format!(
                "{} escapes the root directory {}",
                relfile,
                self.root.display()
            )));
        }
        let is_dir_entry = relfile.ends_with('/');

        let resolved = if self.follow_symlinks {
            self.resolve_symlinks(&normalized)?
        } else {
            normalized
        };
        let full = self.root.join(&resolved);

        if is_dir_entry {
            if !full.is_dir() {
                return Err(Error::mapping(format!(
                    "Input directory {} must exist and be a directory",
                    full.display()
                )));
            }
            return self.walk(&resolved);
        }

        match std::fs::symlink_metadata(&full) {
            Ok(stat) if stat.is_dir() => Err(Error::mapping(format!(
                "Input directory {} must have a trailing slash",
                relfile
            ))),
            Ok(_) => {
                self.out.insert(to_slash(&resolved)?);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::mapping(format!(
                "Input file {} doesn't exist",
                full.display()
            ))),
            Err(e) => Err(e).with_path(&full),
        }
    }

    /// Follow in-root symlinks component by component
    ///
    /// Every symlink crossed is recorded as an entry of its own. Links that
    /// leave the root or dangle are kept as plain path components.
    fn resolve_symlinks(&mut self, relfile: &Path) -> Result<PathBuf> {
        let mut pending: VecDeque<OsString> = normal_components(relfile);
        let mut resolved = PathBuf::new();
        let mut hops = 0;

        while let Some(component) = pending.pop_front() {
            let candidate = resolved.join(&component);
            let full = self.root.join(&candidate);
            let is_link = std::fs::symlink_metadata(&full)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if !is_link {
                resolved = candidate;
                continue;
            }

            let target = std::fs::read_link(&full).with_path(&full)?;
            let target_abs = normalize_path(&self.root.join(&resolved).join(&target));
            if !path_starts_with(&self.root, &target_abs) || !target_abs.exists() {
                resolved = candidate;
                continue;
            }

            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(Error::mapping(format!(
                    "Too many levels of symbolic links at {}",
                    full.display()
                )));
            }

            debug!("Following symlink {} -> {}", candidate.display(), target.display());
            self.out.insert(to_slash(&candidate)?);

            let mut restart = normal_components(&relative_path(&target_abs, &self.root));
            restart.extend(pending.drain(..));
            pending = restart;
            resolved = PathBuf::new();
        }

        Ok(resolved)
    }

    fn walk(&mut self, reldir: &Path) -> Result<()> {
        if !self.visited.insert(reldir.to_path_buf()) {
            return Ok(());
        }

        let root = &self.root;
        let blacklist = self.blacklist;
        let walker = WalkDir::new(root.join(reldir))
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(root) {
                Ok(rel) => !blacklist.is_blacklisted(rel, entry.file_type().is_dir()),
                Err(_) => true,
            });

        let mut files = Vec::new();
        let mut links = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| Error::Io {
                path: e.path().unwrap_or(root).to_path_buf(),
                source: e.into(),
            })?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| Error::mapping(format!("{} is outside the root", entry.path().display())))?
                .to_path_buf();
            if file_type.is_symlink() && self.follow_symlinks {
                links.push(rel);
            } else {
                files.push(to_slash(&rel)?);
            }
        }
        self.out.extend(files);

        for link in links {
            let mut relfile = to_slash(&link)?;
            if self.root.join(&link).is_dir() {
                relfile.push('/');
            }
            self.expand(&relfile)?;
        }
        Ok(())
    }
}

fn normal_components(path: &Path) -> VecDeque<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel.as_bytes()).unwrap();
    }

    fn expand(root: &Path, infiles: &[&str]) -> Result<Vec<String>> {
        let infiles: Vec<String> = infiles.iter().map(|s| s.to_string()).collect();
        expand_directories_and_symlinks(root, &infiles, &Blacklist::default(), true, false)
    }

    #[test]
    fn test_directory_expansion_prunes_blacklist() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(root, "data/a.txt");
        touch(root, "data/sub/b.txt");
        touch(root, "data/c.pyc");
        touch(root, "data/.git/HEAD");
        touch(root, "other.txt");

        let files = expand(root, &["data/"]).unwrap();
        assert_eq!(files, vec!["data/a.txt", "data/sub/b.txt"]);
    }

    #[test]
    fn test_explicit_files_are_kept_and_deduplicated() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(root, "a.txt");
        touch(root, "dir/b.txt");

        let files = expand(root, &["dir/", "a.txt", "dir/b.txt"]).unwrap();
        assert_eq!(files, vec!["a.txt", "dir/b.txt"]);
    }

    #[test]
    fn test_directory_requires_trailing_slash() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "dir/a.txt");

        let err = expand(temp.path(), &["dir"]).unwrap_err();
        assert!(err.to_string().contains("trailing slash"));
    }

    #[test]
    fn test_missing_input() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "present.txt");

        assert!(matches!(
            expand(temp.path(), &["missing.txt"]),
            Err(Error::Mapping(_))
        ));

        let infiles = vec!["missing.txt".to_string(), "present.txt".to_string()];
        let files =
            expand_directories_and_symlinks(temp.path(), &infiles, &Blacklist::default(), true, true)
                .unwrap();
        assert_eq!(files, vec!["present.txt"]);
    }

    #[test]
    fn test_escaping_inputs_are_rejected() {
        let temp = TempDir::new().unwrap();
        assert!(expand(temp.path(), &["../outside.txt"]).is_err());
        assert!(expand(temp.path(), &["/etc/passwd"]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_in_root_symlink_is_recorded_and_followed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(root, "real/a.txt");
        std::os::unix::fs::symlink("real", root.join("alias")).unwrap();

        let files = expand(root, &["alias/"]).unwrap();
        assert_eq!(files, vec!["alias", "real/a.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_terminates() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(root, "dir/a.txt");
        std::os::unix::fs::symlink("..", root.join("dir/up")).unwrap();

        let files = expand(root, &["dir/"]).unwrap();
        assert!(files.contains(&"dir/a.txt".to_string()));
        assert!(files.contains(&"dir/up".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_kept_verbatim_when_not_following() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(root, "dir/a.txt");
        std::os::unix::fs::symlink("a.txt", root.join("dir/b.txt")).unwrap();

        let infiles = vec!["dir/".to_string()];
        let files =
            expand_directories_and_symlinks(root, &infiles, &Blacklist::default(), false, false)
                .unwrap();
        assert_eq!(files, vec!["dir/a.txt", "dir/b.txt"]);
    }

    #[test]
    fn test_custom_blacklist() {
        let blacklist = Blacklist::new(&["*.log", "build/"]).unwrap();
        assert!(blacklist.is_blacklisted(Path::new("out/x.log"), false));
        assert!(blacklist.is_blacklisted(Path::new("a/build"), true));
        assert!(!blacklist.is_blacklisted(Path::new("a/build"), false));
        assert!(!blacklist.is_blacklisted(Path::new("x.txt"), false));
        assert_eq!(blacklist.patterns(), &["*.log".to_string(), "build/".to_string()]);
    }

    #[test]
    fn test_invalid_blacklist_patterns() {
        assert!(Blacklist::new(&[""]).is_err());
        assert!(Blacklist::new(&["{a"]).is_err());
    }

    #[test]
    fn test_default_blacklist() {
        let blacklist = Blacklist::default();
        assert!(blacklist.is_blacklisted(Path::new(".git"), true));
        assert!(blacklist.is_blacklisted(Path::new("pkg/mod.pyc"), false));
        assert!(!blacklist.is_blacklisted(Path::new("pkg/mod.py"), false));
    }
}
