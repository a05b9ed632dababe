//! File system helpers: atomic writes, lexical path handling, tree permissions

use crate::error::{Error, IoResultExt, Result};
use crate::metadata::ReadOnly;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Atomic write helper
///
/// Writes data to a temporary sibling file, fsyncs it, then renames it over the
/// target. A crash leaves either the old or the new content, never a mix.
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = target
        .file_name()
        .ok_or_else(|| Error::mapping(format!("{} has no file name", target.display())))?;

    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(format!(".tmp.{}", std::process::id()));
    let tmp_path = parent.join(tmp_name);

    let result = (|| {
        let mut file = File::create(&tmp_path).with_path(&tmp_path)?;
        file.write_all(data).with_path(&tmp_path)?;
        file.sync_all().with_path(&tmp_path)?;
        fs::rename(&tmp_path, target).with_path(target)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result?;

    #[cfg(unix)]
    {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Lexically normalize a path
///
/// - Removes `.` components
/// - Folds `name/..` pairs
/// - Keeps leading `..` of relative paths; drops `..` above the root
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Relative path from `base` to `path`; both must be normalized and of the same kind
pub fn relative_path(path: &Path, base: &Path) -> PathBuf {
    let path_components: Vec<_> = path.components().collect();
    let base_components: Vec<_> = base.components().collect();
    let common = path_components
        .iter()
        .zip(&base_components)
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base_components.len() {
        out.push("..");
    }
    for component in &path_components[common..] {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Whether `path` is `root` or lies below it (component-wise)
pub fn path_starts_with(root: &Path, path: &Path) -> bool {
    normalize_path(path).starts_with(normalize_path(root))
}

/// Render a relative path with `/` separators, as stored in manifests
pub fn to_slash(path: &Path) -> Result<String> {
    let s = path
        .to_str()
        .ok_or_else(|| Error::mapping(format!("{} is not valid UTF-8", path.display())))?;
    if std::path::MAIN_SEPARATOR == '/' {
        Ok(s.to_string())
    } else {
        Ok(s.replace(std::path::MAIN_SEPARATOR, "/"))
    }
}

/// Convert a `/`-separated manifest path to a native relative path
pub fn from_slash(s: &str) -> PathBuf {
    s.split('/').filter(|c| !c.is_empty()).collect()
}

/// Apply a read-only policy to every file and directory below `root`
///
/// - unset / 0: everything writable
/// - 1: files read-only, directories writable
/// - 2: files and directories read-only
pub fn change_tree_read_only(root: &Path, read_only: Option<ReadOnly>) -> Result<()> {
    let (files_writable, dirs_writable) = match read_only.unwrap_or(ReadOnly::Writable) {
        ReadOnly::Writable => (true, true),
        ReadOnly::Files => (false, true),
        ReadOnly::Tree => (false, false),
    };
    debug!(
        "change_tree_read_only({}, files_writable={}, dirs_writable={})",
        root.display(),
        files_writable,
        dirs_writable
    );

    for entry in WalkDir::new(root).follow_links(false).contents_first(true) {
        let entry = entry.map_err(|e| Error::Io {
            path: e.path().unwrap_or(root).to_path_buf(),
            source: e.into(),
        })?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        let writable = if file_type.is_dir() {
            dirs_writable
        } else {
            files_writable
        };
        set_writable(entry.path(), writable)?;
    }
    Ok(())
}

/// Delete a tree, first restoring write access so read-only trees can go
pub fn remove_tree(root: &Path) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    change_tree_read_only(root, None)?;
    fs::remove_dir_all(root).with_path(root)
}

/// Toggle write permission on one path
pub fn set_writable(path: &Path, writable: bool) -> Result<()> {
    let mut perms = fs::symlink_metadata(path).with_path(path)?.permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        let new_mode = if writable { mode | 0o200 } else { mode & !0o222 };
        if mode == new_mode {
            return Ok(());
        }
        perms.set_mode(new_mode);
    }
    #[cfg(not(unix))]
    {
        if perms.readonly() != writable {
            return Ok(());
        }
        perms.set_readonly(!writable);
    }

    fs::set_permissions(path, perms).with_path(path)
}
