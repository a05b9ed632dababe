//! Advisory lock serializing refreshes of one manifest

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Exclusive lock on `<manifest>.lock`, held until dropped
///
/// The lock file itself stays on disk: every contender must lock the same inode.
#[allow(dead_code)]
pub struct ManifestLock {
    path: PathBuf,
    file: File,
}

/// Lock file content, for diagnostics only
#[derive(Serialize, Deserialize)]
struct LockContent {
    pid: u32,
}

pub fn lock_path(isolated: &Path) -> PathBuf {
    let mut path = isolated.as_os_str().to_os_string();
    path.push(".lock");
    PathBuf::from(path)
}

impl ManifestLock {
    /// Acquire the lock without blocking
    ///
    /// Fails if another process is refreshing the same manifest. The kernel
    /// drops the lock when its holder exits, so there are no stale locks.
    pub fn acquire(isolated: &Path) -> Result<Self> {
        let path = lock_path(isolated);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if !try_flock_exclusive(&file)? {
            let holder = Self::read_lock_content(&mut file)
                .map(|c| format!(" by pid {}", c.pid))
                .unwrap_or_default();
            anyhow::bail!(
                "{} is being refreshed{}; try again later",
                isolated.display(),
                holder
            );
        }

        Self::write_lock_content(&mut file)?;
        Ok(Self { path, file })
    }

    fn write_lock_content(file: &mut File) -> Result<()> {
        let content = LockContent {
            pid: std::process::id(),
        };
        let serialized =
            serde_json::to_string(&content).context("Failed to serialize lock content")?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }

    fn read_lock_content(file: &mut File) -> Result<LockContent> {
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        serde_json::from_str(&contents).context("Failed to deserialize lock content")
    }
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}
