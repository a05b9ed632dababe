//! Map every dependency into a directory without running the command

use super::Session;
use crate::util;
use anyhow::{Context, Result};
use isolate_core::create_isolated_tree;
use std::path::Path;

pub async fn run(session: &Session, outdir: &Path, skip_refresh: bool) -> Result<()> {
    let outdir = util::absolutize(&session.cwd, outdir);
    let _lock = session.lock()?;
    let mut state = session.load(None, skip_refresh)?;

    std::fs::create_dir_all(&outdir)
        .with_context(|| format!("Failed to create {}", outdir.display()))?;
    println!("Remapping into {}", outdir.display());
    let mut entries = std::fs::read_dir(&outdir)
        .with_context(|| format!("Failed to list {}", outdir.display()))?;
    if entries.next().is_some() {
        anyhow::bail!("Can't remap in a non-empty directory");
    }

    let root_dir = state
        .root_dir()
        .context("The saved state has no root directory; run without --skip-refresh")?;
    let saved = &state.saved_state;
    create_isolated_tree(
        &outdir,
        root_dir,
        &saved.to_manifest().files,
        saved.relative_cwd.as_deref().unwrap_or("."),
        saved.read_only,
    )?;

    if state.isolated_filepath().is_some() {
        state.save_files()?;
    }
    Ok(())
}
