//! Check that every input is present and write the manifest

use super::Session;
use crate::locks::ManifestLock;
use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;

pub async fn run(session: &Session, subdir: Option<&str>) -> Result<()> {
    let isolated = session.require_isolated()?;
    let _lock = ManifestLock::acquire(isolated)?;

    let mut state = session.load(subdir, false)?;
    let written = state.save_files()?;

    let total: u64 = state.saved_state.files.values().filter_map(|m| m.size).sum();
    println!(
        "{} {} ({} files, {})",
        "✓".green(),
        isolated.display(),
        state.saved_state.files.len(),
        util::format_size(total)
    );
    for child in written.iter().take(written.len().saturating_sub(1)) {
        println!("  {}", child.dimmed());
    }
    Ok(())
}
