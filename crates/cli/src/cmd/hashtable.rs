//! Stage files and manifests into a content-addressed directory

use super::Session;
use crate::locks::ManifestLock;
use crate::util;
use anyhow::{Context, Result};
use isolate_core::{Layout, LinkMode, TreeMaterializer};
use isolate_state::ArchivalSet;
use owo_colors::OwoColorize;
use std::path::Path;
use tracing::{debug, info, warn};

pub async fn run(session: &Session, outdir: &Path, subdir: Option<&str>) -> Result<()> {
    let isolated = session.require_isolated()?;
    let outdir = util::absolutize(&session.cwd, outdir);
    let _lock = ManifestLock::acquire(isolated)?;

    match stage(session, &outdir, subdir) {
        Ok(set) => {
            println!("{}  {}", set.primary_digest, set.primary_name);
            Ok(())
        }
        Err(e) => {
            // A half-staged manifest must not be picked up by a consumer.
            if isolated.is_file() {
                if let Err(remove) = std::fs::remove_file(isolated) {
                    warn!("Failed to remove {}: {}", isolated.display(), remove);
                }
            }
            Err(e)
        }
    }
}

fn stage(session: &Session, outdir: &Path, subdir: Option<&str>) -> Result<ArchivalSet> {
    let mut state = session.load(subdir, false)?;
    state.save_files()?;
    let set = state.archival_set()?;
    info!(
        "Creating content addressed object store with {} items",
        set.files.len() + set.manifests.len()
    );

    std::fs::create_dir_all(outdir)
        .with_context(|| format!("Failed to create {}", outdir.display()))?;
    let files = TreeMaterializer::new(outdir, &set.root_dir)
        .layout(Layout::ByContentHash)
        .link_mode(LinkMode::HardlinkWithFallback)
        .recreate(&set.files)?;
    let manifests = TreeMaterializer::new(outdir, &set.manifest_dir)
        .layout(Layout::ByContentHash)
        .link_mode(LinkMode::HardlinkWithFallback)
        .recreate(&set.manifests)?;
    debug!("files: {:?}, manifests: {:?}", files, manifests);

    eprintln!(
        "{} {} files ({} reused), {} staged in {}",
        "✓".green(),
        files.files + manifests.files,
        files.reused + manifests.reused,
        util::format_size(files.bytes + manifests.bytes),
        outdir.display()
    );
    Ok(set)
}
