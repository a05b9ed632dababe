//! Run the command in a temporary isolated tree

use super::Session;
use crate::util;
use anyhow::{Context, Result};
use isolate_core::create_isolated_tree;
use isolate_core::fs::remove_tree;
use std::path::Path;
use tracing::{info, warn};

/// Exit code reported when the child is interrupted
const INTERRUPTED: i32 = 130;

/// Returns the child's exit code
pub async fn run(session: &Session, skip_refresh: bool, args: Vec<String>) -> Result<i32> {
    let lock = session.lock()?;
    let mut state = session.load(None, skip_refresh)?;
    if state.isolated_filepath().is_some() {
        state.save_files()?;
    }
    drop(lock);

    let mut command = state.saved_state.command.clone();
    command.extend(args);
    if command.is_empty() {
        anyhow::bail!("No command to run");
    }

    let root_dir = state
        .root_dir()
        .context("The saved state has no root directory; run without --skip-refresh")?;
    let parent = root_dir.parent().unwrap_or(root_dir);
    let outdir = tempfile::Builder::new()
        .prefix("isolate-")
        .tempdir_in(parent)
        .with_context(|| format!("Failed to create a temporary directory in {}", parent.display()))?
        .keep();

    let result = async {
        let saved = &state.saved_state;
        let cwd = create_isolated_tree(
            &outdir,
            root_dir,
            &saved.to_manifest().files,
            saved.relative_cwd.as_deref().unwrap_or("."),
            saved.read_only,
        )?;
        util::ensure_command_has_abs_path(&mut command, &cwd);
        execute(&command, &cwd).await
    }
    .await;

    if let Err(e) = remove_tree(&outdir) {
        warn!("Failed to clean up {}: {}", outdir.display(), e);
    }
    result
}

async fn execute(command: &[String], cwd: &Path) -> Result<i32> {
    info!("Running {:?}, cwd={}", command, cwd.display());

    let spawned = tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .current_dir(cwd)
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            eprintln!(
                "Failed to execute the command; executable is missing, maybe you\n\
                 forgot to map it in the .isolate file?\n  {}\n  in {}\n  ({})",
                command.join(" "),
                cwd.display(),
                e
            );
            return Ok(1);
        }
    };

    tokio::select! {
        status = child.wait() => {
            let status = status.context("Failed to wait for the command")?;
            Ok(status.code().unwrap_or(1))
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; killing {}", command[0]);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", command[0], e);
            }
            Ok(INTERRUPTED)
        }
    }
}
