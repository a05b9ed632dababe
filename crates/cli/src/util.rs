//! Shared utilities for CLI commands

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use isolate_core::fs::normalize_path;
use std::path::{Path, PathBuf};

/// Parse a `KEY=VALUE` variable argument
pub fn parse_key_value(arg: &str) -> Result<(String, String), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", arg))?;
    if !is_valid_variable_name(key) {
        return Err(format!(
            "Variable '{}' doesn't respect format '[A-Za-z_][A-Za-z_0-9]*'",
            key
        ));
    }
    Ok((key.to_string(), value.to_string()))
}

fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolve a user supplied path against `cwd`, accepting either separator
pub fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    let native: String = path
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '\\' { std::path::MAIN_SEPARATOR } else { c })
        .collect();
    normalize_path(&cwd.join(native))
}

pub fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to get current directory")
}

/// Make a relative executable path (`../out/app`) absolute from `cwd`
///
/// Bare program names are left to `PATH` lookup.
pub fn ensure_command_has_abs_path(command: &mut [String], cwd: &Path) {
    if let Some(program) = command.first_mut() {
        let path = Path::new(program.as_str());
        if !path.is_absolute() && path.components().count() > 1 {
            *program = normalize_path(&cwd.join(path)).to_string_lossy().into_owned();
        }
    }
}

/// Spinner counting hashed files; hidden when stderr is not a terminal
pub fn hashing_progress() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("  {spinner} hashing {pos} files ({elapsed})") {
        pb.set_style(style);
    }
    pb
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
