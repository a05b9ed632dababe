//! User configuration (`~/.config/isolate/config.toml`)

use anyhow::{Context, Result};
use isolate_core::expand::DEFAULT_PATTERNS;
use isolate_core::{Blacklist, HashAlgo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable forcing `inputs.ignore_broken_items`
pub const IGNORE_BROKEN_ITEMS_ENV: &str = "ISOLATE_IGNORE_BROKEN_ITEMS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub hashing: HashingConfig,
    pub inputs: InputsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HashingConfig {
    pub algo: HashAlgo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputsConfig {
    /// Log and skip inputs that cannot be mapped instead of failing
    pub ignore_broken_items: bool,
    /// Gitignore-style patterns pruned from directory listings
    pub blacklist: Vec<String>,
}

impl Default for InputsConfig {
    fn default() -> Self {
        Self {
            ignore_broken_items: false,
            blacklist: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.blacklist().map(|_| ())
    }

    pub fn blacklist(&self) -> Result<Blacklist> {
        Blacklist::new(&self.inputs.blacklist).context("Invalid inputs.blacklist")
    }

    /// Apply environment overrides
    pub fn with_env(mut self) -> Self {
        if std::env::var_os(IGNORE_BROKEN_ITEMS_ENV).is_some_and(|v| !v.is_empty()) {
            self.inputs.ignore_broken_items = true;
        }
        self
    }
}

pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("isolate").join("config.toml"))
}

/// Load the user configuration; a missing file yields the defaults
pub fn load() -> Result<Config> {
    let config = match config_file_path() {
        Some(path) if path.exists() => load_from(&path)?,
        _ => Config::default(),
    };
    Ok(config.with_env())
}

pub fn load_from(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

pub fn example_config() -> &'static str {
    r#"# isolate configuration

[hashing]
# Digest algorithm for files and manifests: "sha-1" or "blake3".
# Changing it discards existing .state files on the next refresh.
algo = "sha-1"

[inputs]
# Log and skip inputs that cannot be mapped instead of failing.
# Also enabled when ISOLATE_IGNORE_BROKEN_ITEMS is set.
ignore_broken_items = false

# Patterns pruned while listing input directories.
blacklist = ["*.git", "*.svn", "*.pyc"]
"#
}
