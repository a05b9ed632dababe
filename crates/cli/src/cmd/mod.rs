//! CLI command implementations

pub mod check;
pub mod config;
pub mod hashtable;
pub mod remap;
pub mod run;

use crate::config::Config;
use crate::locks::ManifestLock;
use crate::util;
use anyhow::{Context, Result};
use clap::Args;
use isolate_core::Blacklist;
use isolate_state::{load_complete_state, CompleteState, JsonDescription, LoadRequest, Variables};
use std::path::{Path, PathBuf};

/// Options shared by every refreshing command
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Description file to load the dependency data from
    #[arg(short = 'i', long, value_name = "FILE", global = true)]
    pub isolate: Option<PathBuf>,

    /// Manifest to generate or read; its state lives next to it
    #[arg(short = 's', long, value_name = "FILE", global = true)]
    pub isolated: Option<PathBuf>,

    /// Variable selecting conditions in the description (persisted)
    #[arg(long = "config-variable", value_name = "KEY=VALUE", value_parser = util::parse_key_value, global = true)]
    pub config_variables: Vec<(String, String)>,

    /// Directory variable, rewritten relative to the description (persisted)
    #[arg(long = "path-variable", value_name = "KEY=VALUE", value_parser = util::parse_key_value, global = true)]
    pub path_variables: Vec<(String, String)>,

    /// Plain substitution for commands and paths (persisted)
    #[arg(long = "extra-variable", value_name = "KEY=VALUE", value_parser = util::parse_key_value, global = true)]
    pub extra_variables: Vec<(String, String)>,

    /// Log and skip inputs that cannot be mapped instead of failing
    #[arg(long, global = true)]
    pub ignore_broken_items: bool,
}

/// Resolved arguments and configuration of one invocation
pub struct Session {
    pub cwd: PathBuf,
    pub isolate: Option<PathBuf>,
    pub isolated: Option<PathBuf>,
    pub variables: Variables,
    pub blacklist: Blacklist,
    pub ignore_broken_items: bool,
    pub config: Config,
}

impl Session {
    pub fn new(args: CommonArgs, config: Config) -> Result<Self> {
        Self::with_cwd(args, config, util::current_dir()?)
    }

    pub fn with_cwd(args: CommonArgs, config: Config, cwd: PathBuf) -> Result<Self> {
        let isolated = args.isolated.map(|p| util::absolutize(&cwd, &p));
        if let Some(isolated) = &isolated {
            if !isolated.to_string_lossy().ends_with(".isolated") {
                anyhow::bail!("--isolated value must end with '.isolated'");
            }
        }
        let isolate = args.isolate.map(|p| util::absolutize(&cwd, &p));

        let mut variables = Variables {
            config: args.config_variables.into_iter().collect(),
            path: args.path_variables.into_iter().collect(),
            extra: args.extra_variables.into_iter().collect(),
        };
        variables
            .extra
            .entry("EXECUTABLE_SUFFIX".to_string())
            .or_insert_with(|| if cfg!(windows) { ".exe" } else { "" }.to_string());

        let blacklist = config.blacklist()?;
        let ignore_broken_items = args.ignore_broken_items || config.inputs.ignore_broken_items;

        Ok(Self {
            cwd,
            isolate,
            isolated,
            variables,
            blacklist,
            ignore_broken_items,
            config,
        })
    }

    pub fn require_isolated(&self) -> Result<&Path> {
        self.isolated
            .as_deref()
            .context("--isolated is required")
    }

    /// Lock the manifest for the rest of the command, if there is one
    pub fn lock(&self) -> Result<Option<ManifestLock>> {
        self.isolated
            .as_deref()
            .map(ManifestLock::acquire)
            .transpose()
    }

    /// Load the state and refresh it unless `skip_update` can be honoured
    pub fn load(&self, subdir: Option<&str>, skip_update: bool) -> Result<CompleteState> {
        let request = LoadRequest {
            cwd: &self.cwd,
            isolate: self.isolate.as_deref(),
            isolated: self.isolated.as_deref(),
            variables: &self.variables,
            subdir,
            skip_update,
            blacklist: &self.blacklist,
            ignore_broken_items: self.ignore_broken_items,
            algo: self.config.hashing.algo,
        };

        let pb = util::hashing_progress();
        let state = load_complete_state(&request, &JsonDescription, |n| pb.inc(n));
        pb.finish_and_clear();
        Ok(state?)
    }
}
