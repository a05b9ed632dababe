//! isolate - incremental dependency manifests and isolated trees

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

mod cmd;
mod config;
mod locks;
mod util;

/// isolate - map a test's dependencies into manifests and isolated trees
#[derive(Parser)]
#[command(name = "isolate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: cmd::CommonArgs,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that all inputs are present and write the manifest
    Check {
        /// Only hash files under this root-relative directory (path variables allowed)
        #[arg(long)]
        subdir: Option<String>,
    },
    /// Map every dependency into a directory without running anything
    Remap {
        /// Directory to recreate the tree in; must be empty
        #[arg(short, long, value_name = "DIR")]
        outdir: PathBuf,
        /// Reuse the saved state if the description is unchanged
        #[arg(long)]
        skip_refresh: bool,
    },
    /// Run the command in a temporary isolated tree
    Run {
        /// Reuse the saved state if the description is unchanged
        #[arg(long)]
        skip_refresh: bool,
        /// Extra arguments appended to the command
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Stage files and manifests by content hash, for upload
    Hashtable {
        /// Content-addressed output directory
        #[arg(short, long, value_name = "DIR")]
        outdir: PathBuf,
        /// Only hash files under this root-relative directory (path variables allowed)
        #[arg(long)]
        subdir: Option<String>,
    },
    /// Show the effective configuration
    Config {
        /// Print the config file location
        #[arg(long)]
        path: bool,
        /// Print an annotated example configuration
        #[arg(long)]
        example: bool,
    },
}

/// `-v` count, or `ISOLATE_DEBUG` when it asks for more
fn init_tracing(verbose: u8) {
    let from_env = std::env::var("ISOLATE_DEBUG")
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(0);
    let level = match verbose.max(from_env) {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match cli.command {
        Commands::Config { path, example } => {
            cmd::config::run(path, example).await?;
            0
        }
        Commands::Check { subdir } => {
            let session = cmd::Session::new(cli.common, config::load()?)?;
            cmd::check::run(&session, subdir.as_deref()).await?;
            0
        }
        Commands::Remap {
            outdir,
            skip_refresh,
        } => {
            let session = cmd::Session::new(cli.common, config::load()?)?;
            cmd::remap::run(&session, &outdir, skip_refresh).await?;
            0
        }
        Commands::Run { skip_refresh, args } => {
            let session = cmd::Session::new(cli.common, config::load()?)?;
            cmd::run::run(&session, skip_refresh, args).await?
        }
        Commands::Hashtable { outdir, subdir } => {
            let session = cmd::Session::new(cli.common, config::load()?)?;
            cmd::hashtable::run(&session, &outdir, subdir.as_deref()).await?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
