//! Show the configuration

use crate::config;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;

pub async fn run(path: bool, example: bool) -> Result<()> {
    if example {
        print!("{}", config::example_config());
        return Ok(());
    }

    let config_path = config::config_file_path().context("Could not determine config file path")?;
    if path {
        println!("{}", config_path.display());
        if !config_path.exists() {
            println!("{}", "File does not exist; defaults apply. See --example.".yellow());
        }
        return Ok(());
    }

    let config = config::load()?;
    println!("{}", "Effective configuration".bold());
    println!("{}: {}\n", "Location".dimmed(), config_path.display().dimmed());
    println!("{}", "[hashing]".yellow());
    println!("  {} = {}", "algo".cyan(), config.hashing.algo);
    println!("\n{}", "[inputs]".yellow());
    println!(
        "  {} = {}",
        "ignore_broken_items".cyan(),
        config.inputs.ignore_broken_items
    );
    println!("  {} = {:?}", "blacklist".cyan(), config.inputs.blacklist);
    Ok(())
}
