pub mod config;
pub mod probe;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::error::ConfigResult;
use config::RunConfig;

#[derive(Parser)]
#[command(name = "barrage")]
#[command(about = "Staged load generation with threshold verdicts", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test
    Run {
        /// Path to the run descriptor (YAML/JSON)
        config: Option<PathBuf>,

        /// Start from a built-in profile (smoke, ramp)
        #[arg(short, long)]
        profile: Option<String>,

        /// Base URL of the system under test
        #[arg(long, env = "APP_URL")]
        base_url: Option<String>,

        /// Constant VU count; replaces any stages
        #[arg(long)]
        vus: Option<u32>,

        /// Run duration (e.g., "30s"); replaces any stages
        #[arg(short, long)]
        duration: Option<String>,

        /// Print the final report as JSON to stdout
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Export final report to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,
    },
    /// Check a run descriptor without running it
    Validate {
        config: PathBuf,

        /// Base URL to validate against when the descriptor has none
        #[arg(long, env = "APP_URL")]
        base_url: Option<String>,
    },
    /// Print the JSON schema of the run descriptor
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Flags that override the descriptor.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub vus: Option<u32>,
    pub duration: Option<String>,
}

/// Profile, then file, then flags; later layers win. `--vus` or
/// `--duration` turn a staged descriptor into a constant one.
pub fn resolve_config(
    profile: Option<&str>,
    file: Option<&std::path::Path>,
    overrides: Overrides,
) -> ConfigResult<RunConfig> {
    let mut config = match profile {
        Some(name) => RunConfig::profile(name)?,
        None => RunConfig::default(),
    };
    if let Some(path) = file {
        config = config.overlay(RunConfig::load(path)?);
    }
    if overrides.vus.is_some() || overrides.duration.is_some() {
        config.stages = None;
    }
    Ok(config.overlay(RunConfig {
        base_url: overrides.base_url,
        vus: overrides.vus,
        duration: overrides.duration,
        ..RunConfig::default()
    }))
}
