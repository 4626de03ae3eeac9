use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gemcut_core::GEMCUT_FILENAME;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "gemcut")]
#[command(
    author,
    version,
    about = "Build and deploy EIP-2535 diamond proxy projects"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "GEMCUT_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the gemcut configuration file.
    #[arg(short, long, global = true, env = "GEMCUT_CONFIG", default_value = GEMCUT_FILENAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Compile facets, scan their selectors and regenerate the aggregate
    /// proxy interface.
    Build,
    /// Deploy or upgrade the diamond for a configured target.
    Deploy {
        /// The target to deploy, as declared under `[targets.<name>]`.
        target: String,

        /// Compute and report the cut plan without sending any transaction.
        #[arg(long)]
        dry_run: bool,

        /// Allow Replace and Remove operations against protected core facets.
        #[arg(long)]
        force_core: bool,
    },
}
