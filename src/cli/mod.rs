//! Command-line interface.

pub mod commands;
pub mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Local agent bridge for AI-assisted coding tasks")]
pub struct Cli {
    /// Path to a config file (defaults to the .tether/ hierarchy).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the bridge on the established stdio channel.
    Start,

    /// Validate configuration and provider wiring, then exit.
    Check,

    /// Run a QA pipeline locally and print the result.
    Qa {
        /// Work directory for the pipeline.
        #[arg(long)]
        work_dir: String,

        /// Build command.
        #[arg(long)]
        build: Option<String>,

        /// Test command.
        #[arg(long)]
        test: Option<String>,

        /// Overall timeout in seconds.
        #[arg(long, default_value_t = 600)]
        timeout: i64,
    },
}
