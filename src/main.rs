//! Tether CLI entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use tether::cli::{commands, serve, Cli, Commands};
use tether::infrastructure::config::ConfigLoader;
use tether::infrastructure::logging::LoggerGuard;
use tether::infrastructure::metrics::AtomicCounterSink;
use tether::Bridge;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load().context("Failed to load configuration")?,
    };

    let _logger = LoggerGuard::init(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Start => {
            let events = Arc::new(serve::StdioEventSink::new());
            let counters = Arc::new(AtomicCounterSink::new());
            let bridge = Arc::new(
                Bridge::from_config(&config, events, counters)
                    .context("Failed to build bridge")?,
            );
            serve::serve(bridge).await
        }
        Commands::Check => commands::handle_check(&config).await,
        Commands::Qa {
            work_dir,
            build,
            test,
            timeout,
        } => commands::handle_qa(work_dir, build, test, timeout).await,
    }
}
