//! Tracing subscriber setup.
//!
//! File output (when a log directory is configured) is always JSON with
//! rotation; stdout respects the configured format. The returned guard
//! keeps the non-blocking file writer alive for the process lifetime.

use anyhow::{bail, Result};
use std::io;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::domain::models::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the background log writer alive.
pub struct LoggerGuard {
    _guard: Option<WorkerGuard>,
}

impl LoggerGuard {
    /// Initialize the global subscriber from configuration.
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let default_level = parse_log_level(&config.level)?;
        let filter = || {
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy()
        };

        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        if let Some(log_dir) = &config.log_dir {
            let file_appender = match config.rotation.as_str() {
                "hourly" => rolling::hourly(log_dir, "tether.log"),
                "never" => rolling::never(log_dir, "tether.log"),
                _ => rolling::daily(log_dir, "tether.log"),
            };
            let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking_file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_filter(filter())
                    .boxed(),
            );
        }

        if config.enable_stdout || layers.is_empty() {
            layers.push(stdout_layer(config, filter()));
        }

        tracing_subscriber::registry().with(layers).init();
        Ok(Self { _guard: guard })
    }
}

fn stdout_layer(config: &LoggingConfig, filter: EnvFilter) -> BoxedLayer {
    if config.format == "json" {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stdout)
            .with_target(true)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(io::stdout)
            .with_target(true)
            .with_filter(filter)
            .boxed()
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    Ok(match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => bail!("unknown log level: {other}"),
    })
}
