//! Command handlers for `check` and `qa`.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::adapters::providers::build_registry;
use crate::domain::models::{Config, QaRequest};
use crate::infrastructure::qa::QaPipeline;

/// Validate configuration and provider wiring, printing the effective
/// configuration.
pub async fn handle_check(config: &Config) -> Result<()> {
    let registry = build_registry(&config.providers).context("provider wiring failed")?;
    registry
        .validate_all()
        .context("provider validation failed")?;

    println!("configuration ok; providers: {}", registry.list().join(", "));
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Run a QA pipeline locally and print the JSON result.
pub async fn handle_qa(
    work_dir: String,
    build: Option<String>,
    test: Option<String>,
    timeout: i64,
) -> Result<()> {
    let request = QaRequest {
        execution_id: uuid::Uuid::new_v4().to_string(),
        work_dir,
        build_command: build,
        test_command: test,
        timeout_seconds: timeout,
        ..QaRequest::default()
    };

    let pipeline = QaPipeline::new();
    let result = pipeline.run(&request, &CancellationToken::new()).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.success {
        Ok(())
    } else {
        anyhow::bail!("QA pipeline failed")
    }
}
