//! QA pipeline wire model.

use serde::{Deserialize, Serialize};

/// Background service configuration for the `service_start` stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Shell command that starts the service.
    pub command: String,
    /// URL polled until it answers with a 2xx.
    pub health_check_url: String,
    /// Seconds to wait for the first healthy response; 0 means the default.
    #[serde(default)]
    pub ready_timeout_sec: u64,
}

/// Browser QA configuration for the `browser_qa` stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserQaConfig {
    /// Playwright test script or spec path, relative to the work dir.
    pub script: String,
    /// Browser project name (chromium, firefox, webkit); empty uses the default.
    #[serde(default)]
    pub browser: String,
    /// Collect screenshots from `test-results/` after the run.
    #[serde(default)]
    pub screenshot: bool,
    /// Run headless; defaults to true.
    #[serde(default = "default_headless")]
    pub headless: bool,
}

const fn default_headless() -> bool {
    true
}

/// A QA pipeline request. Stages with absent configuration are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QaRequest {
    pub execution_id: String,
    pub work_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_config: Option<ServiceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_qa: Option<BrowserQaConfig>,
    /// Overall pipeline timeout; zero falls back to the default.
    pub timeout_seconds: i64,
}

/// Result of one pipeline stage, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub name: String,
    pub success: bool,
    pub output: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResult {
    pub fn ok(name: impl Into<String>, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            name: name.into(),
            success: true,
            output: output.into(),
            duration_ms,
            error: None,
        }
    }

    pub fn failed(
        name: impl Into<String>,
        output: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            success: false,
            output: output.into(),
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// Overall QA pipeline result. `success` is the AND of all non-cleanup
/// stage successes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaResult {
    pub execution_id: String,
    pub success: bool,
    pub stages: Vec<StageResult>,
    pub duration_ms: u64,
    /// Base64-encoded screenshots collected from `test-results/`.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub screenshots: Vec<String>,
}

/// Structured summary extracted from a test stage's raw output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}
