//! QA pipeline runner: build → service_start → test → browser_qa → cleanup.
//!
//! Stages run sequentially; a stage with no configuration is skipped, any
//! non-cleanup failure skips all later non-cleanup stages, and cleanup
//! always runs so a started service never outlives the pipeline. Work-dir
//! validation is reported as a pseudo-stage named `validation` and is fatal
//! before any real stage.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use base64::Engine;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::models::{BrowserQaConfig, QaRequest, QaResult, ServiceConfig, StageResult};
use crate::infrastructure::security::CommandChecker;

use super::parsers::parse_test_output;

/// Overall pipeline timeout when the request carries none.
const DEFAULT_PIPELINE_TIMEOUT: Duration = Duration::from_secs(600);
/// Health-check defaults.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Grace period between the termination signal and the hard kill.
const SERVICE_KILL_GRACE: Duration = Duration::from_secs(5);

/// Tunables; tests shrink the polling knobs.
#[derive(Debug, Clone)]
pub struct QaPipelineConfig {
    pub default_timeout: Duration,
    pub default_ready_timeout: Duration,
    pub health_poll_interval: Duration,
    pub health_request_timeout: Duration,
}

impl Default for QaPipelineConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_PIPELINE_TIMEOUT,
            default_ready_timeout: DEFAULT_READY_TIMEOUT,
            health_poll_interval: HEALTH_POLL_INTERVAL,
            health_request_timeout: HEALTH_REQUEST_TIMEOUT,
        }
    }
}

/// Sequential stage runner with guaranteed cleanup.
pub struct QaPipeline {
    http: reqwest::Client,
    checker: Option<CommandChecker>,
    config: QaPipelineConfig,
}

impl QaPipeline {
    pub fn new() -> Self {
        Self::with_config(QaPipelineConfig::default())
    }

    pub fn with_config(config: QaPipelineConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            checker: None,
            config,
        }
    }

    /// Enable the shell pre-check for stage commands.
    #[must_use]
    pub fn with_command_checker(mut self, checker: CommandChecker) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Run the pipeline to completion. Never panics, never leaks the
    /// service subprocess.
    pub async fn run(&self, request: &QaRequest, cancel: &CancellationToken) -> QaResult {
        let started = Instant::now();
        let timeout = if request.timeout_seconds > 0 {
            Duration::from_secs(request.timeout_seconds.unsigned_abs())
        } else {
            self.config.default_timeout
        };
        let deadline = started + timeout;

        let mut stages: Vec<StageResult> = Vec::new();
        let mut service: Option<Child> = None;

        info!(
            execution_id = %request.execution_id,
            work_dir = %request.work_dir,
            timeout_secs = timeout.as_secs(),
            "Starting QA pipeline"
        );

        if let Err(message) = validate_work_dir(&request.work_dir) {
            stages.push(StageResult::failed("validation", "", message, 0));
            return self.finish(request, started, stages, service).await;
        }

        let mut failed = false;

        if let Some(build) = &request.build_command {
            let stage = self
                .run_command_stage("build", build, &request.work_dir, deadline, cancel)
                .await;
            failed = !stage.success;
            stages.push(stage);
        }

        if !failed {
            if let Some(config) = &request.service_config {
                let (stage, child) = self
                    .start_service(config, &request.work_dir, deadline, cancel)
                    .await;
                failed = !stage.success;
                stages.push(stage);
                service = child;
            }
        }

        if !failed {
            if let Some(test) = &request.test_command {
                let mut stage = self
                    .run_command_stage("test", test, &request.work_dir, deadline, cancel)
                    .await;
                let summary = parse_test_output(test, &stage.output);
                if summary.total > 0 {
                    stage.output.push_str(&format!(
                        "\n{} tests: {} passed, {} failed, {} skipped",
                        summary.total, summary.passed, summary.failed, summary.skipped
                    ));
                }
                failed = !stage.success;
                stages.push(stage);
            }
        }

        if !failed {
            if let Some(browser) = &request.browser_qa {
                let stage = self
                    .run_browser_stage(browser, &request.work_dir, deadline, cancel)
                    .await;
                stages.push(stage);
            }
        }

        self.finish(request, started, stages, service).await
    }

    /// Cleanup stage plus result assembly. Cleanup always reports success,
    /// so the overall flag is the AND of the non-cleanup stages.
    async fn finish(
        &self,
        request: &QaRequest,
        started: Instant,
        mut stages: Vec<StageResult>,
        service: Option<Child>,
    ) -> QaResult {
        let cleanup_started = Instant::now();
        let output = match service {
            Some(child) => terminate_service(child).await,
            None => "no service to terminate".to_string(),
        };
        let cleanup_ms = u64::try_from(cleanup_started.elapsed().as_millis()).unwrap_or(0);
        stages.push(StageResult::ok("cleanup", output, cleanup_ms));

        let success = stages
            .iter()
            .filter(|s| s.name != "cleanup")
            .all(|s| s.success);

        let screenshots = if request
            .browser_qa
            .as_ref()
            .is_some_and(|b| b.screenshot)
        {
            collect_screenshots(&request.work_dir)
        } else {
            Vec::new()
        };

        QaResult {
            execution_id: request.execution_id.clone(),
            success,
            stages,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(0),
            screenshots,
        }
    }

    /// Run one shell command with combined stdout/stderr capture, bounded
    /// by the overall deadline.
    async fn run_command_stage(
        &self,
        name: &str,
        command: &str,
        work_dir: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> StageResult {
        let started = Instant::now();

        if let Some(checker) = &self.checker {
            if let Err(e) = checker.check(command) {
                return StageResult::failed(name, "", format!("command rejected: {e}"), 0);
            }
        }

        debug!(stage = name, command = %command, "Running QA stage");
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return StageResult::failed(name, "", "pipeline deadline exceeded", 0);
        }

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return StageResult::failed(name, "", format!("failed to spawn: {e}"), 0);
            }
        };

        let waited = tokio::select! {
            waited = tokio::time::timeout(remaining, child.wait_with_output()) => waited,
            () = cancel.cancelled() => {
                return StageResult::failed(name, "", "cancelled", elapsed_ms(started));
            }
        };

        match waited {
            Err(_) => StageResult::failed(name, "", "stage timed out", elapsed_ms(started)),
            Ok(Err(e)) => StageResult::failed(name, "", format!("wait failed: {e}"), elapsed_ms(started)),
            Ok(Ok(output)) => {
                let combined = combine_output(&output.stdout, &output.stderr);
                if output.status.success() {
                    StageResult::ok(name, combined, elapsed_ms(started))
                } else {
                    let code = output.status.code().map_or_else(
                        || "terminated by signal".to_string(),
                        |c| format!("exit code {c}"),
                    );
                    StageResult::failed(name, combined, code, elapsed_ms(started))
                }
            }
        }
    }

    /// Start the background service and poll its health URL until it
    /// answers 2xx or the ready timeout expires. On timeout the stage fails
    /// but the child stays tracked so cleanup can terminate it.
    async fn start_service(
        &self,
        config: &ServiceConfig,
        work_dir: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> (StageResult, Option<Child>) {
        let started = Instant::now();

        if let Some(checker) = &self.checker {
            if let Err(e) = checker.check(&config.command) {
                return (
                    StageResult::failed("service_start", "", format!("command rejected: {e}"), 0),
                    None,
                );
            }
        }

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&config.command)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return (
                    StageResult::failed("service_start", "", format!("failed to spawn: {e}"), 0),
                    None,
                );
            }
        };

        let ready_timeout = if config.ready_timeout_sec > 0 {
            Duration::from_secs(config.ready_timeout_sec)
        } else {
            self.config.default_ready_timeout
        };
        let ready_deadline = (Instant::now() + ready_timeout).min(deadline);

        let mut polls: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return (
                    StageResult::failed("service_start", "", "cancelled", elapsed_ms(started)),
                    Some(child),
                );
            }
            if Instant::now() >= ready_deadline {
                warn!(
                    url = %config.health_check_url,
                    polls,
                    "Service health check timed out"
                );
                return (
                    StageResult::failed(
                        "service_start",
                        format!("health check polled {polls} times without a 2xx"),
                        format!("not healthy within {}s", ready_timeout.as_secs()),
                        elapsed_ms(started),
                    ),
                    Some(child),
                );
            }

            polls += 1;
            let healthy = self
                .http
                .get(&config.health_check_url)
                .timeout(self.config.health_request_timeout)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);

            if healthy {
                debug!(url = %config.health_check_url, polls, "Service healthy");
                return (
                    StageResult::ok(
                        "service_start",
                        format!("healthy after {polls} polls"),
                        elapsed_ms(started),
                    ),
                    Some(child),
                );
            }

            tokio::time::sleep(self.config.health_poll_interval).await;
        }
    }

    async fn run_browser_stage(
        &self,
        config: &BrowserQaConfig,
        work_dir: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> StageResult {
        let command = build_playwright_command(config);
        self.run_command_stage("browser_qa", &command, work_dir, deadline, cancel)
            .await
    }
}

impl Default for QaPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_work_dir(work_dir: &str) -> Result<(), String> {
    if work_dir.is_empty() {
        return Err("work dir is required for QA".to_string());
    }
    let path = Path::new(work_dir);
    if !path.is_dir() {
        return Err(format!("work dir does not exist: {work_dir}"));
    }
    Ok(())
}

/// Assemble the Playwright invocation for the browser stage.
fn build_playwright_command(config: &BrowserQaConfig) -> String {
    let mut command = format!("npx playwright test {}", config.script);
    if !config.browser.is_empty() {
        command.push_str(&format!(" --project {}", config.browser));
    }
    if !config.headless {
        command.push_str(" --headed");
    }
    command
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&err);
    }
    combined
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Terminate the tracked service: signal first, escalate to a hard kill
/// after the grace period. Failures are reported in the returned text only.
async fn terminate_service(mut child: Child) -> String {
    let Some(pid) = child.id() else {
        return "service already exited".to_string();
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(i32::try_from(pid).unwrap_or_default()), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed; process likely gone");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(SERVICE_KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => format!("service terminated ({status})"),
        Ok(Err(e)) => format!("failed to reap service: {e}"),
        Err(_) => {
            warn!(pid, "Service ignored termination signal; killing");
            match child.kill().await {
                Ok(()) => "service force-killed after grace period".to_string(),
                Err(e) => format!("failed to kill service: {e}"),
            }
        }
    }
}

/// Walk `<work_dir>/test-results/` and base64-encode every image found.
fn collect_screenshots(work_dir: &str) -> Vec<String> {
    let root = Path::new(work_dir).join("test-results");
    if !root.is_dir() {
        return Vec::new();
    }

    let mut screenshots = Vec::new();
    for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let matches_ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| {
                let e = e.to_lowercase();
                e == "png" || e == "jpg" || e == "jpeg"
            });
        if !matches_ext {
            continue;
        }
        match std::fs::read(entry.path()) {
            Ok(bytes) => {
                screenshots.push(base64::engine::general_purpose::STANDARD.encode(bytes));
            }
            Err(e) => debug!(path = %entry.path().display(), error = %e, "Skipping unreadable screenshot"),
        }
    }
    screenshots
}
