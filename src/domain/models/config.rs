//! Bridge configuration model.
//!
//! Loaded hierarchically by `infrastructure::config::ConfigLoader`
//! (defaults → `.tether/config.yaml` → `.tether/local.yaml` → `TETHER_*`
//! environment variables).

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task queue capacity.
    pub queue_capacity: usize,
    /// Default per-task timeout when the request carries none.
    pub default_timeout_secs: u64,
    pub sandbox: SandboxConfig,
    pub providers: ProvidersConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            default_timeout_secs: 600,
            sandbox: SandboxConfig::default(),
            providers: ProvidersConfig::default(),
            logging: LoggingConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

/// Filesystem sandbox policy. The built-in critical deny list is always
/// unioned in by the sandbox itself regardless of these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub allowed_paths: Vec<String>,
    pub denied_paths: Vec<String>,
    pub deny_hidden_dirs: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_paths: vec!["~/projects".to_string()],
            denied_paths: Vec::new(),
            deny_hidden_dirs: true,
        }
    }
}

/// Provider wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub claude_cli: CliConfig,
    pub gemini_cli: CliConfig,
    pub codex_rpc: CodexRpcConfig,
    pub anthropic_api: AnthropicApiSettings,
    /// When both the claude CLI and the API are usable, register the hybrid
    /// with the CLI as the primary leg.
    pub prefer_cli: bool,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            claude_cli: CliConfig {
                binary_path: "claude".to_string(),
                enabled: true,
            },
            gemini_cli: CliConfig {
                binary_path: "gemini".to_string(),
                enabled: true,
            },
            codex_rpc: CodexRpcConfig::default(),
            anthropic_api: AnthropicApiSettings::default(),
            prefer_cli: true,
        }
    }
}

/// One-shot CLI provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub binary_path: String,
    pub enabled: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary_path: String::new(),
            enabled: false,
        }
    }
}

/// Long-lived Codex RPC subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodexRpcConfig {
    pub binary_path: String,
    pub args: Vec<String>,
    /// `auto-approve` or `deny-all`.
    pub approval_policy: String,
    /// API key; falls back to the `OPENAI_API_KEY` environment variable.
    pub api_key: Option<String>,
    pub max_restarts: u32,
    pub enabled: bool,
}

impl Default for CodexRpcConfig {
    fn default() -> Self {
        Self {
            binary_path: "codex".to_string(),
            args: vec!["proto".to_string()],
            approval_policy: "auto-approve".to_string(),
            api_key: None,
            max_restarts: 3,
            enabled: true,
        }
    }
}

/// Anthropic Messages API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicApiSettings {
    /// API key; falls back to the `ANTHROPIC_API_KEY` environment variable.
    pub api_key: Option<String>,
    pub base_url: String,
    pub api_version: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for AnthropicApiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
            api_version: "2023-06-01".to_string(),
            max_retries: 3,
            timeout_secs: 300,
        }
    }
}

/// Logging settings; consumed by `infrastructure::logging`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error.
    pub level: String,
    /// json or pretty.
    pub format: String,
    /// File logging directory; None logs to stdout only.
    pub log_dir: Option<String>,
    /// daily, hourly, never.
    pub rotation: String,
    pub enable_stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            log_dir: None,
            rotation: "daily".to_string(),
            enable_stdout: true,
        }
    }
}

/// Shell pre-check policy for QA commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// When true, QA stage commands are checked before execution.
    pub check_commands: bool,
    /// Allowed command prefixes (lowercased before matching). Empty allows
    /// everything that is not denied.
    pub allowed_commands: Vec<String>,
    /// Extra denied command prefixes on top of the built-in list.
    pub denied_commands: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            check_commands: false,
            allowed_commands: Vec::new(),
            denied_commands: Vec::new(),
        }
    }
}
