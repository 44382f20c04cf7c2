//! Shell command pre-check for QA stages.
//!
//! Commands are lowercased, then checked against a denylist (exact command
//! prefixes and dangerous substrings) and, when configured, an allowlist of
//! permitted command prefixes. Denial always wins.

use thiserror::Error;

use crate::domain::models::SecurityConfig;

/// Command prefixes that are never allowed to run.
const DENIED_PREFIXES: [&str; 8] = [
    "sudo ", "su ", "shutdown", "reboot", "halt", "poweroff", "ssh ", "scp ",
];

/// Substrings that mark a command as dangerous wherever they appear.
const DANGEROUS_PATTERNS: [&str; 8] = [
    "rm -rf /",
    "rm -rf ~",
    "mkfs",
    "dd if=",
    ":(){ :|:& };:",
    "> /dev/sd",
    "chmod -r 777 /",
    "curl | sh",
];

#[derive(Debug, Clone, Error)]
pub enum CommandCheckError {
    #[error("command matches denied prefix {rule:?}")]
    DeniedPrefix { rule: String },

    #[error("command contains dangerous pattern {pattern:?}")]
    DangerousPattern { pattern: String },

    #[error("command is not in the allowlist")]
    NotAllowed,
}

/// Immutable command policy.
#[derive(Debug, Clone)]
pub struct CommandChecker {
    allowed: Vec<String>,
    denied: Vec<String>,
}

impl CommandChecker {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            allowed: config
                .allowed_commands
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
            denied: config
                .denied_commands
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
        }
    }

    /// Check one shell command string.
    pub fn check(&self, command: &str) -> Result<(), CommandCheckError> {
        let lowered = command.trim().to_lowercase();

        for rule in DENIED_PREFIXES.iter().map(|s| (*s).to_string()).chain(self.denied.clone()) {
            // A bare prefix like "shutdown" matches both "shutdown" and
            // "shutdown -h"; prefixes ending in a space require arguments.
            if lowered.starts_with(&rule) || lowered == rule.trim_end() {
                return Err(CommandCheckError::DeniedPrefix { rule });
            }
        }

        for pattern in DANGEROUS_PATTERNS {
            if lowered.contains(pattern) {
                return Err(CommandCheckError::DangerousPattern {
                    pattern: pattern.to_string(),
                });
            }
        }

        if !self.allowed.is_empty()
            && !self.allowed.iter().any(|prefix| lowered.starts_with(prefix))
        {
            return Err(CommandCheckError::NotAllowed);
        }

        Ok(())
    }
}
