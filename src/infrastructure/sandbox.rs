//! Filesystem sandbox: validates task work directories against allow and
//! deny lists.
//!
//! Policy, in evaluation order: tilde expansion and absolutization, symlink
//! resolution for existing paths, deny-list containment (deny always wins),
//! hidden-directory components, then allow-list containment. A built-in
//! critical deny list is unioned in regardless of configuration. The sandbox
//! is immutable after construction.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::domain::models::SandboxConfig;

/// Paths that are always denied, configuration notwithstanding.
const BUILTIN_DENIED: [&str; 6] = ["~/.ssh", "~/.gnupg", "~/.config", "~/.aws", "/etc", "/var"];

#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("path {path} is under denied path {rule}")]
    Denied { path: String, rule: String },

    #[error("hidden directory component {component:?} in {path}")]
    HiddenComponent { component: String, path: String },

    #[error("no allowed paths configured")]
    NoAllowedPaths,

    #[error("path {path} is outside all allowed paths")]
    OutsideAllowed { path: String },

    #[error("cannot determine home directory for {0}")]
    NoHomeDir(String),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Immutable path policy evaluated per validation call.
#[derive(Debug, Clone)]
pub struct Sandbox {
    enabled: bool,
    deny_hidden_dirs: bool,
    allowed: Vec<PathBuf>,
    denied: Vec<PathBuf>,
    home: Option<PathBuf>,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self::with_home(config, dirs::home_dir())
    }

    /// Construct with an explicit home directory (used by tests).
    pub fn with_home(config: &SandboxConfig, home: Option<PathBuf>) -> Self {
        let resolve = |raw: &str| -> Option<PathBuf> {
            let expanded = expand_tilde(raw, home.as_deref())?;
            Some(resolve_existing(&normalize(&absolutize(&expanded))))
        };

        let allowed = config
            .allowed_paths
            .iter()
            .filter_map(|p| resolve(p))
            .collect();

        let denied = BUILTIN_DENIED
            .iter()
            .map(|s| (*s).to_string())
            .chain(config.denied_paths.iter().cloned())
            .filter_map(|p| resolve(&p))
            .collect();

        Self {
            enabled: config.enabled,
            deny_hidden_dirs: config.deny_hidden_dirs,
            allowed,
            denied,
            home,
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Validate a work directory; the empty string is the executor's
    /// default and is always accepted.
    pub fn validate_work_dir(&self, work_dir: &str) -> SandboxResult<()> {
        if work_dir.is_empty() {
            return Ok(());
        }
        self.validate_path(work_dir)
    }

    /// Validate a single path against the policy.
    pub fn validate_path(&self, raw: &str) -> SandboxResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let expanded = expand_tilde(raw, self.home.as_deref())
            .ok_or_else(|| SandboxError::NoHomeDir(raw.to_string()))?;
        let cleaned = normalize(&absolutize(&expanded));
        // Existing paths are resolved through symlinks; new-file candidates
        // are judged on their cleaned absolute form.
        let resolved = resolve_existing(&cleaned);
        let display_str = resolved.display().to_string();

        for deny in &self.denied {
            if resolved.starts_with(deny) {
                debug!(path = %display_str, rule = %deny.display(), "Sandbox denied path");
                return Err(SandboxError::Denied {
                    path: display_str,
                    rule: deny.display().to_string(),
                });
            }
        }

        if self.deny_hidden_dirs {
            for component in resolved.components() {
                if let Component::Normal(name) = component {
                    let name = name.to_string_lossy();
                    if name.starts_with('.') {
                        return Err(SandboxError::HiddenComponent {
                            component: name.into_owned(),
                            path: display_str,
                        });
                    }
                }
            }
        }

        if self.allowed.is_empty() {
            return Err(SandboxError::NoAllowedPaths);
        }

        if self.allowed.iter().any(|allow| resolved.starts_with(allow)) {
            Ok(())
        } else {
            Err(SandboxError::OutsideAllowed { path: display_str })
        }
    }
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(raw: &str, home: Option<&Path>) -> Option<PathBuf> {
    if raw == "~" {
        return home.map(Path::to_path_buf);
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return home.map(|h| h.join(rest));
    }
    Some(PathBuf::from(raw))
}

/// Make a path absolute against the current directory.
fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    }
}

/// Lexically clean a path: drop `.`, fold `..` onto the parent.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve symlinks when the path exists; otherwise keep the input.
fn resolve_existing(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
