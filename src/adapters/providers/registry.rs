//! Provider registry: name → provider map with model-prefix resolution.

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::domain::errors::{ProviderError, ProviderResult};
use crate::domain::ports::Provider;

/// Model-name prefix rules applied before the `supports` scan.
const PREFIX_RULES: [(&str, &str); 4] = [
    ("claude-", "claude"),
    ("gemini-", "gemini"),
    ("gpt-", "codex"),
    ("o4-", "codex"),
];

/// Thread-safe registry of providers.
///
/// Registration order is preserved: when no prefix rule matches a model,
/// providers are scanned in the order they were registered and the first
/// whose `supports` returns true wins.
pub struct ProviderRegistry {
    providers: RwLock<Vec<(String, Arc<dyn Provider>)>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
        }
    }

    /// Register a provider under a tag. Re-registering a tag replaces the
    /// provider but keeps its original position.
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let name = name.into();
        let mut providers = self.providers.write().expect("registry lock poisoned");
        if let Some(slot) = providers.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = provider;
        } else {
            debug!(provider = %name, "Registered provider");
            providers.push((name, provider));
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Provider>> {
        let mut providers = self.providers.write().expect("registry lock poisoned");
        let idx = providers.iter().position(|(n, _)| n == name)?;
        Some(providers.remove(idx).1)
    }

    pub fn clear(&self) {
        self.providers
            .write()
            .expect("registry lock poisoned")
            .clear();
    }

    /// All registered providers, in registration order.
    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.providers
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Registered tags, in registration order.
    pub fn list(&self) -> Vec<String> {
        self.providers
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.providers.read().expect("registry lock poisoned").len()
    }

    pub fn has(&self, name: &str) -> bool {
        self.providers
            .read()
            .expect("registry lock poisoned")
            .iter()
            .any(|(n, _)| n == name)
    }

    /// Resolve for a task: explicit tag first, then model resolution.
    pub fn get_for_task(
        &self,
        provider_tag: &str,
        model: &str,
    ) -> ProviderResult<Arc<dyn Provider>> {
        if !provider_tag.is_empty() {
            if let Some(provider) = self.get(provider_tag) {
                return Ok(provider);
            }
        }
        self.get_for_model(model)
    }

    /// Resolve by model name: prefix rules first, then a registration-order
    /// `supports` scan.
    pub fn get_for_model(&self, model: &str) -> ProviderResult<Arc<dyn Provider>> {
        for (prefix, tag) in PREFIX_RULES {
            if model.starts_with(prefix) {
                if let Some(provider) = self.get(tag) {
                    return Ok(provider);
                }
            }
        }

        let providers = self.providers.read().expect("registry lock poisoned");
        for (_, provider) in providers.iter() {
            if provider.supports(model) {
                return Ok(provider.clone());
            }
        }

        Err(ProviderError::NotFound(format!(
            "no provider for model {model:?}"
        )))
    }

    /// Run `validate_config` over every provider; the first failure is
    /// returned annotated with the provider's tag.
    pub fn validate_all(&self) -> ProviderResult<()> {
        let providers = self.providers.read().expect("registry lock poisoned");
        for (name, provider) in providers.iter() {
            provider
                .validate_config()
                .map_err(|e| ProviderError::InvalidConfig(format!("{name}: {e}")))?;
        }
        Ok(())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::providers::mock::MockProvider;

    fn registry_with(names: &[&str]) -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        for name in names {
            registry.register(*name, Arc::new(MockProvider::new(*name)));
        }
        registry
    }

    #[test]
    fn test_register_get_remove() {
        let registry = registry_with(&["claude"]);
        assert!(registry.has("claude"));
        assert_eq!(registry.count(), 1);

        assert!(registry.remove("claude").is_some());
        assert!(!registry.has("claude"));
        assert!(registry.remove("claude").is_none());
    }

    #[test]
    fn test_prefix_resolution() {
        let registry = registry_with(&["claude", "gemini", "codex"]);

        let p = registry.get_for_task("", "claude-sonnet-4").unwrap();
        assert_eq!(p.name(), "claude");

        let p = registry.get_for_task("", "gemini-2.5-pro").unwrap();
        assert_eq!(p.name(), "gemini");

        let p = registry.get_for_task("", "gpt-5-codex").unwrap();
        assert_eq!(p.name(), "codex");

        let p = registry.get_for_task("", "o4-mini").unwrap();
        assert_eq!(p.name(), "codex");
    }

    #[test]
    fn test_explicit_tag_wins_over_prefix() {
        let registry = registry_with(&["claude", "gemini"]);
        let p = registry.get_for_task("gemini", "claude-sonnet-4").unwrap();
        assert_eq!(p.name(), "gemini");
    }

    #[test]
    fn test_unknown_model_is_not_found() {
        let registry = registry_with(&["claude", "gemini", "codex"]);
        let err = registry.get_for_task("", "unknown-model").unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[test]
    fn test_supports_scan_in_registration_order() {
        let registry = ProviderRegistry::new();
        registry.register(
            "first",
            Arc::new(MockProvider::new("first").with_supports_all()),
        );
        registry.register(
            "second",
            Arc::new(MockProvider::new("second").with_supports_all()),
        );

        let p = registry.get_for_model("anything").unwrap();
        assert_eq!(p.name(), "first");
    }

    #[test]
    fn test_missing_explicit_tag_falls_back_to_model() {
        let registry = registry_with(&["claude"]);
        let p = registry.get_for_task("nope", "claude-sonnet-4").unwrap();
        assert_eq!(p.name(), "claude");
    }

    #[test]
    fn test_validate_all_annotates_failure() {
        let registry = ProviderRegistry::new();
        registry.register(
            "bad",
            Arc::new(MockProvider::new("bad").with_invalid_config("no binary")),
        );
        let err = registry.validate_all().unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_list_preserves_order() {
        let registry = registry_with(&["claude", "gemini", "codex"]);
        assert_eq!(registry.list(), vec!["claude", "gemini", "codex"]);
        registry.clear();
        assert_eq!(registry.count(), 0);
    }
}
