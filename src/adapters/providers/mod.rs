//! Provider implementations and the registry.

pub mod api;
pub mod cli;
pub mod hybrid;
pub mod mock;
pub mod registry;
pub mod rpc;

use std::sync::Arc;

use tracing::info;

use crate::domain::errors::ProviderResult;
use crate::domain::models::ProvidersConfig;
use crate::domain::ports::Provider;

pub use api::{ApiProvider, ApiProviderConfig};
pub use cli::{CliFlavor, CliProvider, CliProviderConfig};
pub use hybrid::{HybridCounters, HybridProvider};
pub use mock::{MockBehavior, MockProvider};
pub use registry::ProviderRegistry;
pub use rpc::{ApprovalPolicy, RpcProvider, RpcProviderConfig};

/// Build the registry from configuration.
///
/// Tags are canonical: `claude` (hybrid of CLI and API when both are
/// usable), `gemini`, `codex`, plus `api` whenever an API key is present.
pub fn build_registry(config: &ProvidersConfig) -> ProviderResult<ProviderRegistry> {
    let registry = ProviderRegistry::new();

    let api_config = ApiProviderConfig::from(&config.anthropic_api);
    let api: Option<Arc<dyn Provider>> = if api_config.resolve_api_key().is_some() {
        Some(Arc::new(ApiProvider::new(api_config)?))
    } else {
        None
    };

    let claude_cli: Option<Arc<dyn Provider>> = config
        .claude_cli
        .enabled
        .then(|| Arc::new(CliProvider::claude(&config.claude_cli.binary_path)) as Arc<dyn Provider>);

    match (claude_cli, api.clone(), config.prefer_cli) {
        (Some(cli), Some(api_leg), true) => {
            registry.register("claude", Arc::new(HybridProvider::new("claude", Some(cli), Some(api_leg))?));
        }
        (Some(_cli), Some(api_leg), false) => {
            registry.register("claude", api_leg);
        }
        (Some(cli), None, _) => registry.register("claude", cli),
        (None, Some(api_leg), _) => registry.register("claude", api_leg),
        (None, None, _) => info!("No claude provider configured"),
    }

    if config.gemini_cli.enabled {
        registry.register(
            "gemini",
            Arc::new(CliProvider::gemini(&config.gemini_cli.binary_path)),
        );
    }

    if config.codex_rpc.enabled {
        registry.register("codex", Arc::new(RpcProvider::from_settings(&config.codex_rpc)?));
    }

    if let Some(api) = api {
        registry.register("api", api);
    }

    info!(providers = ?registry.list(), "Provider registry ready");
    Ok(registry)
}
