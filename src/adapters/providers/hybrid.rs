//! Hybrid provider: try the CLI leg first, fall back to the API leg.
//!
//! Either leg may be absent, in which case the composite behaves as the
//! other; constructing with both legs missing fails. Per-leg success and
//! failure counts are tracked atomically for diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::errors::{ProviderError, ProviderResult};
use crate::domain::models::{ExecuteRequest, ExecuteResponse};
use crate::domain::ports::{Provider, StreamCallback};

type Leg = RwLock<Option<Arc<dyn Provider>>>;

/// Snapshot of per-leg counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HybridCounters {
    pub cli_success: u64,
    pub cli_failed: u64,
    pub api_success: u64,
    pub api_failed: u64,
}

pub struct HybridProvider {
    name: String,
    cli: Leg,
    api: Leg,
    cli_success: AtomicU64,
    cli_failed: AtomicU64,
    api_success: AtomicU64,
    api_failed: AtomicU64,
}

impl HybridProvider {
    /// Build a hybrid from up to two legs. Fails when both are missing.
    pub fn new(
        name: impl Into<String>,
        cli: Option<Arc<dyn Provider>>,
        api: Option<Arc<dyn Provider>>,
    ) -> ProviderResult<Self> {
        if cli.is_none() && api.is_none() {
            return Err(ProviderError::NoApiKey(
                "hybrid provider needs at least one leg".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            cli: RwLock::new(cli),
            api: RwLock::new(api),
            cli_success: AtomicU64::new(0),
            cli_failed: AtomicU64::new(0),
            api_success: AtomicU64::new(0),
            api_failed: AtomicU64::new(0),
        })
    }

    pub fn counters(&self) -> HybridCounters {
        HybridCounters {
            cli_success: self.cli_success.load(Ordering::SeqCst),
            cli_failed: self.cli_failed.load(Ordering::SeqCst),
            api_success: self.api_success.load(Ordering::SeqCst),
            api_failed: self.api_failed.load(Ordering::SeqCst),
        }
    }

    fn leg(&self, leg: &Leg) -> Option<Arc<dyn Provider>> {
        leg.read().expect("hybrid lock poisoned").clone()
    }

    async fn run(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
        on_delta: Option<StreamCallback>,
    ) -> ProviderResult<ExecuteResponse> {
        let mut last_error = None;

        if let Some(cli) = self.leg(&self.cli) {
            let attempt = match &on_delta {
                Some(callback) if cli.supports_streaming() => {
                    cli.execute_streaming(request.clone(), cancel.clone(), callback.clone())
                        .await
                }
                _ => cli.execute(request.clone(), cancel.clone()).await,
            };
            match attempt {
                Ok(response) => {
                    self.cli_success.fetch_add(1, Ordering::SeqCst);
                    return Ok(response);
                }
                Err(error) => {
                    self.cli_failed.fetch_add(1, Ordering::SeqCst);
                    if cancel.is_cancelled() {
                        return Err(ProviderError::Cancelled);
                    }
                    warn!(
                        provider = %self.name,
                        error = %error,
                        "CLI leg failed; falling back to API"
                    );
                    last_error = Some(error);
                }
            }
        }

        if let Some(api) = self.leg(&self.api) {
            let attempt = match &on_delta {
                Some(callback) if api.supports_streaming() => {
                    api.execute_streaming(request, cancel, callback.clone()).await
                }
                _ => api.execute(request, cancel).await,
            };
            match attempt {
                Ok(response) => {
                    self.api_success.fetch_add(1, Ordering::SeqCst);
                    return Ok(response);
                }
                Err(error) => {
                    self.api_failed.fetch_add(1, Ordering::SeqCst);
                    return Err(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::NoApiKey("hybrid provider has no usable leg".to_string())
        }))
    }
}

#[async_trait]
impl Provider for HybridProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, model: &str) -> bool {
        self.leg(&self.cli).is_some_and(|p| p.supports(model))
            || self.leg(&self.api).is_some_and(|p| p.supports(model))
    }

    /// Validate both legs; a failing leg is disabled rather than failing
    /// the composite, as long as one usable leg remains.
    fn validate_config(&self) -> ProviderResult<()> {
        if let Some(cli) = self.leg(&self.cli) {
            if let Err(error) = cli.validate_config() {
                if self.leg(&self.api).is_none() {
                    return Err(error);
                }
                warn!(provider = %self.name, error = %error, "Disabling CLI leg");
                *self.cli.write().expect("hybrid lock poisoned") = None;
            }
        }
        if let Some(api) = self.leg(&self.api) {
            if let Err(error) = api.validate_config() {
                if self.leg(&self.cli).is_none() {
                    return Err(error);
                }
                warn!(provider = %self.name, error = %error, "Disabling API leg");
                *self.api.write().expect("hybrid lock poisoned") = None;
            }
        }
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        self.leg(&self.cli).is_some_and(|p| p.supports_streaming())
            || self.leg(&self.api).is_some_and(|p| p.supports_streaming())
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ExecuteResponse> {
        self.run(request, cancel, None).await
    }

    async fn execute_streaming(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
        on_delta: StreamCallback,
    ) -> ProviderResult<ExecuteResponse> {
        self.run(request, cancel, Some(on_delta)).await
    }

    async fn shutdown(&self) {
        if let Some(cli) = self.leg(&self.cli) {
            cli.shutdown().await;
        }
        if let Some(api) = self.leg(&self.api) {
            api.shutdown().await;
        }
    }
}
