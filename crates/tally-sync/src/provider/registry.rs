//! Provider registry: provider id → adapter factory.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::http::ProviderHttp;
use super::{clover, square, toast, AdapterContext, SalesSource};
use crate::config::TallyConfig;
use crate::error::SyncResult;
use tally_core::ValidationError;

/// Builds adapters for one provider.
pub trait AdapterFactory: Send + Sync {
    fn provider(&self) -> &'static str;

    fn create(&self, ctx: AdapterContext) -> Box<dyn SalesSource>;
}

/// Adapter factories keyed by provider id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, Arc<dyn AdapterFactory>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Square, Toast and Clover adapters, pointed at the
    /// configured base URLs.
    pub fn builtin(config: &TallyConfig) -> SyncResult<Self> {
        let timeout = config.sync.request_timeout();
        let base = |id: &str, default: &str| -> String {
            config.base_url(id).unwrap_or(default).to_string()
        };

        let mut registry = Self::new();
        registry.register(Arc::new(square::SquareFactory::new(ProviderHttp::new(
            square::PROVIDER,
            base(square::PROVIDER, square::DEFAULT_BASE_URL),
            timeout,
        )?)));
        registry.register(Arc::new(toast::ToastFactory::new(ProviderHttp::new(
            toast::PROVIDER,
            base(toast::PROVIDER, toast::DEFAULT_BASE_URL),
            timeout,
        )?)));
        registry.register(Arc::new(clover::CloverFactory::new(ProviderHttp::new(
            clover::PROVIDER,
            base(clover::PROVIDER, clover::DEFAULT_BASE_URL),
            timeout,
        )?)));
        Ok(registry)
    }

    /// Adds (or replaces) a factory under its provider id.
    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        let id = factory.provider().to_string();
        debug!(provider = %id, "Registered provider adapter");
        self.factories.insert(id, factory);
    }

    /// Looks up a provider.
    ///
    /// ## Errors
    /// * `ValidationError::UnsupportedProvider` - no adapter for `provider`
    pub fn resolve(&self, provider: &str) -> SyncResult<Arc<dyn AdapterFactory>> {
        self.factories.get(provider).cloned().ok_or_else(|| {
            ValidationError::UnsupportedProvider {
                provider: provider.to_string(),
            }
            .into()
        })
    }

    /// Builds an adapter for `provider` bound to `ctx`.
    pub fn create(&self, provider: &str, ctx: AdapterContext) -> SyncResult<Box<dyn SalesSource>> {
        Ok(self.resolve(provider)?.create(ctx))
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.factories.contains_key(provider)
    }

    /// Registered provider ids, sorted.
    pub fn providers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
