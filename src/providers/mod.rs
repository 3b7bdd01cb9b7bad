//! Provider Adapters
//!
//! Provides cloud-specific adapters for:
//! - AWS (EKS, EC2 VPC / subnets / security groups)
//! - GCP (GKE, Compute networks / subnetworks / firewalls)
//!
//! The [`ProviderRegistry`] maps a provider identifier to its adapter and is
//! built once at startup; lookups need no locking afterwards.

pub mod aws;
pub mod gcp;

pub use aws::{AwsAdapter, AwsConfig, AwsSettings};
pub use gcp::{GcpAdapter, GcpConfig, GcpSettings};

use crate::domain::model::ProviderId;
use crate::domain::ports::{ProviderAdapter, ProviderAdapterRef};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Registry
// =============================================================================

/// Provider identifier to adapter mapping
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderId, ProviderAdapterRef>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own provider id
    pub fn register(&mut self, adapter: ProviderAdapterRef) -> Result<()> {
        let provider = adapter.provider();
        if self.adapters.contains_key(&provider) {
            return Err(Error::Conflict(format!(
                "provider already registered: {}",
                provider
            )));
        }
        info!(provider = %provider, "Registered provider adapter");
        self.adapters.insert(provider, adapter);
        Ok(())
    }

    /// Builder-style registration
    pub fn with(mut self, adapter: impl ProviderAdapter + 'static) -> Result<Self> {
        self.register(Arc::new(adapter))?;
        Ok(self)
    }

    /// Select the adapter for `provider`. Never touches the network.
    pub fn dispatch(&self, provider: &ProviderId) -> Result<ProviderAdapterRef> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("unsupported provider: {}", provider)))
    }

    pub fn contains(&self, provider: &ProviderId) -> bool {
        self.adapters.contains_key(provider)
    }

    /// Registered providers, sorted
    pub fn providers(&self) -> Vec<ProviderId> {
        let mut providers: Vec<_> = self.adapters.keys().cloned().collect();
        providers.sort();
        providers
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Reachability of every registered control plane
    pub async fn health(&self) -> BTreeMap<ProviderId, bool> {
        let checks = self.adapters.iter().map(|(id, adapter)| {
            let adapter = adapter.clone();
            let id = id.clone();
            async move {
                let healthy = adapter.health_check().await.unwrap_or(false);
                (id, healthy)
            }
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Combined provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub aws: AwsConfig,
    pub gcp: GcpConfig,
}

/// Factory for building the registry from configuration
pub struct ProviderFactory;

impl ProviderFactory {
    /// Registry with every enabled provider, each backed by its simulated
    /// control plane
    pub fn create(config: &ProvidersConfig) -> Result<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        if config.aws.enabled {
            registry.register(Arc::new(AwsAdapter::in_memory(config.aws.clone())))?;
        }
        if config.gcp.enabled {
            registry.register(Arc::new(GcpAdapter::in_memory(config.gcp.clone())))?;
        }
        if registry.is_empty() {
            return Err(Error::Configuration("no providers enabled".to_string()));
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    impl std::fmt::Debug for dyn ProviderAdapter {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_tuple("ProviderAdapter").field(&self.provider()).finish()
        }
    }

    #[test]
    fn test_dispatch_unknown_provider() {
        let registry = ProviderFactory::create(&ProvidersConfig::default()).unwrap();

        assert!(registry.dispatch(&ProviderId::aws()).is_ok());
        assert!(registry.dispatch(&ProviderId::new("GCP")).is_ok());
        assert_matches!(
            registry.dispatch(&ProviderId::new("azure")),
            Err(Error::InvalidArgument(msg)) if msg == "unsupported provider: azure"
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = ProviderRegistry::new()
            .with(AwsAdapter::in_memory(AwsConfig::default()))
            .unwrap();
        let err = registry
            .with(AwsAdapter::in_memory(AwsConfig::default()))
            .unwrap_err();
        assert_matches!(err, Error::Conflict(_));
    }

    #[test]
    fn test_disabled_providers() {
        let mut config = ProvidersConfig::default();
        config.gcp.enabled = false;
        let registry = ProviderFactory::create(&config).unwrap();
        assert_eq!(registry.providers(), vec![ProviderId::aws()]);

        config.aws.enabled = false;
        assert_matches!(
            ProviderFactory::create(&config),
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_health() {
        let registry = ProviderFactory::create(&ProvidersConfig::default()).unwrap();
        let health = registry.health().await;
        assert_eq!(health.len(), 2);
        assert!(health.values().all(|ok| *ok));
    }
}
