//! Cloud provider capability layer
//!
//! Each operational cloud implements the [`Provider`] trait: prove that a
//! caller controls a source identity, and mint credentials for a target
//! identity. The broker never branches on provider tags itself - it asks the
//! [`ProviderRegistry`], which is populated once at startup.
//!
//! Verification consults only the source identity's own cloud and never reads
//! the policy snapshot; minting consults only the target's cloud and the
//! secret store and never re-checks policy.

mod aws;
mod gcp;
mod k8s;

pub use aws::AwsProvider;
pub use gcp::GcpProvider;
pub use k8s::K8sProvider;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Error;
use crate::identity::{CloudProvider, CredentialBag, Identity};
use crate::vault::VaultClient;
use crate::Result;

/// Per-cloud verify/mint capability
///
/// `verify` reports only a boolean; the cause of a refusal is logged with the
/// request correlation token, never fabricated into a positive. `mint`
/// collapses provider SDK failures into the broker error taxonomy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Whether the caller provably controls `source.id` under this provider
    async fn verify(&self, source: &Identity) -> bool;

    /// Produce outbound credentials for the target identity
    async fn mint(&self, target: &Identity) -> Result<CredentialBag>;
}

/// Dispatch table from provider tag to capability implementation
///
/// Built once at startup. Tags without a registration (`azr`, unknown) verify
/// to false and mint to a provider-unsupported error.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<CloudProvider, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard registry with the aws, gcp, and k8s capabilities
    pub fn standard(vault: Arc<VaultClient>) -> Self {
        let mut registry = Self::new();
        registry.register(CloudProvider::Aws, Arc::new(AwsProvider::new()));
        registry.register(CloudProvider::Gcp, Arc::new(GcpProvider::new(vault.clone())));
        registry.register(CloudProvider::K8s, Arc::new(K8sProvider::new(vault)));
        registry
    }

    /// Register a capability for a provider tag
    pub fn register(&mut self, tag: CloudProvider, provider: Arc<dyn Provider>) {
        self.providers.insert(tag, provider);
    }

    /// Verify a source identity with its own cloud
    ///
    /// Selection is a function of `source.provider` alone; an unregistered
    /// tag is a refusal, not an error.
    pub async fn verify(&self, source: &Identity) -> bool {
        match self.providers.get(&source.provider) {
            Some(provider) => provider.verify(source).await,
            None => {
                warn!(
                    request_id = %source.request_id,
                    provider = %source.provider,
                    "no verifier registered for source provider"
                );
                false
            }
        }
    }

    /// Mint credentials for a target identity
    pub async fn mint(&self, target: &Identity) -> Result<CredentialBag> {
        match self.providers.get(&target.provider) {
            Some(provider) => provider.mint(target).await,
            None => Err(Error::ProviderUnsupported(target.provider.to_string())),
        }
    }
}
