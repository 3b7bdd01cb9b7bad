//! Domain Ports - Core trait definitions for the control plane
//!
//! These traits define the boundaries between the orchestration core and
//! everything it treats as external: cloud providers, credential storage,
//! audit persistence and the real-time transport.

use crate::domain::model::{
    CreateClusterRequest, CreateNetworkRequest, CreateNodeGroupRequest,
    CreateSecurityRuleSetRequest, CreateSubnetRequest, Credential, ManagedCluster, NodeGroup,
    NodeGroupRef, ProviderId, ResourceRef, ScaleNodeGroupRequest, SecretBundle,
    SecurityRuleSet, Subnet, VirtualNetwork,
};
use crate::error::Result;
use crate::events::Event;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Provider Capabilities
// =============================================================================

/// How a provider treats the address block of a virtual network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CidrPolicy {
    /// The caller must supply an explicit CIDR block
    Required,
    /// The provider can auto-allocate when no CIDR is given
    Optional,
}

/// Static description of what a provider's control plane demands.
/// The orchestrator validates requests against this before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub network_cidr: CidrPolicy,
    /// Networks are global objects rather than regional ones
    pub global_networks: bool,
    /// Minimum distinct zones across a cluster's subnets (0 = no subnets needed)
    pub min_cluster_subnet_zones: usize,
    /// Security rule sets must be attached to a network
    pub rule_sets_require_network: bool,
}

// =============================================================================
// Provider Adapter Port
// =============================================================================

/// Uniform resource contract every cloud provider implements.
///
/// Implementations translate normalized requests into provider-native calls
/// and map every native error into [`crate::error::Error`] before returning.
/// They hold no per-call mutable state beyond a pooled client.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Identifier this adapter is registered under
    fn provider(&self) -> ProviderId;

    fn capabilities(&self) -> ProviderCapabilities;

    // Clusters
    async fn create_cluster(
        &self,
        secrets: &SecretBundle,
        request: &CreateClusterRequest,
    ) -> Result<ManagedCluster>;

    async fn list_clusters(&self, secrets: &SecretBundle, region: &str)
        -> Result<Vec<ManagedCluster>>;

    async fn get_cluster(&self, secrets: &SecretBundle, cluster: &ResourceRef)
        -> Result<ManagedCluster>;

    async fn delete_cluster(&self, secrets: &SecretBundle, cluster: &ResourceRef) -> Result<()>;

    // Node groups
    async fn create_node_group(
        &self,
        secrets: &SecretBundle,
        request: &CreateNodeGroupRequest,
    ) -> Result<NodeGroup>;

    async fn list_node_groups(
        &self,
        secrets: &SecretBundle,
        cluster: &ResourceRef,
    ) -> Result<Vec<NodeGroup>>;

    async fn scale_node_group(
        &self,
        secrets: &SecretBundle,
        request: &ScaleNodeGroupRequest,
    ) -> Result<NodeGroup>;

    async fn delete_node_group(&self, secrets: &SecretBundle, node_group: &NodeGroupRef)
        -> Result<()>;

    // Networks
    async fn create_network(
        &self,
        secrets: &SecretBundle,
        request: &CreateNetworkRequest,
    ) -> Result<VirtualNetwork>;

    async fn list_networks(&self, secrets: &SecretBundle, region: &str)
        -> Result<Vec<VirtualNetwork>>;

    async fn get_network(&self, secrets: &SecretBundle, network: &ResourceRef)
        -> Result<VirtualNetwork>;

    async fn delete_network(&self, secrets: &SecretBundle, network: &ResourceRef) -> Result<()>;

    // Subnets
    async fn create_subnet(
        &self,
        secrets: &SecretBundle,
        request: &CreateSubnetRequest,
    ) -> Result<Subnet>;

    async fn delete_subnet(&self, secrets: &SecretBundle, subnet: &ResourceRef) -> Result<()>;

    // Security rule sets
    async fn create_security_rule_set(
        &self,
        secrets: &SecretBundle,
        request: &CreateSecurityRuleSetRequest,
    ) -> Result<SecurityRuleSet>;

    async fn delete_security_rule_set(
        &self,
        secrets: &SecretBundle,
        rule_set: &ResourceRef,
    ) -> Result<()>;

    /// Check control plane reachability
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Credential Resolution Port
// =============================================================================

/// Resolves a credential id into its provider and decrypted secrets.
/// Failures surface as `PermissionDenied` or `NotFound`.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential_id: &str) -> Result<Credential>;
}

// =============================================================================
// Audit Port
// =============================================================================

/// One audited orchestration action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub provider: ProviderId,
    pub details: BTreeMap<String, serde_json::Value>,
}

/// Fire-and-forget audit sink. A failure here never fails an operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_action(&self, record: AuditRecord) -> Result<()>;
}

// =============================================================================
// Event Delivery Port
// =============================================================================

/// Result of handing an event to one observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The observer's buffer is full; this delivery was dropped
    Full,
    /// The observer has gone away
    Closed,
}

/// Callback side of an observer connection. `deliver` must not block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: Arc<Event>) -> DeliveryOutcome;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ProviderAdapterRef = Arc<dyn ProviderAdapter>;
pub type CredentialResolverRef = Arc<dyn CredentialResolver>;
pub type AuditSinkRef = Arc<dyn AuditSink>;
pub type EventSinkRef = Arc<dyn EventSink>;
