//! Resource Orchestrator
//!
//! Lifecycle service for managed clusters and network resources:
//! - Validates requests against the target provider's capabilities
//! - Resolves credentials and dispatches through the provider registry
//! - Publishes lifecycle events and audit records
//!
//! Single-resource operations are validated pass-throughs. The composite
//! "cluster with its own network" operation lives in [`super::composite`].

use crate::domain::context::CallContext;
use crate::domain::model::{
    CreateClusterRequest, CreateNetworkRequest, CreateNodeGroupRequest,
    CreateSecurityRuleSetRequest, CreateSubnetRequest, Credential, ManagedCluster, NodeGroup,
    NodeGroupRef, ProviderId, ResourceRef, ScaleNodeGroupRequest, SecurityRuleSet, Subnet,
    VirtualNetwork,
};
use crate::domain::ports::{
    AuditRecord, AuditSinkRef, CidrPolicy, CredentialResolverRef, ProviderAdapterRef,
    ProviderCapabilities,
};
use crate::error::{Error, Result};
use crate::events::topic::GLOBAL_REGION;
use crate::events::{EventAction, EventPublisher, ResourceFamily, TopicResource};
use crate::providers::ProviderRegistry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Actor recorded when a call carries none
const SYSTEM_ACTOR: &str = "system";

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deadline for each remote provider call
    pub call_timeout_secs: u64,
    /// Emit audit records for mutating operations
    pub audit_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            audit_enabled: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

// =============================================================================
// Dispatch Target
// =============================================================================

/// A resolved credential together with the adapter serving its provider
pub(crate) struct Target {
    pub credential: Credential,
    pub adapter: ProviderAdapterRef,
}

impl Target {
    pub fn capabilities(&self) -> ProviderCapabilities {
        self.adapter.capabilities()
    }

    pub fn provider(&self) -> &ProviderId {
        &self.credential.provider
    }

    /// Region segment for network-scoped objects of this provider
    pub fn network_region<'a>(&self, region: &'a str) -> &'a str {
        if self.capabilities().global_networks {
            GLOBAL_REGION
        } else {
            region
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Cluster and network lifecycle service
pub struct ResourceOrchestrator {
    config: OrchestratorConfig,
    providers: Arc<ProviderRegistry>,
    credentials: CredentialResolverRef,
    audit: Option<AuditSinkRef>,
    publisher: EventPublisher,
}

impl ResourceOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        providers: Arc<ProviderRegistry>,
        credentials: CredentialResolverRef,
        audit: Option<AuditSinkRef>,
        publisher: EventPublisher,
    ) -> Arc<Self> {
        info!(
            providers = ?providers.providers(),
            call_timeout_secs = config.call_timeout_secs,
            "Creating resource orchestrator"
        );
        Arc::new(Self {
            config,
            providers,
            credentials,
            audit,
            publisher,
        })
    }

    /// Fresh call context carrying the configured deadline
    pub fn context(&self) -> CallContext {
        CallContext::new(self.config.call_timeout())
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Resolve `credential_id` and select its adapter
    pub(crate) async fn target(&self, ctx: &CallContext, credential_id: &str) -> Result<Target> {
        let credential = ctx
            .run("ResolveCredential", self.credentials.resolve(credential_id))
            .await?;
        let adapter = self.providers.dispatch(&credential.provider)?;
        Ok(Target {
            credential,
            adapter,
        })
    }

    /// Hand an audit record to the sink without waiting for it
    pub(crate) fn audit(
        &self,
        ctx: &CallContext,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        credential: &Credential,
        details: BTreeMap<String, Value>,
    ) {
        if !self.config.audit_enabled {
            return;
        }
        let Some(sink) = self.audit.clone() else {
            return;
        };

        let mut details = details;
        details.insert("credential_id".to_string(), json!(credential.id));
        details.insert("request_id".to_string(), json!(ctx.request_id));

        let record = AuditRecord {
            actor_id: ctx
                .actor_id
                .clone()
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            provider: credential.provider.clone(),
            details,
        };

        tokio::spawn(async move {
            if let Err(e) = sink.log_action(record).await {
                warn!("Failed to write audit record: {}", e);
            }
        });
    }

    // =========================================================================
    // Clusters
    // =========================================================================

    pub async fn create_cluster(
        &self,
        ctx: &CallContext,
        request: &CreateClusterRequest,
    ) -> Result<ManagedCluster> {
        request.validate()?;
        let target = self.target(ctx, &request.credential_id).await?;
        validate_cluster_subnets(&target, request)?;

        debug!(provider = %target.provider(), name = %request.name, "Creating cluster");
        let cluster = ctx
            .run(
                "CreateCluster",
                target
                    .adapter
                    .create_cluster(&target.credential.secrets, request),
            )
            .await?;

        info!(
            provider = %target.provider(),
            region = %cluster.region,
            "Created cluster: {} -> {}",
            request.name,
            cluster.id
        );
        self.publisher
            .cluster(EventAction::Created, &target.credential, &cluster);
        self.audit(
            ctx,
            "create",
            "cluster",
            &cluster.id,
            &target.credential,
            BTreeMap::from([
                ("name".to_string(), json!(cluster.name)),
                ("region".to_string(), json!(cluster.region)),
                ("version".to_string(), json!(cluster.version)),
            ]),
        );
        Ok(cluster)
    }

    pub async fn list_clusters(
        &self,
        ctx: &CallContext,
        credential_id: &str,
        region: &str,
    ) -> Result<Vec<ManagedCluster>> {
        let target = self.target(ctx, credential_id).await?;
        ctx.run(
            "ListClusters",
            target
                .adapter
                .list_clusters(&target.credential.secrets, region),
        )
        .await
    }

    pub async fn get_cluster(
        &self,
        ctx: &CallContext,
        cluster: &ResourceRef,
    ) -> Result<ManagedCluster> {
        cluster.validate("cluster")?;
        let target = self.target(ctx, &cluster.credential_id).await?;
        ctx.run(
            "GetCluster",
            target.adapter.get_cluster(&target.credential.secrets, cluster),
        )
        .await
    }

    pub async fn delete_cluster(&self, ctx: &CallContext, cluster: &ResourceRef) -> Result<()> {
        cluster.validate("cluster")?;
        let target = self.target(ctx, &cluster.credential_id).await?;
        ctx.run(
            "DeleteCluster",
            target
                .adapter
                .delete_cluster(&target.credential.secrets, cluster),
        )
        .await?;

        info!(provider = %target.provider(), "Deleted cluster: {}", cluster.id);
        self.publisher.deleted(
            ResourceFamily::Kubernetes,
            TopicResource::Clusters,
            &target.credential,
            &cluster.region,
            &cluster.id,
        );
        self.audit(
            ctx,
            "delete",
            "cluster",
            &cluster.id,
            &target.credential,
            BTreeMap::from([("region".to_string(), json!(cluster.region))]),
        );
        Ok(())
    }

    // =========================================================================
    // Node Groups
    // =========================================================================

    pub async fn create_node_group(
        &self,
        ctx: &CallContext,
        request: &CreateNodeGroupRequest,
    ) -> Result<NodeGroup> {
        request.validate()?;
        let target = self.target(ctx, &request.credential_id).await?;

        let node_group = ctx
            .run(
                "CreateNodeGroup",
                target
                    .adapter
                    .create_node_group(&target.credential.secrets, request),
            )
            .await?;

        info!(
            provider = %target.provider(),
            cluster = %request.cluster_id,
            "Created node group: {}",
            node_group.id
        );
        self.publisher.node_group(
            EventAction::Created,
            &target.credential,
            &request.region,
            &node_group,
        );
        self.audit(
            ctx,
            "create",
            "node_group",
            &node_group.id,
            &target.credential,
            BTreeMap::from([
                ("cluster_id".to_string(), json!(request.cluster_id)),
                ("desired_count".to_string(), json!(node_group.desired_count)),
            ]),
        );
        Ok(node_group)
    }

    pub async fn list_node_groups(
        &self,
        ctx: &CallContext,
        cluster: &ResourceRef,
    ) -> Result<Vec<NodeGroup>> {
        cluster.validate("cluster")?;
        let target = self.target(ctx, &cluster.credential_id).await?;
        ctx.run(
            "ListNodeGroups",
            target
                .adapter
                .list_node_groups(&target.credential.secrets, cluster),
        )
        .await
    }

    pub async fn scale_node_group(
        &self,
        ctx: &CallContext,
        request: &ScaleNodeGroupRequest,
    ) -> Result<NodeGroup> {
        request.validate()?;
        let target = self.target(ctx, &request.credential_id).await?;

        let node_group = ctx
            .run(
                "ScaleNodeGroup",
                target
                    .adapter
                    .scale_node_group(&target.credential.secrets, request),
            )
            .await?;

        info!(
            provider = %target.provider(),
            desired = node_group.desired_count,
            "Scaled node group: {}",
            node_group.id
        );
        self.publisher.node_group(
            EventAction::Updated,
            &target.credential,
            &request.region,
            &node_group,
        );
        self.audit(
            ctx,
            "scale",
            "node_group",
            &node_group.id,
            &target.credential,
            BTreeMap::from([
                ("cluster_id".to_string(), json!(request.cluster_id)),
                ("desired_count".to_string(), json!(request.desired_count)),
            ]),
        );
        Ok(node_group)
    }

    pub async fn delete_node_group(
        &self,
        ctx: &CallContext,
        node_group: &NodeGroupRef,
    ) -> Result<()> {
        node_group.validate()?;
        let target = self.target(ctx, &node_group.credential_id).await?;
        ctx.run(
            "DeleteNodeGroup",
            target
                .adapter
                .delete_node_group(&target.credential.secrets, node_group),
        )
        .await?;

        info!(
            provider = %target.provider(),
            cluster = %node_group.cluster_id,
            "Deleted node group: {}",
            node_group.node_group_id
        );
        self.publisher.deleted(
            ResourceFamily::Kubernetes,
            TopicResource::NodeGroups,
            &target.credential,
            &node_group.region,
            &node_group.node_group_id,
        );
        self.audit(
            ctx,
            "delete",
            "node_group",
            &node_group.node_group_id,
            &target.credential,
            BTreeMap::from([("cluster_id".to_string(), json!(node_group.cluster_id))]),
        );
        Ok(())
    }

    // =========================================================================
    // Networks
    // =========================================================================

    pub async fn create_network(
        &self,
        ctx: &CallContext,
        request: &CreateNetworkRequest,
    ) -> Result<VirtualNetwork> {
        request.validate()?;
        let target = self.target(ctx, &request.credential_id).await?;
        if target.capabilities().network_cidr == CidrPolicy::Required
            && request.cidr_block.is_none()
        {
            return Err(Error::invalid(format!(
                "cidr_block is required for {} networks",
                target.provider()
            )));
        }

        let network = ctx
            .run(
                "CreateNetwork",
                target
                    .adapter
                    .create_network(&target.credential.secrets, request),
            )
            .await?;

        info!(
            provider = %target.provider(),
            region = %network.region,
            "Created network: {} -> {}",
            request.name,
            network.id
        );
        self.publisher
            .network(EventAction::Created, &target.credential, &network);
        self.audit(
            ctx,
            "create",
            "network",
            &network.id,
            &target.credential,
            BTreeMap::from([
                ("name".to_string(), json!(network.name)),
                ("cidr_block".to_string(), json!(network.cidr_block)),
            ]),
        );
        Ok(network)
    }

    pub async fn list_networks(
        &self,
        ctx: &CallContext,
        credential_id: &str,
        region: &str,
    ) -> Result<Vec<VirtualNetwork>> {
        let target = self.target(ctx, credential_id).await?;
        ctx.run(
            "ListNetworks",
            target
                .adapter
                .list_networks(&target.credential.secrets, region),
        )
        .await
    }

    pub async fn get_network(
        &self,
        ctx: &CallContext,
        network: &ResourceRef,
    ) -> Result<VirtualNetwork> {
        network.validate("network")?;
        let target = self.target(ctx, &network.credential_id).await?;
        ctx.run(
            "GetNetwork",
            target.adapter.get_network(&target.credential.secrets, network),
        )
        .await
    }

    pub async fn delete_network(&self, ctx: &CallContext, network: &ResourceRef) -> Result<()> {
        network.validate("network")?;
        let target = self.target(ctx, &network.credential_id).await?;
        ctx.run(
            "DeleteNetwork",
            target
                .adapter
                .delete_network(&target.credential.secrets, network),
        )
        .await?;

        info!(provider = %target.provider(), "Deleted network: {}", network.id);
        self.publisher.deleted(
            ResourceFamily::Network,
            TopicResource::Vpcs,
            &target.credential,
            target.network_region(&network.region),
            &network.id,
        );
        self.audit(
            ctx,
            "delete",
            "network",
            &network.id,
            &target.credential,
            BTreeMap::new(),
        );
        Ok(())
    }

    // =========================================================================
    // Subnets
    // =========================================================================

    pub async fn create_subnet(
        &self,
        ctx: &CallContext,
        request: &CreateSubnetRequest,
    ) -> Result<Subnet> {
        request.validate()?;
        let target = self.target(ctx, &request.credential_id).await?;
        self.require_network(ctx, &target, &request.region, &request.vpc_id)
            .await?;

        let subnet = ctx
            .run(
                "CreateSubnet",
                target
                    .adapter
                    .create_subnet(&target.credential.secrets, request),
            )
            .await?;

        info!(
            provider = %target.provider(),
            vpc = %subnet.vpc_id,
            zone = %subnet.zone,
            "Created subnet: {} -> {}",
            request.name,
            subnet.id
        );
        self.publisher
            .subnet(EventAction::Created, &target.credential, &subnet);
        self.audit(
            ctx,
            "create",
            "subnet",
            &subnet.id,
            &target.credential,
            BTreeMap::from([
                ("vpc_id".to_string(), json!(subnet.vpc_id)),
                ("cidr_block".to_string(), json!(subnet.cidr_block)),
            ]),
        );
        Ok(subnet)
    }

    pub async fn delete_subnet(&self, ctx: &CallContext, subnet: &ResourceRef) -> Result<()> {
        subnet.validate("subnet")?;
        let target = self.target(ctx, &subnet.credential_id).await?;
        ctx.run(
            "DeleteSubnet",
            target.adapter.delete_subnet(&target.credential.secrets, subnet),
        )
        .await?;

        info!(provider = %target.provider(), "Deleted subnet: {}", subnet.id);
        self.publisher.deleted(
            ResourceFamily::Network,
            TopicResource::Subnets,
            &target.credential,
            &subnet.region,
            &subnet.id,
        );
        self.audit(
            ctx,
            "delete",
            "subnet",
            &subnet.id,
            &target.credential,
            BTreeMap::new(),
        );
        Ok(())
    }

    // =========================================================================
    // Security Rule Sets
    // =========================================================================

    pub async fn create_security_rule_set(
        &self,
        ctx: &CallContext,
        request: &CreateSecurityRuleSetRequest,
    ) -> Result<SecurityRuleSet> {
        request.validate()?;
        let target = self.target(ctx, &request.credential_id).await?;
        match &request.vpc_id {
            Some(vpc_id) => {
                self.require_network(ctx, &target, &request.region, vpc_id)
                    .await?;
            }
            None if target.capabilities().rule_sets_require_network => {
                return Err(Error::invalid(format!(
                    "vpc_id is required for {} rule sets",
                    target.provider()
                )));
            }
            None => {}
        }

        let rule_set = ctx
            .run(
                "CreateSecurityRuleSet",
                target
                    .adapter
                    .create_security_rule_set(&target.credential.secrets, request),
            )
            .await?;

        info!(
            provider = %target.provider(),
            rules = rule_set.rules.len(),
            "Created security rule set: {} -> {}",
            request.name,
            rule_set.id
        );
        self.publisher
            .security_rule_set(EventAction::Created, &target.credential, &rule_set);
        self.audit(
            ctx,
            "create",
            "security_rule_set",
            &rule_set.id,
            &target.credential,
            BTreeMap::from([
                ("name".to_string(), json!(rule_set.name)),
                ("vpc_id".to_string(), json!(rule_set.vpc_id)),
            ]),
        );
        Ok(rule_set)
    }

    pub async fn delete_security_rule_set(
        &self,
        ctx: &CallContext,
        rule_set: &ResourceRef,
    ) -> Result<()> {
        rule_set.validate("security rule set")?;
        let target = self.target(ctx, &rule_set.credential_id).await?;
        ctx.run(
            "DeleteSecurityRuleSet",
            target
                .adapter
                .delete_security_rule_set(&target.credential.secrets, rule_set),
        )
        .await?;

        info!(provider = %target.provider(), "Deleted security rule set: {}", rule_set.id);
        self.publisher.deleted(
            ResourceFamily::Network,
            TopicResource::SecurityGroups,
            &target.credential,
            target.network_region(&rule_set.region),
            &rule_set.id,
        );
        self.audit(
            ctx,
            "delete",
            "security_rule_set",
            &rule_set.id,
            &target.credential,
            BTreeMap::new(),
        );
        Ok(())
    }

    /// Fail fast unless `vpc_id` exists under the same credential
    async fn require_network(
        &self,
        ctx: &CallContext,
        target: &Target,
        region: &str,
        vpc_id: &str,
    ) -> Result<VirtualNetwork> {
        let network = ResourceRef::new(&target.credential.id, region, vpc_id);
        ctx.run(
            "GetNetwork",
            target
                .adapter
                .get_network(&target.credential.secrets, &network),
        )
        .await
        .map_err(|e| match e {
            Error::NotFound { .. } => Error::not_found("VirtualNetwork", vpc_id),
            other => other,
        })
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// List clusters in one scope and publish them as a `list` event.
    /// Returns the number of clusters published.
    pub async fn publish_cluster_snapshot(
        &self,
        ctx: &CallContext,
        credential_id: &str,
        region: &str,
    ) -> Result<usize> {
        let target = self.target(ctx, credential_id).await?;
        let clusters = ctx
            .run(
                "ListClusters",
                target
                    .adapter
                    .list_clusters(&target.credential.secrets, region),
            )
            .await?;
        self.publisher.snapshot(
            ResourceFamily::Kubernetes,
            TopicResource::Clusters,
            &target.credential,
            region,
            &clusters,
        );
        Ok(clusters.len())
    }

    /// Network counterpart of [`Self::publish_cluster_snapshot`]
    pub async fn publish_network_snapshot(
        &self,
        ctx: &CallContext,
        credential_id: &str,
        region: &str,
    ) -> Result<usize> {
        let target = self.target(ctx, credential_id).await?;
        let networks = ctx
            .run(
                "ListNetworks",
                target
                    .adapter
                    .list_networks(&target.credential.secrets, region),
            )
            .await?;
        self.publisher.snapshot(
            ResourceFamily::Network,
            TopicResource::Vpcs,
            &target.credential,
            target.network_region(region),
            &networks,
        );
        Ok(networks.len())
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Reachability of every registered provider
    pub async fn health(&self) -> BTreeMap<ProviderId, bool> {
        self.providers.health().await
    }
}

/// Providers that spread clusters across zones need that many distinct
/// subnets up front; the adapter checks the zones themselves.
fn validate_cluster_subnets(target: &Target, request: &CreateClusterRequest) -> Result<()> {
    let required = target.capabilities().min_cluster_subnet_zones;
    if required == 0 {
        return Ok(());
    }
    let distinct: BTreeSet<&str> = request.subnet_ids.iter().map(String::as_str).collect();
    if distinct.len() < required {
        return Err(Error::invalid(format!(
            "{} clusters need at least {} distinct subnets, got {}",
            target.provider(),
            required,
            distinct.len()
        )));
    }
    Ok(())
}
