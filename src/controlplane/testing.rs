//! Test doubles for the control plane tests

use crate::controlplane::credentials::{CredentialEntry, StaticCredentialResolver};
use crate::controlplane::orchestrator::{OrchestratorConfig, ResourceOrchestrator};
use crate::domain::model::{
    ClusterStatus, CreateClusterRequest, CreateNetworkRequest, CreateNodeGroupRequest,
    CreateSecurityRuleSetRequest, CreateSubnetRequest, ManagedCluster, NetworkStatus, NodeGroup,
    NodeGroupRef, ProviderId, ResourceRef, ScaleNodeGroupRequest, SecretBundle, SecurityRuleSet,
    Subnet, VirtualNetwork,
};
use crate::domain::ports::{
    AuditRecord, AuditSink, CidrPolicy, ProviderAdapter, ProviderCapabilities,
};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{Event, EventBus, EventBusConfig, EventPublisher, SubscriptionFilter};
use crate::events::subscriptions::SubscriptionRegistry;
use crate::events::topic::GLOBAL_REGION;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Recording Adapter
// =============================================================================

/// Adapter that records every call and fails or stalls on demand
pub(crate) struct MockAdapter {
    provider: ProviderId,
    capabilities: ProviderCapabilities,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, ErrorKind>>,
    delays: Mutex<HashMap<String, Duration>>,
    networks: Mutex<HashSet<String>>,
    seq: AtomicU64,
}

impl MockAdapter {
    pub fn new(provider: &str, capabilities: ProviderCapabilities) -> Arc<Self> {
        Arc::new(Self {
            provider: ProviderId::new(provider),
            capabilities,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            networks: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
        })
    }

    /// Regional networks with mandatory CIDRs, clusters across two zones
    pub fn aws_like() -> Arc<Self> {
        Self::new(
            "aws",
            ProviderCapabilities {
                network_cidr: CidrPolicy::Required,
                global_networks: false,
                min_cluster_subnet_zones: 2,
                rule_sets_require_network: false,
            },
        )
    }

    /// Global auto-mode networks, firewalls bound to a network
    pub fn gcp_like() -> Arc<Self> {
        Self::new(
            "gcp",
            ProviderCapabilities {
                network_cidr: CidrPolicy::Optional,
                global_networks: true,
                min_cluster_subnet_zones: 0,
                rule_sets_require_network: true,
            },
        )
    }

    pub fn fail(&self, operation: &str, kind: ErrorKind) {
        self.failures.lock().insert(operation.to_string(), kind);
    }

    pub fn stall(&self, operation: &str, delay: Duration) {
        self.delays.lock().insert(operation.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == operation).count()
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        self.calls.lock().push(operation.to_string());
        let delay = self.delays.lock().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().get(operation).copied();
        match failure {
            Some(kind) => Err(error_of(kind, operation)),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn network_region(&self, region: &str) -> String {
        if self.capabilities.global_networks {
            GLOBAL_REGION.to_string()
        } else {
            region.to_string()
        }
    }
}

pub(crate) fn error_of(kind: ErrorKind, operation: &str) -> Error {
    let msg = format!("{} failed", operation);
    match kind {
        ErrorKind::NotFound => Error::not_found("Resource", operation),
        ErrorKind::PermissionDenied => Error::PermissionDenied(msg),
        ErrorKind::QuotaExceeded => Error::QuotaExceeded(msg),
        ErrorKind::Conflict => Error::Conflict(msg),
        ErrorKind::InvalidArgument => Error::InvalidArgument(msg),
        ErrorKind::Unavailable => Error::Unavailable(msg),
        ErrorKind::Unknown => Error::Unknown(msg),
        ErrorKind::Internal => Error::Internal(msg),
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> ProviderId {
        self.provider.clone()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn create_cluster(
        &self,
        _secrets: &SecretBundle,
        request: &CreateClusterRequest,
    ) -> Result<ManagedCluster> {
        self.enter("create_cluster").await?;
        Ok(ManagedCluster {
            id: request.name.clone(),
            name: request.name.clone(),
            provider: self.provider.clone(),
            region: request.region.clone(),
            version: request.version.clone(),
            status: ClusterStatus::Provisioning,
            network_refs: request
                .vpc_id
                .iter()
                .chain(&request.subnet_ids)
                .cloned()
                .collect(),
            endpoint: None,
            created_at: Utc::now(),
        })
    }

    async fn list_clusters(
        &self,
        _secrets: &SecretBundle,
        region: &str,
    ) -> Result<Vec<ManagedCluster>> {
        self.enter("list_clusters").await?;
        Ok(vec![ManagedCluster {
            id: "listed".into(),
            name: "listed".into(),
            provider: self.provider.clone(),
            region: region.to_string(),
            version: "1.29".into(),
            status: ClusterStatus::Active,
            network_refs: Vec::new(),
            endpoint: None,
            created_at: Utc::now(),
        }])
    }

    async fn get_cluster(
        &self,
        _secrets: &SecretBundle,
        cluster: &ResourceRef,
    ) -> Result<ManagedCluster> {
        self.enter("get_cluster").await?;
        Err(Error::not_found("Cluster", &cluster.id))
    }

    async fn delete_cluster(&self, _secrets: &SecretBundle, _cluster: &ResourceRef) -> Result<()> {
        self.enter("delete_cluster").await
    }

    async fn create_node_group(
        &self,
        _secrets: &SecretBundle,
        request: &CreateNodeGroupRequest,
    ) -> Result<NodeGroup> {
        self.enter("create_node_group").await?;
        Ok(NodeGroup {
            id: request.name.clone(),
            cluster_id: request.cluster_id.clone(),
            name: request.name.clone(),
            desired_count: request.desired_count,
            instance_spec: request.instance_spec.clone(),
            autoscaling: request.autoscaling,
            status: ClusterStatus::Provisioning,
        })
    }

    async fn list_node_groups(
        &self,
        _secrets: &SecretBundle,
        _cluster: &ResourceRef,
    ) -> Result<Vec<NodeGroup>> {
        self.enter("list_node_groups").await?;
        Ok(Vec::new())
    }

    async fn scale_node_group(
        &self,
        _secrets: &SecretBundle,
        request: &ScaleNodeGroupRequest,
    ) -> Result<NodeGroup> {
        self.enter("scale_node_group").await?;
        Err(Error::not_found("NodeGroup", &request.node_group_id))
    }

    async fn delete_node_group(
        &self,
        _secrets: &SecretBundle,
        _node_group: &NodeGroupRef,
    ) -> Result<()> {
        self.enter("delete_node_group").await
    }

    async fn create_network(
        &self,
        _secrets: &SecretBundle,
        request: &CreateNetworkRequest,
    ) -> Result<VirtualNetwork> {
        self.enter("create_network").await?;
        let id = self.next_id("net");
        self.networks.lock().insert(id.clone());
        Ok(VirtualNetwork {
            id,
            name: request.name.clone(),
            cidr_block: request.cidr_block.clone(),
            region: self.network_region(&request.region),
            provider: self.provider.clone(),
            status: NetworkStatus::Available,
        })
    }

    async fn list_networks(
        &self,
        _secrets: &SecretBundle,
        region: &str,
    ) -> Result<Vec<VirtualNetwork>> {
        self.enter("list_networks").await?;
        let region = self.network_region(region);
        Ok(self
            .networks
            .lock()
            .iter()
            .map(|id| VirtualNetwork {
                id: id.clone(),
                name: id.clone(),
                cidr_block: None,
                region: region.clone(),
                provider: self.provider.clone(),
                status: NetworkStatus::Available,
            })
            .collect())
    }

    async fn get_network(
        &self,
        _secrets: &SecretBundle,
        network: &ResourceRef,
    ) -> Result<VirtualNetwork> {
        self.enter("get_network").await?;
        if !self.networks.lock().contains(&network.id) {
            return Err(Error::not_found("VirtualNetwork", &network.id));
        }
        Ok(VirtualNetwork {
            id: network.id.clone(),
            name: network.id.clone(),
            cidr_block: None,
            region: self.network_region(&network.region),
            provider: self.provider.clone(),
            status: NetworkStatus::Available,
        })
    }

    async fn delete_network(&self, _secrets: &SecretBundle, network: &ResourceRef) -> Result<()> {
        self.enter("delete_network").await?;
        self.networks.lock().remove(&network.id);
        Ok(())
    }

    async fn create_subnet(
        &self,
        _secrets: &SecretBundle,
        request: &CreateSubnetRequest,
    ) -> Result<Subnet> {
        self.enter("create_subnet").await?;
        Ok(Subnet {
            id: self.next_id("subnet"),
            vpc_id: request.vpc_id.clone(),
            name: request.name.clone(),
            cidr_block: request.cidr_block.clone(),
            zone: request.zone.clone(),
            region: request.region.clone(),
            is_public: request.is_public,
        })
    }

    async fn delete_subnet(&self, _secrets: &SecretBundle, _subnet: &ResourceRef) -> Result<()> {
        self.enter("delete_subnet").await
    }

    async fn create_security_rule_set(
        &self,
        _secrets: &SecretBundle,
        request: &CreateSecurityRuleSetRequest,
    ) -> Result<SecurityRuleSet> {
        self.enter("create_security_rule_set").await?;
        Ok(SecurityRuleSet {
            id: self.next_id("sg"),
            name: request.name.clone(),
            vpc_id: request.vpc_id.clone(),
            region: self.network_region(&request.region),
            rules: request.rules.clone(),
        })
    }

    async fn delete_security_rule_set(
        &self,
        _secrets: &SecretBundle,
        _rule_set: &ResourceRef,
    ) -> Result<()> {
        self.enter("delete_security_rule_set").await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

// =============================================================================
// Audit Recorder
// =============================================================================

#[derive(Default)]
pub(crate) struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log_action(&self, record: AuditRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub(crate) const CREDENTIAL_ID: &str = "cred-1";
/// Resolves to a provider with no registered adapter
pub(crate) const UNSUPPORTED_CREDENTIAL_ID: &str = "cred-azure";

/// Orchestrator wired to a running bus, one mock adapter and an observer
/// subscribed to every six-segment topic
pub(crate) struct Harness {
    pub orchestrator: Arc<ResourceOrchestrator>,
    pub bus: Arc<EventBus>,
    pub adapter: Arc<MockAdapter>,
    pub audit: Arc<MemoryAuditSink>,
    pub events: mpsc::Receiver<Arc<Event>>,
}

impl Harness {
    pub fn new(adapter: Arc<MockAdapter>) -> Self {
        let registry = SubscriptionRegistry::new();
        // One worker keeps delivery in publish order
        let config = EventBusConfig {
            workers: 1,
            ..EventBusConfig::default()
        };
        let bus = EventBus::new(config, registry.clone());
        bus.start().unwrap();

        let events = bus.connect("observer").unwrap();
        registry
            .subscribe("observer", "*.*.*.*.*.*", SubscriptionFilter::any())
            .unwrap();

        let mut providers = crate::providers::ProviderRegistry::new();
        providers.register(adapter.clone()).unwrap();

        let credentials = StaticCredentialResolver::new(vec![
            CredentialEntry {
                id: CREDENTIAL_ID.to_string(),
                provider: adapter.provider().to_string(),
                workspace_id: None,
                enabled: true,
                secrets: BTreeMap::new(),
            },
            CredentialEntry {
                id: UNSUPPORTED_CREDENTIAL_ID.to_string(),
                provider: "azure".to_string(),
                workspace_id: None,
                enabled: true,
                secrets: BTreeMap::new(),
            },
        ])
        .unwrap();

        let audit = Arc::new(MemoryAuditSink::default());
        let orchestrator = ResourceOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(providers),
            Arc::new(credentials),
            Some(audit.clone()),
            EventPublisher::new(bus.clone()),
        );

        Self {
            orchestrator,
            bus,
            adapter,
            audit,
            events,
        }
    }

    /// Collect every event delivered so far, waiting briefly for stragglers
    pub async fn drain(&mut self) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), self.events.recv()).await
        {
            events.push(event);
        }
        events
    }
}
