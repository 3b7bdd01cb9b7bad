//! GCP control plane client
//!
//! Native GKE and Compute shapes plus the client trait the adapter drives.
//! Errors carry an HTTP status and a Google API reason string. Networks and
//! firewalls are global; subnetworks are regional; clusters live in a
//! location.

use crate::domain::model::Ipv4Cidr;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// Native Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcpApiError {
    pub status: u16,
    pub reason: String,
    pub message: String,
}

impl GcpApiError {
    pub fn new(status: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    fn not_found(resource: &str) -> Self {
        Self::new(404, "notFound", format!("The resource '{}' was not found", resource))
    }

    fn already_exists(resource: &str) -> Self {
        Self::new(409, "alreadyExists", format!("The resource '{}' already exists", resource))
    }

    fn in_use(resource: &str, by: &str) -> Self {
        Self::new(
            400,
            "resourceInUseByAnotherResource",
            format!("The resource '{}' is already being used by '{}'", resource, by),
        )
    }
}

impl std::fmt::Display for GcpApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "googleapi: Error {}: {}, {}", self.status, self.message, self.reason)
    }
}

impl std::error::Error for GcpApiError {}

pub type GcpResult<T> = std::result::Result<T, GcpApiError>;

// =============================================================================
// Native Shapes
// =============================================================================

#[derive(Debug, Clone)]
pub struct GkeCluster {
    pub name: String,
    pub location: String,
    pub status: String,
    pub current_master_version: String,
    pub network: String,
    pub subnetwork: Option<String>,
    pub endpoint: Option<String>,
    pub resource_labels: BTreeMap<String, String>,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePoolAutoscaling {
    pub enabled: bool,
    pub min_node_count: u32,
    pub max_node_count: u32,
}

#[derive(Debug, Clone)]
pub struct GkeNodePool {
    pub name: String,
    pub cluster: String,
    pub status: String,
    pub machine_type: String,
    pub disk_size_gb: Option<u32>,
    pub node_count: u32,
    pub autoscaling: NodePoolAutoscaling,
}

#[derive(Debug, Clone)]
pub struct ComputeNetwork {
    pub name: String,
    pub auto_create_subnetworks: bool,
    /// Address plan for custom-mode networks; subnetworks must fit inside
    pub ipv4_range: Option<String>,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ComputeSubnetwork {
    pub name: String,
    pub network: String,
    pub region: String,
    pub ip_cidr_range: String,
    pub private_ip_google_access: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallAllowed {
    /// `tcp`, `udp`, `icmp` or `all`
    pub ip_protocol: String,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ComputeFirewall {
    pub name: String,
    pub network: String,
    pub description: String,
    /// `INGRESS` or `EGRESS`
    pub direction: String,
    pub allowed: Vec<FirewallAllowed>,
    pub source_ranges: Vec<String>,
    pub destination_ranges: Vec<String>,
    pub target_tags: Vec<String>,
}

// =============================================================================
// Client Trait
// =============================================================================

/// The subset of the GKE and Compute APIs the adapter uses
#[async_trait]
pub trait GcpControlPlane: Send + Sync {
    async fn create_cluster(&self, project: &str, cluster: GkeCluster) -> GcpResult<GkeCluster>;
    async fn get_cluster(&self, project: &str, location: &str, name: &str)
        -> GcpResult<GkeCluster>;
    async fn list_clusters(&self, project: &str, location: &str) -> GcpResult<Vec<GkeCluster>>;
    async fn delete_cluster(&self, project: &str, location: &str, name: &str) -> GcpResult<()>;

    async fn create_node_pool(
        &self,
        project: &str,
        location: &str,
        pool: GkeNodePool,
    ) -> GcpResult<GkeNodePool>;
    async fn list_node_pools(&self, project: &str, location: &str, cluster: &str)
        -> GcpResult<Vec<GkeNodePool>>;
    async fn set_node_pool_size(
        &self,
        project: &str,
        location: &str,
        cluster: &str,
        pool: &str,
        node_count: u32,
        autoscaling: Option<NodePoolAutoscaling>,
    ) -> GcpResult<GkeNodePool>;
    async fn delete_node_pool(&self, project: &str, location: &str, cluster: &str, pool: &str)
        -> GcpResult<()>;

    async fn insert_network(&self, project: &str, network: ComputeNetwork)
        -> GcpResult<ComputeNetwork>;
    async fn list_networks(&self, project: &str) -> GcpResult<Vec<ComputeNetwork>>;
    async fn delete_network(&self, project: &str, name: &str) -> GcpResult<()>;

    async fn insert_subnetwork(&self, project: &str, subnetwork: ComputeSubnetwork)
        -> GcpResult<ComputeSubnetwork>;
    async fn delete_subnetwork(&self, project: &str, region: &str, name: &str) -> GcpResult<()>;

    async fn insert_firewall(&self, project: &str, firewall: ComputeFirewall)
        -> GcpResult<ComputeFirewall>;
    async fn delete_firewall(&self, project: &str, name: &str) -> GcpResult<()>;

    async fn ping(&self) -> GcpResult<()>;
}

// =============================================================================
// In-Memory Control Plane
// =============================================================================

#[derive(Debug, Default)]
struct ProjectState {
    clusters: BTreeMap<(String, String), GkeCluster>,
    node_pools: BTreeMap<(String, String, String), GkeNodePool>,
    networks: BTreeMap<String, ComputeNetwork>,
    subnetworks: BTreeMap<(String, String), ComputeSubnetwork>,
    firewalls: BTreeMap<String, ComputeFirewall>,
}

/// Simulated GKE/Compute control plane with fault injection
#[derive(Debug, Default)]
pub struct InMemoryGcp {
    projects: DashMap<String, ProjectState>,
    faults: Mutex<HashMap<String, VecDeque<GcpApiError>>>,
    latency: Mutex<Option<Duration>>,
    calls: AtomicU64,
}

impl InMemoryGcp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call to `method` (e.g. `networks.insert`) with `error`
    pub fn inject_fault(&self, method: &str, error: GcpApiError) {
        self.faults
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn enter(&self, method: &str) -> GcpResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.faults.lock().get_mut(method).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn project(&self, project: &str) -> dashmap::mapref::one::RefMut<'_, String, ProjectState> {
        self.projects.entry(project.to_string()).or_default()
    }
}

/// Region of a GKE location: `us-central1-a` and `us-central1` both give
/// `us-central1`
pub fn location_region(location: &str) -> &str {
    match location.rsplit_once('-') {
        Some((region, zone)) if zone.len() == 1 => region,
        _ => location,
    }
}

fn cluster_key(location: &str, name: &str) -> (String, String) {
    (location.to_string(), name.to_string())
}

#[async_trait]
impl GcpControlPlane for InMemoryGcp {
    async fn create_cluster(&self, project: &str, cluster: GkeCluster) -> GcpResult<GkeCluster> {
        self.enter("clusters.create").await?;
        let mut state = self.project(project);
        let key = cluster_key(&cluster.location, &cluster.name);
        if state.clusters.contains_key(&key) {
            return Err(GcpApiError::already_exists(&cluster.name));
        }
        if !state.networks.contains_key(&cluster.network) {
            return Err(GcpApiError::new(
                400,
                "badRequest",
                format!("Network \"{}\" does not exist.", cluster.network),
            ));
        }
        if let Some(subnetwork) = &cluster.subnetwork {
            let region = location_region(&cluster.location);
            if !state
                .subnetworks
                .contains_key(&(region.to_string(), subnetwork.clone()))
            {
                return Err(GcpApiError::new(
                    400,
                    "badRequest",
                    format!("Subnetwork \"{}\" does not exist.", subnetwork),
                ));
            }
        }

        let cluster = GkeCluster {
            status: "PROVISIONING".to_string(),
            endpoint: None,
            create_time: Utc::now(),
            ..cluster
        };
        state.clusters.insert(key, cluster.clone());
        Ok(cluster)
    }

    async fn get_cluster(
        &self,
        project: &str,
        location: &str,
        name: &str,
    ) -> GcpResult<GkeCluster> {
        self.enter("clusters.get").await?;
        let mut state = self.project(project);
        let cluster = state
            .clusters
            .get_mut(&cluster_key(location, name))
            .ok_or_else(|| GcpApiError::not_found(name))?;
        if cluster.status == "PROVISIONING" {
            cluster.status = "RUNNING".to_string();
            let octet = (cluster.name.len() % 200) + 10;
            cluster.endpoint = Some(format!("34.{}.0.1", octet));
        }
        Ok(cluster.clone())
    }

    async fn list_clusters(&self, project: &str, location: &str) -> GcpResult<Vec<GkeCluster>> {
        self.enter("clusters.list").await?;
        Ok(self
            .project(project)
            .clusters
            .iter()
            .filter(|((loc, _), _)| loc == location || location == "-")
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn delete_cluster(&self, project: &str, location: &str, name: &str) -> GcpResult<()> {
        self.enter("clusters.delete").await?;
        let mut state = self.project(project);
        state
            .clusters
            .remove(&cluster_key(location, name))
            .ok_or_else(|| GcpApiError::not_found(name))?;
        state
            .node_pools
            .retain(|(loc, cluster, _), _| !(loc == location && cluster == name));
        Ok(())
    }

    async fn create_node_pool(
        &self,
        project: &str,
        location: &str,
        pool: GkeNodePool,
    ) -> GcpResult<GkeNodePool> {
        self.enter("nodePools.create").await?;
        let mut state = self.project(project);
        if !state.clusters.contains_key(&cluster_key(location, &pool.cluster)) {
            return Err(GcpApiError::not_found(&pool.cluster));
        }
        let key = (location.to_string(), pool.cluster.clone(), pool.name.clone());
        if state.node_pools.contains_key(&key) {
            return Err(GcpApiError::already_exists(&pool.name));
        }
        let pool = GkeNodePool {
            status: "PROVISIONING".to_string(),
            ..pool
        };
        state.node_pools.insert(key, pool.clone());
        Ok(pool)
    }

    async fn list_node_pools(
        &self,
        project: &str,
        location: &str,
        cluster: &str,
    ) -> GcpResult<Vec<GkeNodePool>> {
        self.enter("nodePools.list").await?;
        let mut state = self.project(project);
        if !state.clusters.contains_key(&cluster_key(location, cluster)) {
            return Err(GcpApiError::not_found(cluster));
        }
        Ok(state
            .node_pools
            .iter_mut()
            .filter(|((loc, c, _), _)| loc == location && c == cluster)
            .map(|(_, pool)| {
                if pool.status == "PROVISIONING" || pool.status == "RECONCILING" {
                    pool.status = "RUNNING".to_string();
                }
                pool.clone()
            })
            .collect())
    }

    async fn set_node_pool_size(
        &self,
        project: &str,
        location: &str,
        cluster: &str,
        pool: &str,
        node_count: u32,
        autoscaling: Option<NodePoolAutoscaling>,
    ) -> GcpResult<GkeNodePool> {
        self.enter("nodePools.setSize").await?;
        let mut state = self.project(project);
        let entry = state
            .node_pools
            .get_mut(&(location.to_string(), cluster.to_string(), pool.to_string()))
            .ok_or_else(|| GcpApiError::not_found(pool))?;
        if let Some(autoscaling) = autoscaling {
            entry.autoscaling = autoscaling;
        }
        entry.node_count = node_count;
        entry.status = "RECONCILING".to_string();
        Ok(entry.clone())
    }

    async fn delete_node_pool(
        &self,
        project: &str,
        location: &str,
        cluster: &str,
        pool: &str,
    ) -> GcpResult<()> {
        self.enter("nodePools.delete").await?;
        self.project(project)
            .node_pools
            .remove(&(location.to_string(), cluster.to_string(), pool.to_string()))
            .map(|_| ())
            .ok_or_else(|| GcpApiError::not_found(pool))
    }

    async fn insert_network(
        &self,
        project: &str,
        network: ComputeNetwork,
    ) -> GcpResult<ComputeNetwork> {
        self.enter("networks.insert").await?;
        let mut state = self.project(project);
        if state.networks.contains_key(&network.name) {
            return Err(GcpApiError::already_exists(&network.name));
        }
        let network = ComputeNetwork {
            creation_timestamp: Utc::now(),
            ..network
        };
        state.networks.insert(network.name.clone(), network.clone());
        Ok(network)
    }

    async fn list_networks(&self, project: &str) -> GcpResult<Vec<ComputeNetwork>> {
        self.enter("networks.list").await?;
        Ok(self.project(project).networks.values().cloned().collect())
    }

    async fn delete_network(&self, project: &str, name: &str) -> GcpResult<()> {
        self.enter("networks.delete").await?;
        let mut state = self.project(project);
        if !state.networks.contains_key(name) {
            return Err(GcpApiError::not_found(name));
        }
        if let Some(subnet) = state.subnetworks.values().find(|s| s.network == name) {
            return Err(GcpApiError::in_use(name, &subnet.name));
        }
        if let Some(firewall) = state.firewalls.values().find(|f| f.network == name) {
            return Err(GcpApiError::in_use(name, &firewall.name));
        }
        if let Some(cluster) = state.clusters.values().find(|c| c.network == name) {
            return Err(GcpApiError::in_use(name, &cluster.name));
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn insert_subnetwork(
        &self,
        project: &str,
        subnetwork: ComputeSubnetwork,
    ) -> GcpResult<ComputeSubnetwork> {
        self.enter("subnetworks.insert").await?;
        let mut state = self.project(project);
        let network = state
            .networks
            .get(&subnetwork.network)
            .ok_or_else(|| GcpApiError::not_found(&subnetwork.network))?;
        if network.auto_create_subnetworks {
            return Err(GcpApiError::new(
                400,
                "invalid",
                format!(
                    "Network '{}' is in auto subnet mode; subnetworks are managed by the provider",
                    network.name
                ),
            ));
        }

        let range = Ipv4Cidr::parse(&subnetwork.ip_cidr_range).map_err(|_| {
            GcpApiError::new(
                400,
                "invalid",
                format!("Invalid IPCidrRange: {}", subnetwork.ip_cidr_range),
            )
        })?;
        if let Some(plan) = network.ipv4_range.as_deref().and_then(|r| Ipv4Cidr::parse(r).ok()) {
            if !plan.contains(&range) {
                return Err(GcpApiError::new(
                    400,
                    "invalid",
                    format!(
                        "IPCidrRange {} is outside network range {}",
                        subnetwork.ip_cidr_range, plan
                    ),
                ));
            }
        }

        let key = (subnetwork.region.clone(), subnetwork.name.clone());
        if state.subnetworks.contains_key(&key) {
            return Err(GcpApiError::already_exists(&subnetwork.name));
        }
        if let Some(existing) = state.subnetworks.values().find(|s| {
            s.network == subnetwork.network
                && Ipv4Cidr::parse(&s.ip_cidr_range).is_ok_and(|r| r.overlaps(&range))
        }) {
            return Err(GcpApiError::new(
                400,
                "invalid",
                format!(
                    "Invalid IPCidrRange: {} conflicts with existing subnetwork '{}'",
                    subnetwork.ip_cidr_range, existing.name
                ),
            ));
        }

        state.subnetworks.insert(key, subnetwork.clone());
        Ok(subnetwork)
    }

    async fn delete_subnetwork(&self, project: &str, region: &str, name: &str) -> GcpResult<()> {
        self.enter("subnetworks.delete").await?;
        let mut state = self.project(project);
        if let Some(cluster) = state
            .clusters
            .values()
            .find(|c| c.subnetwork.as_deref() == Some(name))
        {
            return Err(GcpApiError::in_use(name, &cluster.name));
        }
        state
            .subnetworks
            .remove(&(region.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| GcpApiError::not_found(name))
    }

    async fn insert_firewall(
        &self,
        project: &str,
        firewall: ComputeFirewall,
    ) -> GcpResult<ComputeFirewall> {
        self.enter("firewalls.insert").await?;
        let mut state = self.project(project);
        if !state.networks.contains_key(&firewall.network) {
            return Err(GcpApiError::not_found(&firewall.network));
        }
        if state.firewalls.contains_key(&firewall.name) {
            return Err(GcpApiError::already_exists(&firewall.name));
        }
        state.firewalls.insert(firewall.name.clone(), firewall.clone());
        Ok(firewall)
    }

    async fn delete_firewall(&self, project: &str, name: &str) -> GcpResult<()> {
        self.enter("firewalls.delete").await?;
        self.project(project)
            .firewalls
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| GcpApiError::not_found(name))
    }

    async fn ping(&self) -> GcpResult<()> {
        self.enter("ping").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(name: &str, auto: bool) -> ComputeNetwork {
        ComputeNetwork {
            name: name.to_string(),
            auto_create_subnetworks: auto,
            ipv4_range: None,
            creation_timestamp: Utc::now(),
        }
    }

    fn subnetwork(name: &str, network: &str, range: &str) -> ComputeSubnetwork {
        ComputeSubnetwork {
            name: name.to_string(),
            network: network.to_string(),
            region: "us-central1".to_string(),
            ip_cidr_range: range.to_string(),
            private_ip_google_access: true,
        }
    }

    #[test]
    fn test_location_region() {
        assert_eq!(location_region("us-central1-a"), "us-central1");
        assert_eq!(location_region("us-central1"), "us-central1");
        assert_eq!(location_region("europe-west4"), "europe-west4");
    }

    #[tokio::test]
    async fn test_auto_mode_rejects_subnetworks() {
        let gcp = InMemoryGcp::new();
        gcp.insert_network("proj", network("auto", true)).await.unwrap();

        let err = gcp
            .insert_subnetwork("proj", subnetwork("a", "auto", "10.0.0.0/24"))
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[tokio::test]
    async fn test_overlapping_subnetworks_rejected() {
        let gcp = InMemoryGcp::new();
        gcp.insert_network("proj", network("vpc", false)).await.unwrap();
        gcp.insert_subnetwork("proj", subnetwork("a", "vpc", "10.0.0.0/20"))
            .await
            .unwrap();

        let err = gcp
            .insert_subnetwork("proj", subnetwork("b", "vpc", "10.0.1.0/24"))
            .await
            .unwrap_err();
        assert_eq!(err.reason, "invalid");
    }

    #[tokio::test]
    async fn test_network_in_use() {
        let gcp = InMemoryGcp::new();
        gcp.insert_network("proj", network("vpc", false)).await.unwrap();
        gcp.insert_subnetwork("proj", subnetwork("a", "vpc", "10.0.0.0/24"))
            .await
            .unwrap();

        let err = gcp.delete_network("proj", "vpc").await.unwrap_err();
        assert_eq!(err.reason, "resourceInUseByAnotherResource");
    }

    #[tokio::test]
    async fn test_projects_are_isolated() {
        let gcp = InMemoryGcp::new();
        gcp.insert_network("a", network("vpc", true)).await.unwrap();
        assert!(gcp.list_networks("b").await.unwrap().is_empty());
        assert_eq!(gcp.call_count(), 2);
    }
}
