//! Domain Model - Normalized entities and request DTOs
//!
//! These are the provider-neutral shapes every adapter translates to and
//! from. The core holds no authoritative copy of any of them; they describe
//! what a provider account reported at call time.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

// =============================================================================
// Provider Identity
// =============================================================================

/// Identifier of a cloud provider (normalized to lowercase)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    pub fn aws() -> Self {
        Self::new("aws")
    }

    pub fn gcp() -> Self {
        Self::new("gcp")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Decrypted provider secrets. Values never appear in `Debug` output.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretBundle(BTreeMap<String, String>);

impl SecretBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl From<BTreeMap<String, String>> for SecretBundle {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// A resolved credential. The core only reads `provider` and hands
/// `secrets` to the adapter.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub provider: ProviderId,
    pub workspace_id: Option<String>,
    pub secrets: SecretBundle,
}

// =============================================================================
// Kubernetes Entities
// =============================================================================

/// Lifecycle status of a managed cluster or node group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Provisioning,
    Active,
    Upgrading,
    Deleting,
    Deleted,
    Error,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterStatus::Provisioning => write!(f, "provisioning"),
            ClusterStatus::Active => write!(f, "active"),
            ClusterStatus::Upgrading => write!(f, "upgrading"),
            ClusterStatus::Deleting => write!(f, "deleting"),
            ClusterStatus::Deleted => write!(f, "deleted"),
            ClusterStatus::Error => write!(f, "error"),
        }
    }
}

/// A managed Kubernetes cluster as reported by its provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedCluster {
    pub id: String,
    pub name: String,
    pub provider: ProviderId,
    pub region: String,
    pub version: String,
    pub status: ClusterStatus,
    /// Networks and subnets the cluster is attached to
    pub network_refs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Machine shape for a node group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
}

/// Autoscaling bounds for a node group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingSpec {
    pub min: u32,
    pub max: u32,
    pub enabled: bool,
}

impl AutoscalingSpec {
    pub fn fixed(count: u32) -> Self {
        Self {
            min: count,
            max: count,
            enabled: false,
        }
    }

    /// Check that `desired` sits inside the bounds
    pub fn validate(&self, desired: u32) -> Result<()> {
        if self.min > self.max {
            return Err(Error::invalid(format!(
                "autoscaling min {} exceeds max {}",
                self.min, self.max
            )));
        }
        if desired < self.min || desired > self.max {
            return Err(Error::invalid(format!(
                "desired count {} outside autoscaling bounds [{}, {}]",
                desired, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// A node group / node pool. Never outlives its cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub id: String,
    pub cluster_id: String,
    pub name: String,
    pub desired_count: u32,
    pub instance_spec: InstanceSpec,
    pub autoscaling: AutoscalingSpec,
    pub status: ClusterStatus,
}

// =============================================================================
// Network Entities
// =============================================================================

/// Lifecycle status of a virtual network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Pending,
    Available,
    Deleting,
    Error,
}

/// A virtual network (VPC). `cidr_block` is absent for providers that
/// auto-allocate address space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualNetwork {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr_block: Option<String>,
    pub region: String,
    pub provider: ProviderId,
    pub status: NetworkStatus,
}

/// A subnet inside a virtual network of the same provider account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub vpc_id: String,
    pub name: String,
    pub cidr_block: String,
    pub zone: String,
    pub region: String,
    pub is_public: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl std::fmt::Display for RuleProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleProtocol::Tcp => write!(f, "tcp"),
            RuleProtocol::Udp => write!(f, "udp"),
            RuleProtocol::Icmp => write!(f, "icmp"),
            RuleProtocol::All => write!(f, "all"),
        }
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub direction: RuleDirection,
    pub protocol: RuleProtocol,
    /// `None` means all ports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,
    /// A CIDR block or a provider network tag
    pub cidr_or_tag: String,
}

/// A security group / firewall rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityRuleSet {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    pub region: String,
    pub rules: Vec<SecurityRule>,
}

// =============================================================================
// Requests
// =============================================================================

/// Reference to a single remote resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub credential_id: String,
    pub region: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(
        credential_id: impl Into<String>,
        region: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            credential_id: credential_id.into(),
            region: region.into(),
            id: id.into(),
        }
    }

    pub fn validate(&self, kind: &str) -> Result<()> {
        require("credential_id", &self.credential_id)?;
        require("region", &self.region)?;
        require(&format!("{} id", kind), &self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub credential_id: String,
    pub name: String,
    pub region: String,
    pub version: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl CreateClusterRequest {
    pub fn validate(&self) -> Result<()> {
        require("credential_id", &self.credential_id)?;
        require("name", &self.name)?;
        require("region", &self.region)?;
        require("version", &self.version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNodeGroupRequest {
    pub credential_id: String,
    pub region: String,
    pub cluster_id: String,
    pub name: String,
    pub desired_count: u32,
    pub instance_spec: InstanceSpec,
    pub autoscaling: AutoscalingSpec,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
}

impl CreateNodeGroupRequest {
    pub fn validate(&self) -> Result<()> {
        require("credential_id", &self.credential_id)?;
        require("region", &self.region)?;
        require("cluster_id", &self.cluster_id)?;
        require("name", &self.name)?;
        require("instance_type", &self.instance_spec.instance_type)?;
        self.autoscaling.validate(self.desired_count)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleNodeGroupRequest {
    pub credential_id: String,
    pub region: String,
    pub cluster_id: String,
    pub node_group_id: String,
    pub desired_count: u32,
    /// Replace the autoscaling bounds; `None` keeps the current ones
    #[serde(default)]
    pub autoscaling: Option<AutoscalingSpec>,
}

impl ScaleNodeGroupRequest {
    pub fn validate(&self) -> Result<()> {
        require("credential_id", &self.credential_id)?;
        require("region", &self.region)?;
        require("cluster_id", &self.cluster_id)?;
        require("node_group_id", &self.node_group_id)?;
        if let Some(autoscaling) = &self.autoscaling {
            autoscaling.validate(self.desired_count)?;
        }
        Ok(())
    }
}

/// Reference to a node group inside a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupRef {
    pub credential_id: String,
    pub region: String,
    pub cluster_id: String,
    pub node_group_id: String,
}

impl NodeGroupRef {
    pub fn validate(&self) -> Result<()> {
        require("credential_id", &self.credential_id)?;
        require("region", &self.region)?;
        require("cluster_id", &self.cluster_id)?;
        require("node_group_id", &self.node_group_id)
    }

    pub fn cluster(&self) -> ResourceRef {
        ResourceRef::new(&self.credential_id, &self.region, &self.cluster_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNetworkRequest {
    pub credential_id: String,
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub cidr_block: Option<String>,
}

impl CreateNetworkRequest {
    pub fn validate(&self) -> Result<()> {
        require("credential_id", &self.credential_id)?;
        require("name", &self.name)?;
        require("region", &self.region)?;
        if let Some(cidr) = &self.cidr_block {
            Ipv4Cidr::parse(cidr)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubnetRequest {
    pub credential_id: String,
    pub vpc_id: String,
    pub name: String,
    pub cidr_block: String,
    pub zone: String,
    pub region: String,
    #[serde(default)]
    pub is_public: bool,
}

impl CreateSubnetRequest {
    pub fn validate(&self) -> Result<()> {
        require("credential_id", &self.credential_id)?;
        require("vpc_id", &self.vpc_id)?;
        require("name", &self.name)?;
        require("region", &self.region)?;
        Ipv4Cidr::parse(&self.cidr_block).map(|_| ())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSecurityRuleSetRequest {
    pub credential_id: String,
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: Vec<SecurityRule>,
}

impl CreateSecurityRuleSetRequest {
    pub fn validate(&self) -> Result<()> {
        require("credential_id", &self.credential_id)?;
        require("name", &self.name)?;
        require("region", &self.region)?;
        for rule in &self.rules {
            require("rule cidr_or_tag", &rule.cidr_or_tag)?;
            if let Some(range) = rule.port_range {
                if range.from > range.to {
                    return Err(Error::invalid(format!("invalid port range {}", range)));
                }
                if rule.protocol == RuleProtocol::Icmp {
                    return Err(Error::invalid("icmp rules cannot carry a port range"));
                }
            }
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::invalid(format!("{} is required", field)))
    } else {
        Ok(())
    }
}

// =============================================================================
// CIDR Helper
// =============================================================================

/// Parsed IPv4 CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::invalid(format!("invalid CIDR block: {}", s)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::invalid(format!("invalid CIDR address: {}", s)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::invalid(format!("invalid CIDR prefix: {}", s)))?;
        if prefix > 32 {
            return Err(Error::invalid(format!("invalid CIDR prefix: {}", s)));
        }
        let network = Ipv4Addr::from(u32::from(addr) & Self::mask(prefix));
        if network != addr {
            return Err(Error::invalid(format!("CIDR {} has host bits set", s)));
        }
        Ok(Self { network, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix as u32)
        }
    }

    /// Whether `other` lies entirely inside this block
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix
            && (u32::from(other.network) & Self::mask(self.prefix)) == u32::from(self.network)
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}
