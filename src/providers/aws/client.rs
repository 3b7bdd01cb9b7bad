//! AWS control plane client
//!
//! Native EKS/EC2 shapes and the client trait the adapter drives. The
//! in-memory implementation keeps per-account, per-region state in a
//! `DashMap` and behaves like the real control plane where it matters to
//! the adapter: string error codes, `CREATING` clusters that turn `ACTIVE`
//! on the next describe, dependency violations on delete.

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

/// Error as returned by the AWS APIs: a string code plus a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsApiError {
    pub code: String,
    pub message: String,
}

impl AwsApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AwsApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AwsApiError {}

pub type AwsResult<T> = std::result::Result<T, AwsApiError>;

// =============================================================================
// Native Shapes
// =============================================================================

/// Authenticated scope of one call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AwsSession {
    pub access_key: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct EksCluster {
    pub name: String,
    pub arn: String,
    pub version: String,
    pub status: String,
    pub role_arn: String,
    pub vpc_id: Option<String>,
    pub subnet_ids: Vec<String>,
    pub endpoint: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateEksClusterInput {
    pub name: String,
    pub version: String,
    pub role_arn: String,
    pub subnet_ids: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EksScalingConfig {
    pub min_size: u32,
    pub max_size: u32,
    pub desired_size: u32,
}

#[derive(Debug, Clone)]
pub struct EksNodegroup {
    pub name: String,
    pub cluster_name: String,
    pub status: String,
    pub instance_types: Vec<String>,
    pub disk_size: Option<u32>,
    pub scaling: EksScalingConfig,
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Ec2Vpc {
    pub vpc_id: String,
    pub name: String,
    pub cidr_block: String,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct Ec2Subnet {
    pub subnet_id: String,
    pub vpc_id: String,
    pub name: String,
    pub cidr_block: String,
    pub availability_zone: String,
    pub map_public_ip_on_launch: bool,
}

/// One EC2 permission entry; protocol `-1` means all
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPermission {
    pub egress: bool,
    pub ip_protocol: String,
    pub from_port: Option<u16>,
    pub to_port: Option<u16>,
    pub cidr_ip: String,
}

#[derive(Debug, Clone)]
pub struct Ec2SecurityGroup {
    pub group_id: String,
    pub group_name: String,
    pub description: String,
    /// `None` places the group in the account's default VPC
    pub vpc_id: Option<String>,
    pub permissions: Vec<IpPermission>,
}

// =============================================================================
// Client Trait
// =============================================================================

/// The subset of the EKS and EC2 APIs the adapter uses
#[async_trait]
pub trait AwsControlPlane: Send + Sync {
    async fn get_caller_identity(&self, session: &AwsSession) -> AwsResult<String>;

    async fn create_cluster(
        &self,
        session: &AwsSession,
        input: CreateEksClusterInput,
    ) -> AwsResult<EksCluster>;
    async fn describe_cluster(&self, session: &AwsSession, name: &str) -> AwsResult<EksCluster>;
    async fn list_clusters(&self, session: &AwsSession) -> AwsResult<Vec<EksCluster>>;
    async fn delete_cluster(&self, session: &AwsSession, name: &str) -> AwsResult<()>;

    async fn create_nodegroup(
        &self,
        session: &AwsSession,
        nodegroup: EksNodegroup,
    ) -> AwsResult<EksNodegroup>;
    async fn list_nodegroups(&self, session: &AwsSession, cluster: &str)
        -> AwsResult<Vec<EksNodegroup>>;
    async fn update_nodegroup_config(
        &self,
        session: &AwsSession,
        cluster: &str,
        nodegroup: &str,
        scaling: EksScalingConfig,
    ) -> AwsResult<EksNodegroup>;
    async fn delete_nodegroup(&self, session: &AwsSession, cluster: &str, nodegroup: &str)
        -> AwsResult<()>;

    async fn create_vpc(&self, session: &AwsSession, name: &str, cidr_block: &str)
        -> AwsResult<Ec2Vpc>;
    async fn describe_vpcs(&self, session: &AwsSession) -> AwsResult<Vec<Ec2Vpc>>;
    async fn delete_vpc(&self, session: &AwsSession, vpc_id: &str) -> AwsResult<()>;

    async fn create_subnet(&self, session: &AwsSession, subnet: Ec2Subnet) -> AwsResult<Ec2Subnet>;
    async fn describe_subnets(&self, session: &AwsSession, subnet_ids: &[String])
        -> AwsResult<Vec<Ec2Subnet>>;
    async fn delete_subnet(&self, session: &AwsSession, subnet_id: &str) -> AwsResult<()>;

    async fn create_security_group(
        &self,
        session: &AwsSession,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> AwsResult<Ec2SecurityGroup>;
    async fn authorize_security_group(
        &self,
        session: &AwsSession,
        group_id: &str,
        permissions: Vec<IpPermission>,
    ) -> AwsResult<Ec2SecurityGroup>;
    async fn delete_security_group(&self, session: &AwsSession, group_id: &str) -> AwsResult<()>;

    async fn ping(&self) -> AwsResult<()>;
}

// =============================================================================
// In-Memory Control Plane
// =============================================================================

#[derive(Debug, Default)]
struct RegionState {
    clusters: BTreeMap<String, EksCluster>,
    nodegroups: BTreeMap<(String, String), EksNodegroup>,
    vpcs: BTreeMap<String, Ec2Vpc>,
    subnets: BTreeMap<String, Ec2Subnet>,
    security_groups: BTreeMap<String, Ec2SecurityGroup>,
}

/// Simulated EKS/EC2 control plane with fault injection
#[derive(Debug, Default)]
pub struct InMemoryAws {
    regions: DashMap<AwsSession, RegionState>,
    faults: Mutex<HashMap<String, VecDeque<AwsApiError>>>,
    latency: Mutex<Option<Duration>>,
    calls: AtomicU64,
}

impl InMemoryAws {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call to `operation` with `error`
    pub fn inject_fault(&self, operation: &str, error: AwsApiError) {
        self.faults
            .lock()
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Total API calls received
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn enter(&self, operation: &str) -> AwsResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.faults.lock().get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn region(&self, session: &AwsSession) -> dashmap::mapref::one::RefMut<'_, AwsSession, RegionState> {
        self.regions.entry(session.clone()).or_default()
    }
}

fn short_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..17])
}

fn account_id(access_key: &str) -> String {
    let digits: String = access_key
        .bytes()
        .map(|b| char::from(b'0' + b % 10))
        .chain(std::iter::repeat('0'))
        .take(12)
        .collect();
    digits
}

fn not_found(code: &str, what: &str, id: &str) -> AwsApiError {
    AwsApiError::new(code, format!("The {} '{}' does not exist", what, id))
}

#[async_trait]
impl AwsControlPlane for InMemoryAws {
    async fn get_caller_identity(&self, session: &AwsSession) -> AwsResult<String> {
        self.enter("GetCallerIdentity").await?;
        Ok(account_id(&session.access_key))
    }

    async fn create_cluster(
        &self,
        session: &AwsSession,
        input: CreateEksClusterInput,
    ) -> AwsResult<EksCluster> {
        self.enter("CreateCluster").await?;
        let mut region = self.region(session);

        if region.clusters.contains_key(&input.name) {
            return Err(AwsApiError::new(
                "ResourceInUseException",
                format!("Cluster already exists with name: {}", input.name),
            ));
        }

        let mut vpc_id = None;
        for subnet_id in &input.subnet_ids {
            let subnet = region.subnets.get(subnet_id).ok_or_else(|| {
                AwsApiError::new(
                    "InvalidParameterException",
                    format!("Subnet {} does not exist", subnet_id),
                )
            })?;
            match &vpc_id {
                None => vpc_id = Some(subnet.vpc_id.clone()),
                Some(vpc) if *vpc != subnet.vpc_id => {
                    return Err(AwsApiError::new(
                        "InvalidParameterException",
                        "Subnets must all belong to the same VPC",
                    ));
                }
                Some(_) => {}
            }
        }

        let account = account_id(&session.access_key);
        let cluster = EksCluster {
            arn: format!(
                "arn:aws:eks:{}:{}:cluster/{}",
                session.region, account, input.name
            ),
            name: input.name.clone(),
            version: input.version,
            status: "CREATING".to_string(),
            role_arn: input.role_arn,
            vpc_id,
            subnet_ids: input.subnet_ids,
            endpoint: None,
            tags: input.tags,
            created_at: Utc::now(),
        };
        region.clusters.insert(input.name, cluster.clone());
        Ok(cluster)
    }

    async fn describe_cluster(&self, session: &AwsSession, name: &str) -> AwsResult<EksCluster> {
        self.enter("DescribeCluster").await?;
        let mut region = self.region(session);
        let cluster = region
            .clusters
            .get_mut(name)
            .ok_or_else(|| not_found("ResourceNotFoundException", "cluster", name))?;

        if cluster.status == "CREATING" {
            cluster.status = "ACTIVE".to_string();
            cluster.endpoint = Some(format!(
                "https://{}.gr7.{}.eks.amazonaws.com",
                cluster.name.to_ascii_uppercase(),
                session.region
            ));
        }
        Ok(cluster.clone())
    }

    async fn list_clusters(&self, session: &AwsSession) -> AwsResult<Vec<EksCluster>> {
        self.enter("ListClusters").await?;
        Ok(self.region(session).clusters.values().cloned().collect())
    }

    async fn delete_cluster(&self, session: &AwsSession, name: &str) -> AwsResult<()> {
        self.enter("DeleteCluster").await?;
        let mut region = self.region(session);
        if !region.clusters.contains_key(name) {
            return Err(not_found("ResourceNotFoundException", "cluster", name));
        }
        if region.nodegroups.keys().any(|(cluster, _)| cluster == name) {
            return Err(AwsApiError::new(
                "ResourceInUseException",
                format!("Cluster has nodegroups attached: {}", name),
            ));
        }
        region.clusters.remove(name);
        Ok(())
    }

    async fn create_nodegroup(
        &self,
        session: &AwsSession,
        nodegroup: EksNodegroup,
    ) -> AwsResult<EksNodegroup> {
        self.enter("CreateNodegroup").await?;
        let mut region = self.region(session);
        if !region.clusters.contains_key(&nodegroup.cluster_name) {
            return Err(not_found(
                "ResourceNotFoundException",
                "cluster",
                &nodegroup.cluster_name,
            ));
        }
        let key = (nodegroup.cluster_name.clone(), nodegroup.name.clone());
        if region.nodegroups.contains_key(&key) {
            return Err(AwsApiError::new(
                "ResourceInUseException",
                format!("NodeGroup already exists with name {}", nodegroup.name),
            ));
        }

        let nodegroup = EksNodegroup {
            status: "CREATING".to_string(),
            ..nodegroup
        };
        region.nodegroups.insert(key, nodegroup.clone());
        Ok(nodegroup)
    }

    async fn list_nodegroups(
        &self,
        session: &AwsSession,
        cluster: &str,
    ) -> AwsResult<Vec<EksNodegroup>> {
        self.enter("ListNodegroups").await?;
        let mut region = self.region(session);
        if !region.clusters.contains_key(cluster) {
            return Err(not_found("ResourceNotFoundException", "cluster", cluster));
        }
        let groups = region
            .nodegroups
            .iter_mut()
            .filter(|((c, _), _)| c == cluster)
            .map(|(_, group)| {
                if group.status == "CREATING" || group.status == "UPDATING" {
                    group.status = "ACTIVE".to_string();
                }
                group.clone()
            })
            .collect();
        Ok(groups)
    }

    async fn update_nodegroup_config(
        &self,
        session: &AwsSession,
        cluster: &str,
        nodegroup: &str,
        scaling: EksScalingConfig,
    ) -> AwsResult<EksNodegroup> {
        self.enter("UpdateNodegroupConfig").await?;
        let mut region = self.region(session);
        let group = region
            .nodegroups
            .get_mut(&(cluster.to_string(), nodegroup.to_string()))
            .ok_or_else(|| not_found("ResourceNotFoundException", "nodegroup", nodegroup))?;
        group.scaling = scaling;
        group.status = "UPDATING".to_string();
        Ok(group.clone())
    }

    async fn delete_nodegroup(
        &self,
        session: &AwsSession,
        cluster: &str,
        nodegroup: &str,
    ) -> AwsResult<()> {
        self.enter("DeleteNodegroup").await?;
        self.region(session)
            .nodegroups
            .remove(&(cluster.to_string(), nodegroup.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("ResourceNotFoundException", "nodegroup", nodegroup))
    }

    async fn create_vpc(
        &self,
        session: &AwsSession,
        name: &str,
        cidr_block: &str,
    ) -> AwsResult<Ec2Vpc> {
        self.enter("CreateVpc").await?;
        let vpc = Ec2Vpc {
            vpc_id: short_id("vpc"),
            name: name.to_string(),
            cidr_block: cidr_block.to_string(),
            state: "available".to_string(),
        };
        self.region(session).vpcs.insert(vpc.vpc_id.clone(), vpc.clone());
        Ok(vpc)
    }

    async fn describe_vpcs(&self, session: &AwsSession) -> AwsResult<Vec<Ec2Vpc>> {
        self.enter("DescribeVpcs").await?;
        Ok(self.region(session).vpcs.values().cloned().collect())
    }

    async fn delete_vpc(&self, session: &AwsSession, vpc_id: &str) -> AwsResult<()> {
        self.enter("DeleteVpc").await?;
        let mut region = self.region(session);
        if !region.vpcs.contains_key(vpc_id) {
            return Err(not_found("InvalidVpcID.NotFound", "vpc ID", vpc_id));
        }
        let in_use = region.subnets.values().any(|s| s.vpc_id == vpc_id)
            || region
                .security_groups
                .values()
                .any(|g| g.vpc_id.as_deref() == Some(vpc_id));
        if in_use {
            return Err(AwsApiError::new(
                "DependencyViolation",
                format!("The vpc '{}' has dependencies and cannot be deleted.", vpc_id),
            ));
        }
        region.vpcs.remove(vpc_id);
        Ok(())
    }

    async fn create_subnet(&self, session: &AwsSession, subnet: Ec2Subnet) -> AwsResult<Ec2Subnet> {
        self.enter("CreateSubnet").await?;
        let mut region = self.region(session);
        if !region.vpcs.contains_key(&subnet.vpc_id) {
            return Err(not_found("InvalidVpcID.NotFound", "vpc ID", &subnet.vpc_id));
        }
        let requested = Ipv4Cidr::parse(&subnet.cidr_block).map_err(|_| {
            AwsApiError::new(
                "InvalidParameterValue",
                format!("Value ({}) for parameter cidrBlock is invalid", subnet.cidr_block),
            )
        })?;
        let within_vpc = region
            .vpcs
            .get(&subnet.vpc_id)
            .and_then(|vpc| Ipv4Cidr::parse(&vpc.cidr_block).ok())
            .is_some_and(|block| block.contains(&requested));
        if !within_vpc {
            return Err(AwsApiError::new(
                "InvalidSubnet.Range",
                format!("The CIDR '{}' is invalid.", subnet.cidr_block),
            ));
        }
        if let Some(existing) = region.subnets.values().find(|s| {
            s.vpc_id == subnet.vpc_id
                && Ipv4Cidr::parse(&s.cidr_block).is_ok_and(|block| block.overlaps(&requested))
        }) {
            return Err(AwsApiError::new(
                "InvalidSubnet.Conflict",
                format!(
                    "The CIDR '{}' conflicts with another subnet ({})",
                    subnet.cidr_block, existing.subnet_id
                ),
            ));
        }

        let subnet = Ec2Subnet {
            subnet_id: short_id("subnet"),
            ..subnet
        };
        region.subnets.insert(subnet.subnet_id.clone(), subnet.clone());
        Ok(subnet)
    }

    async fn describe_subnets(
        &self,
        session: &AwsSession,
        subnet_ids: &[String],
    ) -> AwsResult<Vec<Ec2Subnet>> {
        self.enter("DescribeSubnets").await?;
        let region = self.region(session);
        subnet_ids
            .iter()
            .map(|id| {
                region
                    .subnets
                    .get(id)
                    .cloned()
                    .ok_or_else(|| not_found("InvalidSubnetID.NotFound", "subnet ID", id))
            })
            .collect()
    }

    async fn delete_subnet(&self, session: &AwsSession, subnet_id: &str) -> AwsResult<()> {
        self.enter("DeleteSubnet").await?;
        let mut region = self.region(session);
        if region
            .clusters
            .values()
            .any(|c| c.subnet_ids.iter().any(|s| s == subnet_id))
        {
            return Err(AwsApiError::new(
                "DependencyViolation",
                format!("The subnet '{}' has dependencies and cannot be deleted.", subnet_id),
            ));
        }
        region
            .subnets
            .remove(subnet_id)
            .map(|_| ())
            .ok_or_else(|| not_found("InvalidSubnetID.NotFound", "subnet ID", subnet_id))
    }

    async fn create_security_group(
        &self,
        session: &AwsSession,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> AwsResult<Ec2SecurityGroup> {
        self.enter("CreateSecurityGroup").await?;
        let mut region = self.region(session);
        if let Some(vpc_id) = vpc_id {
            if !region.vpcs.contains_key(vpc_id) {
                return Err(not_found("InvalidVpcID.NotFound", "vpc ID", vpc_id));
            }
        }
        if region
            .security_groups
            .values()
            .any(|g| g.vpc_id.as_deref() == vpc_id && g.group_name == name)
        {
            return Err(AwsApiError::new(
                "InvalidGroup.Duplicate",
                format!("The security group '{}' already exists", name),
            ));
        }

        let group = Ec2SecurityGroup {
            group_id: short_id("sg"),
            group_name: name.to_string(),
            description: description.to_string(),
            vpc_id: vpc_id.map(str::to_string),
            permissions: Vec::new(),
        };
        region
            .security_groups
            .insert(group.group_id.clone(), group.clone());
        Ok(group)
    }

    async fn authorize_security_group(
        &self,
        session: &AwsSession,
        group_id: &str,
        permissions: Vec<IpPermission>,
    ) -> AwsResult<Ec2SecurityGroup> {
        self.enter("AuthorizeSecurityGroup").await?;
        let mut region = self.region(session);
        let group = region
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("InvalidGroup.NotFound", "security group", group_id))?;
        for permission in permissions {
            if group.permissions.contains(&permission) {
                return Err(AwsApiError::new(
                    "InvalidPermission.Duplicate",
                    "the specified rule already exists",
                ));
            }
            group.permissions.push(permission);
        }
        Ok(group.clone())
    }

    async fn delete_security_group(&self, session: &AwsSession, group_id: &str) -> AwsResult<()> {
        self.enter("DeleteSecurityGroup").await?;
        self.region(session)
            .security_groups
            .remove(group_id)
            .map(|_| ())
            .ok_or_else(|| not_found("InvalidGroup.NotFound", "security group", group_id))
    }

    async fn ping(&self) -> AwsResult<()> {
        self.enter("Ping").await
    }
}
