//! AWS Adapter
//!
//! Translates the normalized resource contract into EKS and EC2 calls.
//! Clusters and node groups are addressed by name, networks by VPC id.

pub mod client;

use crate::domain::model::{
    AutoscalingSpec, ClusterStatus, CreateClusterRequest, CreateNetworkRequest,
    CreateNodeGroupRequest, CreateSecurityRuleSetRequest, CreateSubnetRequest, InstanceSpec,
    Ipv4Cidr, ManagedCluster, NetworkStatus, NodeGroup, NodeGroupRef, PortRange, ProviderId,
    ResourceRef, RuleDirection, RuleProtocol, ScaleNodeGroupRequest, SecretBundle, SecurityRule,
    SecurityRuleSet, Subnet, VirtualNetwork,
};
use crate::domain::ports::{CidrPolicy, ProviderAdapter, ProviderCapabilities};
use crate::error::{Error, Result};
use async_trait::async_trait;
use client::{
    AwsApiError, AwsControlPlane, AwsSession, CreateEksClusterInput, Ec2SecurityGroup, Ec2Subnet,
    Ec2Vpc, EksCluster, EksNodegroup, EksScalingConfig, InMemoryAws, IpPermission,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// EKS control planes must span at least this many availability zones
pub const MIN_EKS_SUBNET_AZS: usize = 2;

/// Narrowest and widest VPC blocks EC2 accepts
const VPC_PREFIX_RANGE: std::ops::RangeInclusive<u8> = 16..=28;

/// Secret bundle keys
pub mod keys {
    pub const ACCESS_KEY: &str = "access_key";
    pub const SECRET_KEY: &str = "secret_key";
    pub const SESSION_TOKEN: &str = "session_token";
    pub const ROLE_ARN: &str = "role_arn";
}

// =============================================================================
// Configuration
// =============================================================================

/// AWS adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub enabled: bool,
    /// Region used for account-level calls such as caller identity
    pub default_region: String,
    /// Role assumed by the EKS control plane when none is supplied
    pub cluster_role_name: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_region: "us-east-1".to_string(),
            cluster_role_name: "EKSClusterRole".to_string(),
        }
    }
}

/// Typed view of an AWS secret bundle
#[derive(Clone)]
pub struct AwsSettings {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub role_arn: Option<String>,
}

impl std::fmt::Debug for AwsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSettings")
            .field("access_key", &self.access_key)
            .field("role_arn", &self.role_arn)
            .finish_non_exhaustive()
    }
}

impl AwsSettings {
    pub fn builder() -> AwsSettingsBuilder {
        AwsSettingsBuilder::default()
    }

    pub fn from_secrets(secrets: &SecretBundle) -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(value) = secrets.get(keys::ACCESS_KEY) {
            builder = builder.access_key(value);
        }
        if let Some(value) = secrets.get(keys::SECRET_KEY) {
            builder = builder.secret_key(value);
        }
        if let Some(value) = secrets.get(keys::SESSION_TOKEN) {
            builder = builder.session_token(value);
        }
        if let Some(value) = secrets.get(keys::ROLE_ARN) {
            builder = builder.role_arn(value);
        }
        builder.build()
    }

    fn session(&self, region: &str) -> AwsSession {
        AwsSession {
            access_key: self.access_key.clone(),
            region: region.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct AwsSettingsBuilder {
    access_key: Option<String>,
    secret_key: Option<String>,
    session_token: Option<String>,
    role_arn: Option<String>,
}

impl AwsSettingsBuilder {
    pub fn access_key(mut self, value: impl Into<String>) -> Self {
        self.access_key = Some(value.into());
        self
    }

    pub fn secret_key(mut self, value: impl Into<String>) -> Self {
        self.secret_key = Some(value.into());
        self
    }

    pub fn session_token(mut self, value: impl Into<String>) -> Self {
        self.session_token = Some(value.into());
        self
    }

    pub fn role_arn(mut self, value: impl Into<String>) -> Self {
        self.role_arn = Some(value.into());
        self
    }

    /// Build the settings, reporting every missing field at once
    pub fn build(self) -> Result<AwsSettings> {
        let mut missing = Vec::new();
        if self.access_key.is_none() {
            missing.push(keys::ACCESS_KEY);
        }
        if self.secret_key.is_none() {
            missing.push(keys::SECRET_KEY);
        }
        if let Some(arn) = &self.role_arn {
            if !arn.starts_with("arn:aws:iam::") {
                return Err(Error::invalid(format!("role_arn is not an IAM role ARN: {}", arn)));
            }
        }

        match (self.access_key, self.secret_key) {
            (Some(access_key), Some(secret_key)) => Ok(AwsSettings {
                access_key,
                secret_key,
                session_token: self.session_token,
                role_arn: self.role_arn,
            }),
            _ => Err(Error::invalid(format!(
                "{} not found in credential",
                missing.join(", ")
            ))),
        }
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Map an AWS error code onto the control plane taxonomy
pub fn map_aws_error(err: AwsApiError, kind: &str, name: &str) -> Error {
    debug!(code = %err.code, kind, name, "AWS call failed");
    let context = format!("aws {} '{}': {}", kind, name, err.message);
    match err.code.as_str() {
        "ResourceNotFoundException"
        | "NotFoundException"
        | "NoSuchEntity"
        | "InvalidVpcID.NotFound"
        | "InvalidSubnetID.NotFound"
        | "InvalidGroup.NotFound" => Error::not_found(kind, name),

        "AccessDeniedException"
        | "AccessDenied"
        | "UnauthorizedOperation"
        | "UnrecognizedClientException"
        | "InvalidClientTokenId"
        | "AuthFailure"
        | "ExpiredToken" => Error::PermissionDenied(context),

        "LimitExceededException"
        | "VcpuLimitExceeded"
        | "VpcLimitExceeded"
        | "ResourceLimitExceededException"
        | "ThrottlingException"
        | "Throttling"
        | "RequestLimitExceeded" => Error::QuotaExceeded(context),

        "ResourceInUseException"
        | "ResourceConflictException"
        | "DependencyViolation"
        | "InvalidGroup.Duplicate"
        | "InvalidPermission.Duplicate"
        | "InvalidSubnet.Conflict" => Error::Conflict(context),

        "InvalidParameterException"
        | "InvalidParameterValue"
        | "InvalidParameterCombination"
        | "InvalidRequestException"
        | "InvalidSubnet.Range"
        | "InvalidVpc.Range"
        | "UnsupportedAvailabilityZoneException"
        | "ValidationError" => Error::InvalidArgument(context),

        "ServiceUnavailableException" | "ServiceUnavailable" | "RequestTimeout" => {
            Error::Unavailable(context)
        }

        _ => Error::Unknown(format!("{} ({})", context, err.code)),
    }
}

// =============================================================================
// Status / Shape Mapping
// =============================================================================

fn cluster_status(native: &str) -> ClusterStatus {
    match native {
        "CREATING" | "PENDING" => ClusterStatus::Provisioning,
        "ACTIVE" => ClusterStatus::Active,
        "UPDATING" => ClusterStatus::Upgrading,
        "DELETING" => ClusterStatus::Deleting,
        _ => ClusterStatus::Error,
    }
}

fn network_status(state: &str) -> NetworkStatus {
    match state {
        "available" => NetworkStatus::Available,
        "pending" => NetworkStatus::Pending,
        _ => NetworkStatus::Error,
    }
}

fn to_cluster(native: EksCluster, region: &str) -> ManagedCluster {
    let network_refs = native.vpc_id.into_iter().chain(native.subnet_ids).collect();
    ManagedCluster {
        id: native.name.clone(),
        name: native.name,
        provider: ProviderId::aws(),
        region: region.to_string(),
        version: native.version,
        status: cluster_status(&native.status),
        network_refs,
        endpoint: native.endpoint,
        created_at: native.created_at,
    }
}

fn to_node_group(native: EksNodegroup) -> NodeGroup {
    NodeGroup {
        id: native.name.clone(),
        cluster_id: native.cluster_name,
        name: native.name,
        desired_count: native.scaling.desired_size,
        instance_spec: InstanceSpec {
            instance_type: native.instance_types.into_iter().next().unwrap_or_default(),
            disk_size_gb: native.disk_size,
        },
        autoscaling: AutoscalingSpec {
            min: native.scaling.min_size,
            max: native.scaling.max_size,
            enabled: native.scaling.min_size != native.scaling.max_size,
        },
        status: cluster_status(&native.status),
    }
}

fn to_network(native: Ec2Vpc, region: &str) -> VirtualNetwork {
    VirtualNetwork {
        id: native.vpc_id,
        name: native.name,
        cidr_block: Some(native.cidr_block),
        region: region.to_string(),
        provider: ProviderId::aws(),
        status: network_status(&native.state),
    }
}

fn to_subnet(native: Ec2Subnet, region: &str) -> Subnet {
    Subnet {
        id: native.subnet_id,
        vpc_id: native.vpc_id,
        name: native.name,
        cidr_block: native.cidr_block,
        zone: native.availability_zone,
        region: region.to_string(),
        is_public: native.map_public_ip_on_launch,
    }
}

fn to_permission(rule: &SecurityRule) -> Result<IpPermission> {
    let source = rule.cidr_or_tag.trim();
    if Ipv4Cidr::parse(source).is_err() && !source.starts_with("sg-") {
        return Err(Error::invalid(format!(
            "security group rules need a CIDR block or a group id, got {}",
            source
        )));
    }
    let ip_protocol = match rule.protocol {
        RuleProtocol::Tcp => "tcp",
        RuleProtocol::Udp => "udp",
        RuleProtocol::Icmp => "icmp",
        RuleProtocol::All => "-1",
    };
    Ok(IpPermission {
        egress: rule.direction == RuleDirection::Egress,
        ip_protocol: ip_protocol.to_string(),
        from_port: rule.port_range.map(|r| r.from),
        to_port: rule.port_range.map(|r| r.to),
        cidr_ip: source.to_string(),
    })
}

fn from_permission(permission: &IpPermission) -> SecurityRule {
    let protocol = match permission.ip_protocol.as_str() {
        "tcp" => RuleProtocol::Tcp,
        "udp" => RuleProtocol::Udp,
        "icmp" => RuleProtocol::Icmp,
        _ => RuleProtocol::All,
    };
    let port_range = match (permission.from_port, permission.to_port) {
        (Some(from), Some(to)) => Some(PortRange { from, to }),
        _ => None,
    };
    SecurityRule {
        direction: if permission.egress {
            RuleDirection::Egress
        } else {
            RuleDirection::Ingress
        },
        protocol,
        port_range,
        cidr_or_tag: permission.cidr_ip.clone(),
    }
}

fn to_rule_set(native: Ec2SecurityGroup, region: &str) -> SecurityRuleSet {
    SecurityRuleSet {
        id: native.group_id,
        name: native.group_name,
        vpc_id: native.vpc_id,
        region: region.to_string(),
        rules: native.permissions.iter().map(from_permission).collect(),
    }
}

fn scaling(min: u32, max: u32, desired: u32) -> Result<EksScalingConfig> {
    if min < 1 {
        return Err(Error::invalid("node group minimum size must be at least 1"));
    }
    if !(min <= desired && desired <= max) {
        return Err(Error::invalid(format!(
            "node group sizes must satisfy min <= desired <= max (got {} / {} / {})",
            min, desired, max
        )));
    }
    Ok(EksScalingConfig {
        min_size: min,
        max_size: max,
        desired_size: desired,
    })
}

// =============================================================================
// Adapter
// =============================================================================

/// EKS/EC2 adapter
pub struct AwsAdapter {
    config: AwsConfig,
    client: Arc<dyn AwsControlPlane>,
}

impl AwsAdapter {
    pub fn new(config: AwsConfig, client: Arc<dyn AwsControlPlane>) -> Self {
        info!(default_region = %config.default_region, "AWS adapter initialized");
        Self { config, client }
    }

    /// Adapter backed by a simulated control plane
    pub fn in_memory(config: AwsConfig) -> Self {
        Self::new(config, Arc::new(InMemoryAws::new()))
    }

    pub fn config(&self) -> &AwsConfig {
        &self.config
    }

    /// Role for the cluster: the request's, then the credential's, then
    /// the account default
    async fn resolve_role_arn(
        &self,
        settings: &AwsSettings,
        request: &CreateClusterRequest,
    ) -> Result<String> {
        if let Some(arn) = request.role_arn.as_ref().filter(|a| !a.is_empty()) {
            return Ok(arn.clone());
        }
        if let Some(arn) = &settings.role_arn {
            return Ok(arn.clone());
        }

        let session = settings.session(&self.config.default_region);
        let account = self
            .client
            .get_caller_identity(&session)
            .await
            .map_err(|e| map_aws_error(e, "CallerIdentity", &settings.access_key))?;
        let arn = format!(
            "arn:aws:iam::{}:role/{}",
            account, self.config.cluster_role_name
        );
        debug!(role_arn = %arn, "Using default cluster role");
        Ok(arn)
    }

    async fn check_cluster_subnets(
        &self,
        session: &AwsSession,
        request: &CreateClusterRequest,
    ) -> Result<Vec<String>> {
        let subnet_ids: Vec<String> = request
            .subnet_ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if subnet_ids.len() < MIN_EKS_SUBNET_AZS {
            return Err(Error::invalid(format!(
                "EKS clusters need at least {} subnets in distinct availability zones",
                MIN_EKS_SUBNET_AZS
            )));
        }

        let subnets = self
            .client
            .describe_subnets(session, &subnet_ids)
            .await
            .map_err(|e| map_aws_error(e, "Subnet", &subnet_ids.join(",")))?;

        let zones: BTreeSet<&str> = subnets
            .iter()
            .map(|s| s.availability_zone.as_str())
            .collect();
        if zones.len() < MIN_EKS_SUBNET_AZS {
            return Err(Error::invalid(format!(
                "EKS clusters need subnets in at least {} availability zones, got {}",
                MIN_EKS_SUBNET_AZS,
                zones.len()
            )));
        }
        if let Some(vpc_id) = &request.vpc_id {
            if let Some(stray) = subnets.iter().find(|s| &s.vpc_id != vpc_id) {
                return Err(Error::invalid(format!(
                    "subnet {} belongs to {} rather than {}",
                    stray.subnet_id, stray.vpc_id, vpc_id
                )));
            }
        }
        Ok(subnet_ids)
    }

    async fn find_node_group(
        &self,
        session: &AwsSession,
        cluster: &str,
        node_group: &str,
    ) -> Result<EksNodegroup> {
        self.client
            .list_nodegroups(session, cluster)
            .await
            .map_err(|e| map_aws_error(e, "Cluster", cluster))?
            .into_iter()
            .find(|g| g.name == node_group)
            .ok_or_else(|| Error::not_found("NodeGroup", node_group))
    }
}

#[async_trait]
impl ProviderAdapter for AwsAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::aws()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            network_cidr: CidrPolicy::Required,
            global_networks: false,
            min_cluster_subnet_zones: MIN_EKS_SUBNET_AZS,
            rule_sets_require_network: false,
        }
    }

    // =========================================================================
    // Clusters
    // =========================================================================

    async fn create_cluster(
        &self,
        secrets: &SecretBundle,
        request: &CreateClusterRequest,
    ) -> Result<ManagedCluster> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let session = settings.session(&request.region);

        let subnet_ids = self.check_cluster_subnets(&session, request).await?;
        let role_arn = self.resolve_role_arn(&settings, request).await?;

        let cluster = self
            .client
            .create_cluster(
                &session,
                CreateEksClusterInput {
                    name: request.name.clone(),
                    version: request.version.clone(),
                    role_arn,
                    subnet_ids,
                    tags: request.tags.clone(),
                },
            )
            .await
            .map_err(|e| map_aws_error(e, "Cluster", &request.name))?;

        info!(cluster = %cluster.name, region = %request.region, "EKS cluster creation started");
        Ok(to_cluster(cluster, &request.region))
    }

    async fn list_clusters(
        &self,
        secrets: &SecretBundle,
        region: &str,
    ) -> Result<Vec<ManagedCluster>> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let clusters = self
            .client
            .list_clusters(&settings.session(region))
            .await
            .map_err(|e| map_aws_error(e, "Cluster", region))?;
        Ok(clusters.into_iter().map(|c| to_cluster(c, region)).collect())
    }

    async fn get_cluster(
        &self,
        secrets: &SecretBundle,
        cluster: &ResourceRef,
    ) -> Result<ManagedCluster> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let native = self
            .client
            .describe_cluster(&settings.session(&cluster.region), &cluster.id)
            .await
            .map_err(|e| map_aws_error(e, "Cluster", &cluster.id))?;
        Ok(to_cluster(native, &cluster.region))
    }

    async fn delete_cluster(&self, secrets: &SecretBundle, cluster: &ResourceRef) -> Result<()> {
        let settings = AwsSettings::from_secrets(secrets)?;
        self.client
            .delete_cluster(&settings.session(&cluster.region), &cluster.id)
            .await
            .map_err(|e| map_aws_error(e, "Cluster", &cluster.id))
    }

    // =========================================================================
    // Node Groups
    // =========================================================================

    async fn create_node_group(
        &self,
        secrets: &SecretBundle,
        request: &CreateNodeGroupRequest,
    ) -> Result<NodeGroup> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let session = settings.session(&request.region);
        let scaling = scaling(
            request.autoscaling.min,
            request.autoscaling.max,
            request.desired_count,
        )?;

        let subnets = if request.subnet_ids.is_empty() {
            self.client
                .describe_cluster(&session, &request.cluster_id)
                .await
                .map_err(|e| map_aws_error(e, "Cluster", &request.cluster_id))?
                .subnet_ids
        } else {
            request.subnet_ids.clone()
        };

        let native = self
            .client
            .create_nodegroup(
                &session,
                EksNodegroup {
                    name: request.name.clone(),
                    cluster_name: request.cluster_id.clone(),
                    status: String::new(),
                    instance_types: vec![request.instance_spec.instance_type.clone()],
                    disk_size: request.instance_spec.disk_size_gb,
                    scaling,
                    subnets,
                },
            )
            .await
            .map_err(|e| map_aws_error(e, "NodeGroup", &request.name))?;
        Ok(to_node_group(native))
    }

    async fn list_node_groups(
        &self,
        secrets: &SecretBundle,
        cluster: &ResourceRef,
    ) -> Result<Vec<NodeGroup>> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let groups = self
            .client
            .list_nodegroups(&settings.session(&cluster.region), &cluster.id)
            .await
            .map_err(|e| map_aws_error(e, "Cluster", &cluster.id))?;
        Ok(groups.into_iter().map(to_node_group).collect())
    }

    async fn scale_node_group(
        &self,
        secrets: &SecretBundle,
        request: &ScaleNodeGroupRequest,
    ) -> Result<NodeGroup> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let session = settings.session(&request.region);

        let (min, max) = match request.autoscaling {
            Some(bounds) => (bounds.min, bounds.max),
            None => {
                let current = self
                    .find_node_group(&session, &request.cluster_id, &request.node_group_id)
                    .await?;
                (current.scaling.min_size, current.scaling.max_size)
            }
        };
        let scaling = scaling(min, max, request.desired_count)?;

        let native = self
            .client
            .update_nodegroup_config(
                &session,
                &request.cluster_id,
                &request.node_group_id,
                scaling,
            )
            .await
            .map_err(|e| map_aws_error(e, "NodeGroup", &request.node_group_id))?;
        Ok(to_node_group(native))
    }

    async fn delete_node_group(
        &self,
        secrets: &SecretBundle,
        node_group: &NodeGroupRef,
    ) -> Result<()> {
        let settings = AwsSettings::from_secrets(secrets)?;
        self.client
            .delete_nodegroup(
                &settings.session(&node_group.region),
                &node_group.cluster_id,
                &node_group.node_group_id,
            )
            .await
            .map_err(|e| map_aws_error(e, "NodeGroup", &node_group.node_group_id))
    }

    // =========================================================================
    // Networks
    // =========================================================================

    async fn create_network(
        &self,
        secrets: &SecretBundle,
        request: &CreateNetworkRequest,
    ) -> Result<VirtualNetwork> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let cidr = request
            .cidr_block
            .as_deref()
            .ok_or_else(|| Error::invalid("VPC creation requires a CIDR block"))?;
        let block = Ipv4Cidr::parse(cidr)?;
        if !VPC_PREFIX_RANGE.contains(&block.prefix) {
            return Err(Error::invalid(format!(
                "VPC CIDR prefix must be between /{} and /{}, got /{}",
                VPC_PREFIX_RANGE.start(),
                VPC_PREFIX_RANGE.end(),
                block.prefix
            )));
        }

        let vpc = self
            .client
            .create_vpc(&settings.session(&request.region), &request.name, cidr)
            .await
            .map_err(|e| map_aws_error(e, "VirtualNetwork", &request.name))?;
        Ok(to_network(vpc, &request.region))
    }

    async fn list_networks(
        &self,
        secrets: &SecretBundle,
        region: &str,
    ) -> Result<Vec<VirtualNetwork>> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let vpcs = self
            .client
            .describe_vpcs(&settings.session(region))
            .await
            .map_err(|e| map_aws_error(e, "VirtualNetwork", region))?;
        Ok(vpcs.into_iter().map(|v| to_network(v, region)).collect())
    }

    async fn get_network(
        &self,
        secrets: &SecretBundle,
        network: &ResourceRef,
    ) -> Result<VirtualNetwork> {
        self.list_networks(secrets, &network.region)
            .await?
            .into_iter()
            .find(|n| n.id == network.id)
            .ok_or_else(|| Error::not_found("VirtualNetwork", &network.id))
    }

    async fn delete_network(&self, secrets: &SecretBundle, network: &ResourceRef) -> Result<()> {
        let settings = AwsSettings::from_secrets(secrets)?;
        self.client
            .delete_vpc(&settings.session(&network.region), &network.id)
            .await
            .map_err(|e| map_aws_error(e, "VirtualNetwork", &network.id))
    }

    // =========================================================================
    // Subnets
    // =========================================================================

    async fn create_subnet(
        &self,
        secrets: &SecretBundle,
        request: &CreateSubnetRequest,
    ) -> Result<Subnet> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let zone = request.zone.trim();
        if zone.is_empty() {
            return Err(Error::invalid("subnets need an availability zone"));
        }
        if !zone.starts_with(&request.region) {
            return Err(Error::invalid(format!(
                "availability zone {} is not in region {}",
                zone, request.region
            )));
        }

        let subnet = self
            .client
            .create_subnet(
                &settings.session(&request.region),
                Ec2Subnet {
                    subnet_id: String::new(),
                    vpc_id: request.vpc_id.clone(),
                    name: request.name.clone(),
                    cidr_block: request.cidr_block.clone(),
                    availability_zone: zone.to_string(),
                    map_public_ip_on_launch: request.is_public,
                },
            )
            .await
            .map_err(|e| map_aws_error(e, "VirtualNetwork", &request.vpc_id))?;
        Ok(to_subnet(subnet, &request.region))
    }

    async fn delete_subnet(&self, secrets: &SecretBundle, subnet: &ResourceRef) -> Result<()> {
        let settings = AwsSettings::from_secrets(secrets)?;
        self.client
            .delete_subnet(&settings.session(&subnet.region), &subnet.id)
            .await
            .map_err(|e| map_aws_error(e, "Subnet", &subnet.id))
    }

    // =========================================================================
    // Security Groups
    // =========================================================================

    async fn create_security_rule_set(
        &self,
        secrets: &SecretBundle,
        request: &CreateSecurityRuleSetRequest,
    ) -> Result<SecurityRuleSet> {
        let settings = AwsSettings::from_secrets(secrets)?;
        let session = settings.session(&request.region);
        let permissions = request
            .rules
            .iter()
            .map(to_permission)
            .collect::<Result<Vec<_>>>()?;
        let description = request
            .description
            .clone()
            .unwrap_or_else(|| request.name.clone());

        let group = self
            .client
            .create_security_group(
                &session,
                &request.name,
                &description,
                request.vpc_id.as_deref(),
            )
            .await
            .map_err(|e| map_aws_error(e, "SecurityRuleSet", &request.name))?;

        if permissions.is_empty() {
            return Ok(to_rule_set(group, &request.region));
        }

        match self
            .client
            .authorize_security_group(&session, &group.group_id, permissions)
            .await
        {
            Ok(group) => Ok(to_rule_set(group, &request.region)),
            Err(err) => {
                if let Err(cleanup) = self
                    .client
                    .delete_security_group(&session, &group.group_id)
                    .await
                {
                    warn!(group_id = %group.group_id, error = %cleanup,
                        "Failed to remove security group after rule authorization failed");
                }
                Err(map_aws_error(err, "SecurityRuleSet", &request.name))
            }
        }
    }

    async fn delete_security_rule_set(
        &self,
        secrets: &SecretBundle,
        rule_set: &ResourceRef,
    ) -> Result<()> {
        let settings = AwsSettings::from_secrets(secrets)?;
        self.client
            .delete_security_group(&settings.session(&rule_set.region), &rule_set.id)
            .await
            .map_err(|e| map_aws_error(e, "SecurityRuleSet", &rule_set.id))
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(error = %err, "AWS control plane health check failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn secrets() -> SecretBundle {
        SecretBundle::new()
            .with(keys::ACCESS_KEY, "AKIATEST")
            .with(keys::SECRET_KEY, "secret")
    }

    fn adapter() -> (AwsAdapter, Arc<InMemoryAws>) {
        let client = Arc::new(InMemoryAws::new());
        (AwsAdapter::new(AwsConfig::default(), client.clone()), client)
    }

    async fn network_with_subnets(adapter: &AwsAdapter, zones: &[&str]) -> (String, Vec<String>) {
        let vpc = adapter
            .create_network(
                &secrets(),
                &CreateNetworkRequest {
                    credential_id: "cred-1".into(),
                    name: "main".into(),
                    region: "us-east-1".into(),
                    cidr_block: Some("10.0.0.0/16".into()),
                },
            )
            .await
            .unwrap();

        let mut subnet_ids = Vec::new();
        for (i, zone) in zones.iter().enumerate() {
            let subnet = adapter
                .create_subnet(
                    &secrets(),
                    &CreateSubnetRequest {
                        credential_id: "cred-1".into(),
                        vpc_id: vpc.id.clone(),
                        name: format!("subnet-{}", i),
                        cidr_block: format!("10.0.{}.0/24", i),
                        zone: zone.to_string(),
                        region: "us-east-1".into(),
                        is_public: false,
                    },
                )
                .await
                .unwrap();
            subnet_ids.push(subnet.id);
        }
        (vpc.id, subnet_ids)
    }

    fn cluster_request(subnet_ids: Vec<String>) -> CreateClusterRequest {
        CreateClusterRequest {
            credential_id: "cred-1".into(),
            name: "prod".into(),
            region: "us-east-1".into(),
            version: "1.29".into(),
            subnet_ids,
            vpc_id: None,
            role_arn: None,
            tags: Default::default(),
        }
    }

    #[test]
    fn test_settings_report_missing_fields() {
        let err = AwsSettings::from_secrets(&SecretBundle::new()).unwrap_err();
        assert_matches!(&err, Error::InvalidArgument(msg) if msg.contains("access_key") && msg.contains("secret_key"));

        let err = AwsSettings::from_secrets(&SecretBundle::new().with(keys::SECRET_KEY, "s"))
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(msg) if msg == "access_key not found in credential");
    }

    #[test]
    fn test_error_mapping() {
        let map = |code: &str| map_aws_error(AwsApiError::new(code, "boom"), "Cluster", "c").kind();
        use crate::error::ErrorKind;

        assert_eq!(map("ResourceNotFoundException"), ErrorKind::NotFound);
        assert_eq!(map("UnauthorizedOperation"), ErrorKind::PermissionDenied);
        assert_eq!(map("ThrottlingException"), ErrorKind::QuotaExceeded);
        assert_eq!(map("VcpuLimitExceeded"), ErrorKind::QuotaExceeded);
        assert_eq!(map("DependencyViolation"), ErrorKind::Conflict);
        assert_eq!(map("InvalidParameterException"), ErrorKind::InvalidArgument);
        assert_eq!(map("ServiceUnavailableException"), ErrorKind::Unavailable);
        assert_eq!(map("InternalFailure"), ErrorKind::Unknown);
    }

    #[test]
    fn test_mapped_errors_name_the_resource() {
        let err = map_aws_error(AwsApiError::new("AccessDenied", "denied"), "Cluster", "prod");
        assert_matches!(&err, Error::PermissionDenied(msg) if msg == "aws Cluster 'prod': denied");

        let err = map_aws_error(
            AwsApiError::new("DependencyViolation", "has dependencies"),
            "VirtualNetwork",
            "vpc-1",
        );
        assert!(err.to_string().contains("aws VirtualNetwork 'vpc-1'"));

        let err = map_aws_error(AwsApiError::new("InternalFailure", "boom"), "Subnet", "subnet-9");
        assert_matches!(&err, Error::Unknown(msg) if msg.contains("subnet-9") && msg.contains("InternalFailure"));
    }

    #[tokio::test]
    async fn test_vpc_requires_cidr() {
        let (adapter, client) = adapter();
        let mut request = CreateNetworkRequest {
            credential_id: "cred-1".into(),
            name: "main".into(),
            region: "us-east-1".into(),
            cidr_block: None,
        };
        assert_matches!(
            adapter.create_network(&secrets(), &request).await,
            Err(Error::InvalidArgument(_))
        );

        request.cidr_block = Some("10.0.0.0/8".into());
        assert_matches!(
            adapter.create_network(&secrets(), &request).await,
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_subnet_outside_vpc_rejected() {
        let (adapter, _) = adapter();
        let (vpc_id, _) = network_with_subnets(&adapter, &[]).await;

        let err = adapter
            .create_subnet(
                &secrets(),
                &CreateSubnetRequest {
                    credential_id: "cred-1".into(),
                    vpc_id,
                    name: "stray".into(),
                    cidr_block: "192.168.0.0/24".into(),
                    zone: "us-east-1a".into(),
                    region: "us-east-1".into(),
                    is_public: true,
                },
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
    }

    #[tokio::test]
    async fn test_cluster_needs_two_zones() {
        let (adapter, _) = adapter();
        let (_, subnets) = network_with_subnets(&adapter, &["us-east-1a", "us-east-1a"]).await;

        let err = adapter
            .create_cluster(&secrets(), &cluster_request(subnets))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidArgument(_));
    }

    #[tokio::test]
    async fn test_cluster_uses_default_role() {
        let (adapter, _) = adapter();
        let (vpc_id, subnets) =
            network_with_subnets(&adapter, &["us-east-1a", "us-east-1b"]).await;

        let cluster = adapter
            .create_cluster(&secrets(), &cluster_request(subnets.clone()))
            .await
            .unwrap();
        assert_eq!(cluster.id, "prod");
        assert_eq!(cluster.status, ClusterStatus::Provisioning);
        assert_eq!(cluster.network_refs[0], vpc_id);

        let fetched = adapter
            .get_cluster(&secrets(), &ResourceRef::new("cred-1", "us-east-1", "prod"))
            .await
            .unwrap();
        assert_eq!(fetched.status, ClusterStatus::Active);

        // A subnet used by a cluster cannot be removed
        let err = adapter
            .delete_subnet(&secrets(), &ResourceRef::new("cred-1", "us-east-1", &subnets[0]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Conflict(_));
    }

    #[tokio::test]
    async fn test_node_group_scaling_bounds() {
        let (adapter, _) = adapter();
        let (_, subnets) = network_with_subnets(&adapter, &["us-east-1a", "us-east-1b"]).await;
        adapter
            .create_cluster(&secrets(), &cluster_request(subnets))
            .await
            .unwrap();

        let group = adapter
            .create_node_group(
                &secrets(),
                &CreateNodeGroupRequest {
                    credential_id: "cred-1".into(),
                    region: "us-east-1".into(),
                    cluster_id: "prod".into(),
                    name: "workers".into(),
                    desired_count: 2,
                    instance_spec: InstanceSpec {
                        instance_type: "m5.large".into(),
                        disk_size_gb: Some(50),
                    },
                    autoscaling: AutoscalingSpec {
                        min: 1,
                        max: 4,
                        enabled: true,
                    },
                    subnet_ids: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(group.desired_count, 2);

        let mut scale = ScaleNodeGroupRequest {
            credential_id: "cred-1".into(),
            region: "us-east-1".into(),
            cluster_id: "prod".into(),
            node_group_id: "workers".into(),
            desired_count: 5,
            autoscaling: None,
        };
        assert_matches!(
            adapter.scale_node_group(&secrets(), &scale).await,
            Err(Error::InvalidArgument(_))
        );

        scale.desired_count = 4;
        let scaled = adapter.scale_node_group(&secrets(), &scale).await.unwrap();
        assert_eq!(scaled.desired_count, 4);

        // Cluster with node groups attached cannot be deleted
        let err = adapter
            .delete_cluster(&secrets(), &ResourceRef::new("cred-1", "us-east-1", "prod"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Conflict(_));
    }

    #[tokio::test]
    async fn test_security_group_rules() {
        let (adapter, _) = adapter();
        let rule_set = adapter
            .create_security_rule_set(
                &secrets(),
                &CreateSecurityRuleSetRequest {
                    credential_id: "cred-1".into(),
                    name: "web".into(),
                    region: "us-east-1".into(),
                    vpc_id: None,
                    description: None,
                    rules: vec![SecurityRule {
                        direction: RuleDirection::Ingress,
                        protocol: RuleProtocol::Tcp,
                        port_range: Some(PortRange::single(443)),
                        cidr_or_tag: "0.0.0.0/0".into(),
                    }],
                },
            )
            .await
            .unwrap();
        assert!(rule_set.id.starts_with("sg-"));
        assert_eq!(rule_set.rules.len(), 1);
        assert_eq!(rule_set.rules[0].port_range, Some(PortRange::single(443)));
    }

    #[tokio::test]
    async fn test_throttling_maps_to_quota() {
        let (adapter, client) = adapter();
        client.inject_fault(
            "DescribeVpcs",
            AwsApiError::new("ThrottlingException", "Rate exceeded"),
        );

        let err = adapter.list_networks(&secrets(), "us-east-1").await.unwrap_err();
        assert_matches!(err, Error::QuotaExceeded(_));
        assert!(err.is_retryable());
    }
}
