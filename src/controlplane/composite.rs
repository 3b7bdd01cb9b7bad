//! Composite Cluster Provisioning
//!
//! Creates a cluster together with its own network in one logical request:
//!
//! ```text
//! network ──► subnet(s) ─┐
//!         └─► rule set ──┴─► cluster
//! ```
//!
//! Subnets and the optional rule set run concurrently behind a fan-in
//! barrier. The cluster is created only when every earlier step succeeded.
//! Nothing is rolled back; the [`CompositeReport`] lists every step so the
//! caller can see which remote resources exist.

use crate::controlplane::orchestrator::{ResourceOrchestrator, Target};
use crate::domain::context::CallContext;
use crate::domain::model::{
    CreateClusterRequest, CreateNetworkRequest, CreateSecurityRuleSetRequest,
    CreateSubnetRequest, Ipv4Cidr, ManagedCluster, SecurityRule, SecurityRuleSet, Subnet,
    VirtualNetwork,
};
use crate::domain::ports::CidrPolicy;
use crate::error::{Error, ErrorKind, Result};
use crate::events::EventAction;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::task::JoinSet;
use tracing::{info, warn};

const OPERATION: &str = "create_cluster_with_network";
const NETWORK_STEP: &str = "network";
const RULE_SET_STEP: &str = "rule_set";
const CLUSTER_STEP: &str = "cluster";

fn subnet_step(name: &str) -> String {
    format!("subnet/{}", name)
}

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// Left empty for providers that auto-allocate
    #[serde(default)]
    pub cidr_block: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetSpec {
    pub name: String,
    pub cidr_block: String,
    pub zone: String,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: Vec<SecurityRule>,
}

/// Cluster plus the network it should live in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeClusterRequest {
    pub credential_id: String,
    pub region: String,
    pub cluster_name: String,
    pub version: String,
    #[serde(default)]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub network: NetworkSpec,
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
    #[serde(default)]
    pub rule_set: Option<RuleSetSpec>,
}

impl CompositeClusterRequest {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("credential_id", &self.credential_id),
            ("region", &self.region),
            ("cluster_name", &self.cluster_name),
            ("version", &self.version),
            ("network name", &self.network.name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::invalid(format!("{} is required", field)));
            }
        }
        if let Some(cidr) = &self.network.cidr_block {
            Ipv4Cidr::parse(cidr)?;
        }

        let mut names = BTreeSet::new();
        for subnet in &self.subnets {
            if subnet.name.trim().is_empty() {
                return Err(Error::invalid("subnet name is required"));
            }
            if !names.insert(subnet.name.as_str()) {
                return Err(Error::invalid(format!(
                    "duplicate subnet name: {}",
                    subnet.name
                )));
            }
            Ipv4Cidr::parse(&subnet.cidr_block)?;
        }

        if let Some(rule_set) = &self.rule_set {
            if rule_set.name.trim().is_empty() {
                return Err(Error::invalid("rule set name is required"));
            }
        }
        Ok(())
    }

    fn distinct_zones(&self) -> usize {
        self.subnets
            .iter()
            .map(|s| s.zone.as_str())
            .filter(|z| !z.is_empty())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of one step of a composite operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Created { id: String },
    Failed { kind: ErrorKind, message: String },
    NotAttempted,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepOutcome::Created { id } => write!(f, "created({})", id),
            StepOutcome::Failed { kind, message } => write!(f, "failed({}: {})", kind, message),
            StepOutcome::NotAttempted => write!(f, "not_attempted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub resource_type: String,
    pub name: String,
    pub outcome: StepOutcome,
}

/// Every step of a composite operation, in plan order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeReport {
    pub operation: String,
    pub steps: IndexMap<String, StepReport>,
}

impl CompositeReport {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            steps: IndexMap::new(),
        }
    }

    /// Plan a step; it stays `NotAttempted` until recorded
    pub fn plan(&mut self, key: impl Into<String>, resource_type: &str, name: &str) {
        self.steps.insert(
            key.into(),
            StepReport {
                resource_type: resource_type.to_string(),
                name: name.to_string(),
                outcome: StepOutcome::NotAttempted,
            },
        );
    }

    pub fn record_created(&mut self, key: &str, id: &str) {
        self.record(key, StepOutcome::Created { id: id.to_string() });
    }

    pub fn record_failed(&mut self, key: &str, error: &Error) {
        self.record(
            key,
            StepOutcome::Failed {
                kind: error.kind(),
                message: error.to_string(),
            },
        );
    }

    fn record(&mut self, key: &str, outcome: StepOutcome) {
        if let Some(step) = self.steps.get_mut(key) {
            step.outcome = outcome;
        }
    }

    pub fn outcome(&self, key: &str) -> Option<&StepOutcome> {
        self.steps.get(key).map(|s| &s.outcome)
    }

    /// Kind of the first failed step in plan order
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        self.steps.values().find_map(|s| match &s.outcome {
            StepOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.steps
            .values()
            .all(|s| matches!(s.outcome, StepOutcome::Created { .. }))
    }

    /// `(step, remote id)` for every resource that now exists remotely
    pub fn created(&self) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .filter_map(|(key, s)| match &s.outcome {
                StepOutcome::Created { id } => Some((key.as_str(), id.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(&str, &StepOutcome)> {
        self.steps
            .iter()
            .filter(|(_, s)| matches!(s.outcome, StepOutcome::Failed { .. }))
            .map(|(key, s)| (key.as_str(), &s.outcome))
            .collect()
    }
}

impl std::fmt::Display for CompositeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.operation)?;
        for (i, (key, step)) in self.steps.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}{}={}", sep, key, step.outcome)?;
        }
        Ok(())
    }
}

/// Everything a successful composite operation created
#[derive(Debug, Clone, Serialize)]
pub struct ClusterWithNetwork {
    pub cluster: ManagedCluster,
    pub network: VirtualNetwork,
    pub subnets: Vec<Subnet>,
    pub rule_set: Option<SecurityRuleSet>,
    pub report: CompositeReport,
}

// =============================================================================
// Orchestration
// =============================================================================

enum Provisioned {
    Subnet(Subnet),
    RuleSet(SecurityRuleSet),
}

impl ResourceOrchestrator {
    /// Create a network, its subnets, an optional rule set and finally a
    /// cluster attached to them.
    ///
    /// On any failure the returned [`Error::Composite`] carries the full
    /// report; resources already created are left in place.
    pub async fn create_cluster_with_network(
        &self,
        ctx: &CallContext,
        request: &CompositeClusterRequest,
    ) -> Result<ClusterWithNetwork> {
        request.validate()?;
        let target = self.target(ctx, &request.credential_id).await?;
        let capabilities = target.capabilities();

        if capabilities.network_cidr == CidrPolicy::Required && request.network.cidr_block.is_none()
        {
            return Err(Error::invalid(format!(
                "network cidr_block is required for {}",
                target.provider()
            )));
        }
        if request.distinct_zones() < capabilities.min_cluster_subnet_zones {
            return Err(Error::invalid(format!(
                "{} clusters need subnets in at least {} zones",
                target.provider(),
                capabilities.min_cluster_subnet_zones
            )));
        }

        let mut report = CompositeReport::new(OPERATION);
        report.plan(NETWORK_STEP, "network", &request.network.name);
        for subnet in &request.subnets {
            report.plan(subnet_step(&subnet.name), "subnet", &subnet.name);
        }
        if let Some(rule_set) = &request.rule_set {
            report.plan(RULE_SET_STEP, "security_rule_set", &rule_set.name);
        }
        report.plan(CLUSTER_STEP, "cluster", &request.cluster_name);

        let outcome = self.run_steps(ctx, &target, request, &mut report).await;

        info!(
            provider = %target.provider(),
            request_id = %ctx.request_id,
            success = report.is_success(),
            "{}",
            report
        );
        self.audit(
            ctx,
            "create",
            "cluster_with_network",
            &request.cluster_name,
            &target.credential,
            BTreeMap::from([(
                "report".to_string(),
                serde_json::to_value(&report).unwrap_or_else(|_| json!(report.to_string())),
            )]),
        );

        match outcome {
            Some((cluster, network, subnets, rule_set)) if report.is_success() => {
                Ok(ClusterWithNetwork {
                    cluster,
                    network,
                    subnets,
                    rule_set,
                    report,
                })
            }
            _ => Err(Error::Composite(Box::new(report))),
        }
    }

    async fn run_steps(
        &self,
        ctx: &CallContext,
        target: &Target,
        request: &CompositeClusterRequest,
        report: &mut CompositeReport,
    ) -> Option<(ManagedCluster, VirtualNetwork, Vec<Subnet>, Option<SecurityRuleSet>)> {
        let secrets = &target.credential.secrets;

        // Network
        let network_request = CreateNetworkRequest {
            credential_id: request.credential_id.clone(),
            name: request.network.name.clone(),
            region: request.region.clone(),
            cidr_block: request.network.cidr_block.clone(),
        };
        let network = match ctx
            .run(
                "CreateNetwork",
                target.adapter.create_network(secrets, &network_request),
            )
            .await
        {
            Ok(network) => network,
            Err(e) => {
                report.record_failed(NETWORK_STEP, &e);
                return None;
            }
        };
        report.record_created(NETWORK_STEP, &network.id);
        self.publisher()
            .network(EventAction::Created, &target.credential, &network);

        // Subnets and rule set behind one barrier
        let mut tasks = JoinSet::new();
        let mut pending = BTreeSet::new();

        for subnet in &request.subnets {
            let key = subnet_step(&subnet.name);
            let subnet_request = CreateSubnetRequest {
                credential_id: request.credential_id.clone(),
                vpc_id: network.id.clone(),
                name: subnet.name.clone(),
                cidr_block: subnet.cidr_block.clone(),
                zone: subnet.zone.clone(),
                region: request.region.clone(),
                is_public: subnet.is_public,
            };
            let adapter = target.adapter.clone();
            let secrets = secrets.clone();
            let child = ctx.child();
            pending.insert(key.clone());
            tasks.spawn(async move {
                let outcome = child
                    .run("CreateSubnet", adapter.create_subnet(&secrets, &subnet_request))
                    .await
                    .map(Provisioned::Subnet);
                (key, outcome)
            });
        }

        if let Some(rule_set) = &request.rule_set {
            let rule_set_request = CreateSecurityRuleSetRequest {
                credential_id: request.credential_id.clone(),
                name: rule_set.name.clone(),
                region: request.region.clone(),
                vpc_id: Some(network.id.clone()),
                description: rule_set.description.clone(),
                rules: rule_set.rules.clone(),
            };
            let adapter = target.adapter.clone();
            let secrets = secrets.clone();
            let child = ctx.child();
            pending.insert(RULE_SET_STEP.to_string());
            tasks.spawn(async move {
                let outcome = child
                    .run(
                        "CreateSecurityRuleSet",
                        adapter.create_security_rule_set(&secrets, &rule_set_request),
                    )
                    .await
                    .map(Provisioned::RuleSet);
                (RULE_SET_STEP.to_string(), outcome)
            });
        }

        let mut subnets: HashMap<String, Subnet> = HashMap::new();
        let mut rule_set = None;

        while let Some(joined) = tasks.join_next().await {
            let (key, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(request_id = %ctx.request_id, "Composite step task aborted: {}", e);
                    continue;
                }
            };
            pending.remove(&key);

            match outcome {
                Ok(Provisioned::Subnet(subnet)) => {
                    report.record_created(&key, &subnet.id);
                    self.publisher()
                        .subnet(EventAction::Created, &target.credential, &subnet);
                    subnets.insert(key, subnet);
                }
                Ok(Provisioned::RuleSet(created)) => {
                    report.record_created(&key, &created.id);
                    self.publisher().security_rule_set(
                        EventAction::Created,
                        &target.credential,
                        &created,
                    );
                    rule_set = Some(created);
                }
                Err(e) => report.record_failed(&key, &e),
            }
        }

        // A task that panicked may still have reached the provider
        for key in pending {
            report.record_failed(
                &key,
                &Error::Unknown("step task ended without reporting".to_string()),
            );
        }

        if report.failure_kind().is_some() {
            return None;
        }

        // Cluster
        let subnets: Vec<Subnet> = request
            .subnets
            .iter()
            .filter_map(|s| subnets.remove(&subnet_step(&s.name)))
            .collect();
        let cluster_request = CreateClusterRequest {
            credential_id: request.credential_id.clone(),
            name: request.cluster_name.clone(),
            region: request.region.clone(),
            version: request.version.clone(),
            subnet_ids: subnets.iter().map(|s| s.id.clone()).collect(),
            vpc_id: Some(network.id.clone()),
            role_arn: request.role_arn.clone(),
            tags: request.tags.clone(),
        };
        let cluster = match ctx
            .run(
                "CreateCluster",
                target.adapter.create_cluster(secrets, &cluster_request),
            )
            .await
        {
            Ok(cluster) => cluster,
            Err(e) => {
                report.record_failed(CLUSTER_STEP, &e);
                return None;
            }
        };
        report.record_created(CLUSTER_STEP, &cluster.id);
        self.publisher()
            .cluster(EventAction::Created, &target.credential, &cluster);

        Some((cluster, network, subnets, rule_set))
    }
}
