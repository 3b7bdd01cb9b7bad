//! Topics and Topic Matching
//!
//! Topics are dot-segmented routing keys built from a fixed template:
//!
//! ```text
//! {family}.{provider}.{scopeId}.{region}.{resource}.{action}
//! kubernetes.aws.cred-123.us-east-1.clusters.created
//! ```
//!
//! Publishers only ever emit literal segments. Subscribers may use `*` to
//! match exactly one segment; there is no multi-segment wildcard.

use crate::events::event::EventAction;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const SEGMENT_SEPARATOR: char = '.';
pub const WILDCARD: &str = "*";

/// Region segment used for provider objects that are not regional
pub const GLOBAL_REGION: &str = "global";

// =============================================================================
// Topic Template
// =============================================================================

/// First topic segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceFamily {
    Kubernetes,
    Network,
    Vm,
}

impl ResourceFamily {
    pub fn as_segment(&self) -> &'static str {
        match self {
            ResourceFamily::Kubernetes => "kubernetes",
            ResourceFamily::Network => "network",
            ResourceFamily::Vm => "vm",
        }
    }
}

impl std::fmt::Display for ResourceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_segment())
    }
}

/// Fifth topic segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicResource {
    Clusters,
    NodeGroups,
    Vpcs,
    Subnets,
    SecurityGroups,
    Instances,
}

impl TopicResource {
    pub fn as_segment(&self) -> &'static str {
        match self {
            TopicResource::Clusters => "clusters",
            TopicResource::NodeGroups => "nodegroups",
            TopicResource::Vpcs => "vpcs",
            TopicResource::Subnets => "subnets",
            TopicResource::SecurityGroups => "securitygroups",
            TopicResource::Instances => "instances",
        }
    }
}

/// A fully literal, publishable topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    family: ResourceFamily,
    resource: TopicResource,
    action: EventAction,
    rendered: String,
}

impl Topic {
    /// Build a topic from its template parts. Every variable segment must be
    /// a non-empty literal without separators or wildcards.
    pub fn build(
        family: ResourceFamily,
        provider: &str,
        scope_id: &str,
        region: &str,
        resource: TopicResource,
        action: EventAction,
    ) -> Result<Self> {
        validate_literal_segment("provider", provider)?;
        validate_literal_segment("scope id", scope_id)?;
        validate_literal_segment("region", region)?;

        let rendered = [
            family.as_segment(),
            provider,
            scope_id,
            region,
            resource.as_segment(),
            action.as_segment(),
        ]
        .join(".");

        Ok(Self {
            family,
            resource,
            action,
            rendered,
        })
    }

    /// `kubernetes.{provider}.{credentialId}.{region}.{resource}.{action}`
    pub fn kubernetes(
        provider: &str,
        credential_id: &str,
        region: &str,
        resource: TopicResource,
        action: EventAction,
    ) -> Result<Self> {
        Self::build(ResourceFamily::Kubernetes, provider, credential_id, region, resource, action)
    }

    /// `network.{provider}.{credentialId}.{region}.{resource}.{action}`
    pub fn network(
        provider: &str,
        credential_id: &str,
        region: &str,
        resource: TopicResource,
        action: EventAction,
    ) -> Result<Self> {
        Self::build(ResourceFamily::Network, provider, credential_id, region, resource, action)
    }

    /// `vm.{provider}.{workspaceId}.{region}.instances.{action}`
    pub fn vm(provider: &str, workspace_id: &str, region: &str, action: EventAction) -> Result<Self> {
        Self::build(
            ResourceFamily::Vm,
            provider,
            workspace_id,
            region,
            TopicResource::Instances,
            action,
        )
    }

    pub fn family(&self) -> ResourceFamily {
        self.family
    }

    pub fn resource(&self) -> TopicResource {
        self.resource
    }

    pub fn action(&self) -> EventAction {
        self.action
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rendered)
    }
}

fn validate_literal_segment(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid(format!("topic {} segment is empty", name)));
    }
    if value.contains(SEGMENT_SEPARATOR) || value.contains('*') {
        return Err(Error::invalid(format!(
            "topic {} segment '{}' contains a reserved character",
            name, value
        )));
    }
    if !value.is_ascii() || value.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control()) {
        return Err(Error::invalid(format!(
            "topic {} segment '{}' must be printable ASCII",
            name, value
        )));
    }
    Ok(())
}

// =============================================================================
// Matching
// =============================================================================

/// Match a pattern's segments against a topic's segments.
///
/// `*` matches exactly one segment, everything else must be equal, and the
/// segment counts must agree. Defined for every input.
pub fn segments_match<'p, 't>(
    mut pattern: impl Iterator<Item = &'p str>,
    mut topic: impl Iterator<Item = &'t str>,
) -> bool {
    loop {
        match (pattern.next(), topic.next()) {
            (None, None) => return true,
            (Some(p), Some(t)) => {
                if p != WILDCARD && p != t {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Match a dot-segmented pattern against a dot-segmented topic
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    segments_match(
        pattern.split(SEGMENT_SEPARATOR),
        topic.split(SEGMENT_SEPARATOR),
    )
}

/// Number of segments in a topic or pattern
pub fn segment_count(topic: &str) -> usize {
    topic.split(SEGMENT_SEPARATOR).count()
}

/// A validated subscription pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segment_count: usize,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(Error::invalid("topic pattern is empty"));
        }

        let mut count = 0;
        for segment in pattern.split(SEGMENT_SEPARATOR) {
            count += 1;
            if segment.is_empty() {
                return Err(Error::invalid(format!(
                    "topic pattern '{}' has an empty segment",
                    pattern
                )));
            }
            if segment != WILDCARD && segment.contains('*') {
                return Err(Error::invalid(format!(
                    "topic pattern '{}': '*' must be a whole segment",
                    pattern
                )));
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segment_count: count,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        topic_matches(&self.raw, topic)
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Literal first segment, if the pattern is scoped to one family
    pub fn leading_segment(&self) -> &str {
        self.raw.split(SEGMENT_SEPARATOR).next().unwrap_or(WILDCARD)
    }

    /// Whether this pattern can match topics of `family`
    pub fn covers_family(&self, family: ResourceFamily) -> bool {
        let lead = self.leading_segment();
        lead == WILDCARD || lead == family.as_segment()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
