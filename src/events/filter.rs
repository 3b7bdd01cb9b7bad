//! Subscription Filters
//!
//! A filter narrows a topic match by payload attributes. Each dimension is
//! optional; an absent or empty dimension places no restriction. When a
//! dimension is set and the payload does not carry that field, the event is
//! not delivered.

use crate::error::Result;
use crate::events::event::{fields, EventPayload};
use crate::events::topic::TopicPattern;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Attribute filter attached to a subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ids: Option<BTreeSet<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<BTreeSet<String>>,

    /// Matched case-insensitively
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<BTreeSet<String>>,
}

impl SubscriptionFilter {
    /// Filter that accepts every payload
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_credential_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.credential_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = Some(regions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = Some(
            providers
                .into_iter()
                .map(|p| p.into().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// No dimension restricts anything
    pub fn is_unrestricted(&self) -> bool {
        active(&self.credential_ids).is_none()
            && active(&self.regions).is_none()
            && active(&self.providers).is_none()
    }

    /// Credential ids this filter is pinned to, if any
    pub fn pinned_credentials(&self) -> Option<&BTreeSet<String>> {
        active(&self.credential_ids)
    }

    /// Regions this filter is pinned to, if any
    pub fn pinned_regions(&self) -> Option<&BTreeSet<String>> {
        active(&self.regions)
    }

    /// Evaluate the filter against an event payload
    pub fn matches(&self, payload: &EventPayload) -> bool {
        if let Some(ids) = active(&self.credential_ids) {
            let credential = str_value(payload, fields::CREDENTIAL_ID)
                .or_else(|| str_value(payload, fields::CREDENTIAL_ID_CAMEL));
            match credential {
                Some(id) if ids.contains(id) => {}
                _ => return false,
            }
        }

        if let Some(regions) = active(&self.regions) {
            match str_value(payload, fields::REGION) {
                Some(region) if regions.contains(region) => {}
                _ => return false,
            }
        }

        if let Some(providers) = active(&self.providers) {
            match str_value(payload, fields::PROVIDER) {
                Some(provider)
                    if providers
                        .iter()
                        .any(|p| p.eq_ignore_ascii_case(provider)) => {}
                _ => return false,
            }
        }

        true
    }
}

fn active(dimension: &Option<BTreeSet<String>>) -> Option<&BTreeSet<String>> {
    dimension.as_ref().filter(|set| !set.is_empty())
}

fn str_value<'a>(payload: &'a EventPayload, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(|v| v.as_str())
}

// =============================================================================
// Subscription Request
// =============================================================================

/// Subscription request as sent by the real-time transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Dot-segmented pattern; `*` matches exactly one segment
    pub topic_pattern: String,

    #[serde(default)]
    pub filter: SubscriptionFilter,
}

impl SubscriptionRequest {
    pub fn new(topic_pattern: impl Into<String>, filter: SubscriptionFilter) -> Self {
        Self {
            topic_pattern: topic_pattern.into(),
            filter,
        }
    }

    /// Validate the pattern
    pub fn pattern(&self) -> Result<TopicPattern> {
        TopicPattern::parse(&self.topic_pattern)
    }

    /// JSON Schema for the request shape
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(SubscriptionRequest)
    }
}
