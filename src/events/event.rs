//! Events
//!
//! The unit of propagation: a routed topic plus a flat payload that carries
//! denormalized resource fields for direct client-side cache application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat key/value payload. JSON at the transport boundary.
pub type EventPayload = BTreeMap<String, serde_json::Value>;

/// Well-known payload keys
pub mod fields {
    pub const PROVIDER: &str = "provider";
    pub const CREDENTIAL_ID: &str = "credential_id";
    /// Alternate spelling some clients send
    pub const CREDENTIAL_ID_CAMEL: &str = "credentialId";
    pub const WORKSPACE_ID: &str = "workspace_id";
    pub const REGION: &str = "region";
    pub const ACTION: &str = "action";
    pub const ID: &str = "id";
    pub const ITEMS: &str = "items";
    pub const COUNT: &str = "count";
}

/// What happened to the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
    /// Refreshed snapshot pushed by a reconciliation sweep
    #[serde(rename = "list")]
    ListSync,
}

impl EventAction {
    /// Topic segment for this action
    pub fn as_segment(&self) -> &'static str {
        match self {
            EventAction::Created => "created",
            EventAction::Updated => "updated",
            EventAction::Deleted => "deleted",
            EventAction::ListSync => "list",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "created" => Some(EventAction::Created),
            "updated" => Some(EventAction::Updated),
            "deleted" => Some(EventAction::Deleted),
            "list" => Some(EventAction::ListSync),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_segment())
    }
}

/// A published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub topic: String,
    pub action: EventAction,
    pub payload: EventPayload,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, action: EventAction, payload: EventPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            action,
            payload,
            published_at: Utc::now(),
        }
    }

    /// Build an event from a bare topic string, taking the action from the
    /// last segment. Unknown actions are treated as updates.
    pub fn from_topic(topic: impl Into<String>, payload: EventPayload) -> Self {
        let topic = topic.into();
        let action = topic
            .rsplit('.')
            .next()
            .and_then(EventAction::from_segment)
            .unwrap_or(EventAction::Updated);
        Self::new(topic, action, payload)
    }

    /// String value of a payload field
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}
