//! Event Publisher
//!
//! Facade the orchestrator uses to announce lifecycle outcomes. Builds the
//! canonical topic and a flat payload per resource type and hands the event
//! to the bus. Publication failures are logged and swallowed: the business
//! operation has already succeeded or failed on its own.

use crate::domain::model::{
    Credential, ManagedCluster, NodeGroup, SecurityRuleSet, Subnet, VirtualNetwork,
};
use crate::error::{Error, Result};
use crate::events::bus::EventBus;
use crate::events::event::{fields, Event, EventAction, EventPayload};
use crate::events::topic::{ResourceFamily, Topic, TopicResource};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle event publisher
#[derive(Debug, Clone)]
pub struct EventPublisher {
    bus: Arc<EventBus>,
}

impl EventPublisher {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // =========================================================================
    // Kubernetes
    // =========================================================================

    pub fn cluster(&self, action: EventAction, credential: &Credential, cluster: &ManagedCluster) {
        self.entity(
            ResourceFamily::Kubernetes,
            TopicResource::Clusters,
            action,
            credential,
            &cluster.region,
            cluster,
        );
    }

    pub fn node_group(
        &self,
        action: EventAction,
        credential: &Credential,
        region: &str,
        node_group: &NodeGroup,
    ) {
        self.entity(
            ResourceFamily::Kubernetes,
            TopicResource::NodeGroups,
            action,
            credential,
            region,
            node_group,
        );
    }

    // =========================================================================
    // Network
    // =========================================================================

    pub fn network(&self, action: EventAction, credential: &Credential, network: &VirtualNetwork) {
        self.entity(
            ResourceFamily::Network,
            TopicResource::Vpcs,
            action,
            credential,
            &network.region,
            network,
        );
    }

    pub fn subnet(&self, action: EventAction, credential: &Credential, subnet: &Subnet) {
        self.entity(
            ResourceFamily::Network,
            TopicResource::Subnets,
            action,
            credential,
            &subnet.region,
            subnet,
        );
    }

    pub fn security_rule_set(
        &self,
        action: EventAction,
        credential: &Credential,
        rule_set: &SecurityRuleSet,
    ) {
        self.entity(
            ResourceFamily::Network,
            TopicResource::SecurityGroups,
            action,
            credential,
            &rule_set.region,
            rule_set,
        );
    }

    // =========================================================================
    // Generic shapes
    // =========================================================================

    /// Announce a deletion; only the identity of the resource is known
    pub fn deleted(
        &self,
        family: ResourceFamily,
        resource: TopicResource,
        credential: &Credential,
        region: &str,
        id: &str,
    ) {
        let mut payload = base_payload(credential, region, EventAction::Deleted);
        payload.insert(fields::ID.to_string(), json!(id));
        self.emit(
            Topic::build(
                family,
                credential.provider.as_str(),
                &credential.id,
                region,
                resource,
                EventAction::Deleted,
            ),
            payload,
        );
    }

    /// Push a refreshed snapshot of every resource of one kind in a
    /// `(credential, region)` scope
    pub fn snapshot<T: Serialize>(
        &self,
        family: ResourceFamily,
        resource: TopicResource,
        credential: &Credential,
        region: &str,
        items: &[T],
    ) {
        let items = match serde_json::to_value(items) {
            Ok(items) => items,
            Err(e) => {
                warn!(resource = resource.as_segment(), "Failed to serialize snapshot: {}", e);
                return;
            }
        };

        let mut payload = base_payload(credential, region, EventAction::ListSync);
        payload.insert(fields::COUNT.to_string(), json!(items.as_array().map_or(0, Vec::len)));
        payload.insert(fields::ITEMS.to_string(), items);
        self.emit(
            Topic::build(
                family,
                credential.provider.as_str(),
                &credential.id,
                region,
                resource,
                EventAction::ListSync,
            ),
            payload,
        );
    }

    /// VM lifecycle events are scoped by workspace rather than credential
    pub fn vm(
        &self,
        action: EventAction,
        provider: &str,
        workspace_id: &str,
        region: &str,
        mut payload: EventPayload,
    ) {
        payload.insert(fields::PROVIDER.to_string(), json!(provider));
        payload.insert(fields::WORKSPACE_ID.to_string(), json!(workspace_id));
        payload.insert(fields::REGION.to_string(), json!(region));
        payload.insert(fields::ACTION.to_string(), json!(action.as_segment()));
        self.emit(Topic::vm(provider, workspace_id, region, action), payload);
    }

    fn entity<T: Serialize>(
        &self,
        family: ResourceFamily,
        resource: TopicResource,
        action: EventAction,
        credential: &Credential,
        region: &str,
        entity: &T,
    ) {
        let mut payload = match entity_payload(entity) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(resource = resource.as_segment(), "Failed to build event payload: {}", e);
                return;
            }
        };
        payload.extend(base_payload(credential, region, action));

        self.emit(
            Topic::build(
                family,
                credential.provider.as_str(),
                &credential.id,
                region,
                resource,
                action,
            ),
            payload,
        );
    }

    fn emit(&self, topic: Result<Topic>, payload: EventPayload) {
        let topic = match topic {
            Ok(topic) => topic,
            Err(e) => {
                warn!("Event not published, invalid topic: {}", e);
                return;
            }
        };

        let event = Event::new(topic.as_str(), topic.action(), payload);
        match self.bus.publish(event) {
            Ok(()) => debug!(topic = %topic, "Event published"),
            Err(e) => warn!(topic = %topic, "Failed to publish event: {}", e),
        }
    }
}

fn base_payload(credential: &Credential, region: &str, action: EventAction) -> EventPayload {
    let mut payload = EventPayload::new();
    payload.insert(fields::PROVIDER.to_string(), json!(credential.provider.as_str()));
    payload.insert(fields::CREDENTIAL_ID.to_string(), json!(credential.id));
    payload.insert(fields::REGION.to_string(), json!(region));
    payload.insert(fields::ACTION.to_string(), json!(action.as_segment()));
    payload
}

/// Flatten an entity's top-level fields into a payload
fn entity_payload<T: Serialize>(entity: &T) -> Result<EventPayload> {
    match serde_json::to_value(entity)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(Error::Internal(format!(
            "event entity serialized to {} instead of an object",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
