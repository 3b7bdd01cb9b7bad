//! Event propagation
//!
//! Orchestration outcomes become topic-routed events that fan out to every
//! observer whose subscription pattern and filter accept them.
//!
//! - [`topic`]: topic builder and the pure wildcard matcher
//! - [`subscriptions`]: per-observer subscription sets and the pattern index
//! - [`bus`]: bounded submission queue and dispatch workers
//! - [`publisher`]: facade that turns entities into events

pub mod bus;
pub mod event;
pub mod filter;
pub mod metrics;
pub mod publisher;
pub mod sink;
pub mod subscriptions;
pub mod topic;

pub use bus::{EventBus, EventBusConfig};
pub use event::{Event, EventAction, EventPayload};
pub use filter::{SubscriptionFilter, SubscriptionRequest};
pub use metrics::{BusMetricsSnapshot, DispatchReport, RegistryStatsSnapshot};
pub use publisher::EventPublisher;
pub use sink::ChannelSink;
pub use subscriptions::{OwnerId, Subscription, SubscriptionRegistry, SyncReport};
pub use topic::{topic_matches, ResourceFamily, Topic, TopicPattern, TopicResource};
