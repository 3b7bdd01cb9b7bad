//! Subscription Registry
//!
//! Tracks, per connected observer, the set of subscribed topic patterns and
//! their filters, and answers which observers an event must reach.
//!
//! Locking:
//! - owners live in sharded maps that hold the only strong reference to an
//!   observer; the pattern index holds weak references
//! - each observer guards its subscription set with its own `RwLock`; a
//!   delivery holds the read side across the sink hand-off, and
//!   [`SubscriptionRegistry::remove_owner`] takes the write side to close the
//!   observer, so nothing is delivered to an owner once removal returns
//! - lock order is observer state, then index; dispatch never holds both

use crate::domain::ports::{DeliveryOutcome, EventSinkRef};
use crate::error::{Error, Result};
use crate::events::event::Event;
use crate::events::filter::SubscriptionFilter;
use crate::events::metrics::{DispatchReport, RegistryStats, RegistryStatsSnapshot};
use crate::events::topic::{segment_count, ResourceFamily, TopicPattern};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

// =============================================================================
// Constants
// =============================================================================

/// Number of owner shards
pub const OWNER_SHARD_COUNT: usize = 64;

// =============================================================================
// Owner ID
// =============================================================================

/// Identifier of one observer connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn shard_index(&self) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() as usize) % OWNER_SHARD_COUNT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&OwnerId> for OwnerId {
    fn from(id: &OwnerId) -> Self {
        id.clone()
    }
}

// =============================================================================
// Subscriptions and Observers
// =============================================================================

/// One (pattern, filter) pair registered by an observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub owner_id: OwnerId,
    pub pattern: TopicPattern,
    pub filter: SubscriptionFilter,
}

/// Work performed by one `sync_subscriptions` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    /// Retained patterns whose filter was replaced in place
    pub filters_updated: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.subscribed.is_empty() && self.unsubscribed.is_empty() && self.filters_updated == 0
    }
}

struct ObserverState {
    closed: bool,
    subscriptions: HashMap<String, Subscription>,
}

struct Observer {
    owner_id: OwnerId,
    sink: EventSinkRef,
    state: RwLock<ObserverState>,
    connected_at: DateTime<Utc>,
}

impl Observer {
    /// Hand the event to this observer if a live subscription accepts it.
    /// At most one delivery per event, however many patterns match.
    fn offer(&self, event: &Arc<Event>, report: &mut DispatchReport) {
        let state = self.state.read();
        if state.closed {
            return;
        }

        let mut topic_hit = false;
        let mut accepted = false;
        for subscription in state.subscriptions.values() {
            if subscription.pattern.matches(&event.topic) {
                topic_hit = true;
                if subscription.filter.matches(&event.payload) {
                    accepted = true;
                    break;
                }
            }
        }

        if !topic_hit {
            return;
        }
        report.matched += 1;
        if !accepted {
            report.filtered += 1;
            return;
        }

        match self.sink.deliver(Arc::clone(event)) {
            DeliveryOutcome::Delivered => report.delivered += 1,
            DeliveryOutcome::Full => {
                debug!(owner = %self.owner_id, topic = %event.topic, "Observer buffer full, delivery dropped");
                report.dropped_full += 1;
            }
            DeliveryOutcome::Closed => report.dropped_closed += 1,
        }
    }
}

// =============================================================================
// Pattern Index
// =============================================================================

struct IndexEntry {
    pattern: TopicPattern,
    observers: HashMap<OwnerId, Weak<Observer>>,
}

/// Patterns bucketed by segment count; a topic is only compared against
/// patterns of its own length
#[derive(Default)]
struct PatternIndex {
    by_segments: HashMap<usize, HashMap<String, IndexEntry>>,
}

impl PatternIndex {
    fn insert(&mut self, pattern: &TopicPattern, owner: &OwnerId, observer: Weak<Observer>) {
        self.by_segments
            .entry(pattern.segment_count())
            .or_default()
            .entry(pattern.as_str().to_string())
            .or_insert_with(|| IndexEntry {
                pattern: pattern.clone(),
                observers: HashMap::new(),
            })
            .observers
            .insert(owner.clone(), observer);
    }

    fn remove(&mut self, pattern: &TopicPattern, owner: &OwnerId) {
        let len = pattern.segment_count();
        let Some(bucket) = self.by_segments.get_mut(&len) else {
            return;
        };
        if let Some(entry) = bucket.get_mut(pattern.as_str()) {
            entry.observers.remove(owner);
            if entry.observers.is_empty() {
                bucket.remove(pattern.as_str());
            }
        }
        if bucket.is_empty() {
            self.by_segments.remove(&len);
        }
    }

    /// Observers with at least one pattern matching `topic`, deduplicated
    fn candidates(&self, topic: &str) -> HashMap<OwnerId, Weak<Observer>> {
        let mut found = HashMap::new();
        if let Some(bucket) = self.by_segments.get(&segment_count(topic)) {
            for entry in bucket.values() {
                if entry.pattern.matches(topic) {
                    for (owner, observer) in &entry.observers {
                        found.entry(owner.clone()).or_insert_with(|| observer.clone());
                    }
                }
            }
        }
        found
    }

    fn pattern_count(&self) -> usize {
        self.by_segments.values().map(HashMap::len).sum()
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Registry of observers and their subscriptions
pub struct SubscriptionRegistry {
    shards: Box<[RwLock<HashMap<OwnerId, Arc<Observer>>>]>,
    index: RwLock<PatternIndex>,
    stats: RegistryStats,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("observers", &self.stats.observers.load(Ordering::Relaxed))
            .field("subscriptions", &self.stats.subscriptions.load(Ordering::Relaxed))
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        let shards = (0..OWNER_SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Arc::new(Self {
            shards,
            index: RwLock::new(PatternIndex::default()),
            stats: RegistryStats::default(),
        })
    }

    /// Register an observer connection and the sink its events go to
    pub fn connect(&self, owner_id: impl Into<OwnerId>, sink: EventSinkRef) -> Result<()> {
        let owner_id = owner_id.into();
        let mut observers = self.shards[owner_id.shard_index()].write();
        if observers.contains_key(&owner_id) {
            return Err(Error::Conflict(format!(
                "observer {} is already connected",
                owner_id
            )));
        }

        observers.insert(
            owner_id.clone(),
            Arc::new(Observer {
                owner_id: owner_id.clone(),
                sink,
                state: RwLock::new(ObserverState {
                    closed: false,
                    subscriptions: HashMap::new(),
                }),
                connected_at: Utc::now(),
            }),
        );
        self.stats.observers.fetch_add(1, Ordering::Relaxed);

        debug!(owner = %owner_id, "Observer connected");
        Ok(())
    }

    pub fn is_connected(&self, owner_id: impl Into<OwnerId>) -> bool {
        let owner_id = owner_id.into();
        self.shards[owner_id.shard_index()].read().contains_key(&owner_id)
    }

    /// When the observer connected
    pub fn connected_at(&self, owner_id: impl Into<OwnerId>) -> Option<DateTime<Utc>> {
        let owner_id = owner_id.into();
        self.shards[owner_id.shard_index()]
            .read()
            .get(&owner_id)
            .map(|o| o.connected_at)
    }

    fn observer(&self, owner_id: &OwnerId) -> Result<Arc<Observer>> {
        self.shards[owner_id.shard_index()]
            .read()
            .get(owner_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Observer", owner_id.as_str()))
    }

    /// Add one subscription. Returns `false` if the pattern was already
    /// subscribed, in which case only its filter is replaced.
    pub fn subscribe(
        &self,
        owner_id: impl Into<OwnerId>,
        pattern: &str,
        filter: SubscriptionFilter,
    ) -> Result<bool> {
        let owner_id = owner_id.into();
        let pattern = TopicPattern::parse(pattern)?;
        let observer = self.observer(&owner_id)?;

        let mut state = observer.state.write();
        if state.closed {
            return Err(Error::not_found("Observer", owner_id.as_str()));
        }

        if let Some(existing) = state.subscriptions.get_mut(pattern.as_str()) {
            existing.filter = filter;
            return Ok(false);
        }
        self.insert_locked(&observer, &mut state, pattern, filter);
        Ok(true)
    }

    /// Remove one subscription. Returns `false` if it was not present.
    pub fn unsubscribe(&self, owner_id: impl Into<OwnerId>, pattern: &str) -> Result<bool> {
        let owner_id = owner_id.into();
        let pattern = TopicPattern::parse(pattern)?;
        let observer = self.observer(&owner_id)?;

        let mut state = observer.state.write();
        if state.closed {
            return Ok(false);
        }
        Ok(self.remove_locked(&owner_id, &mut state, pattern.as_str()))
    }

    fn insert_locked(
        &self,
        observer: &Arc<Observer>,
        state: &mut ObserverState,
        pattern: TopicPattern,
        filter: SubscriptionFilter,
    ) {
        self.index
            .write()
            .insert(&pattern, &observer.owner_id, Arc::downgrade(observer));
        state.subscriptions.insert(
            pattern.as_str().to_string(),
            Subscription {
                owner_id: observer.owner_id.clone(),
                pattern,
                filter,
            },
        );
        self.stats.subscribe_calls.fetch_add(1, Ordering::Relaxed);
        self.stats.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    fn remove_locked(&self, owner_id: &OwnerId, state: &mut ObserverState, key: &str) -> bool {
        let Some(subscription) = state.subscriptions.remove(key) else {
            return false;
        };
        self.index.write().remove(&subscription.pattern, owner_id);
        self.stats.unsubscribe_calls.fetch_add(1, Ordering::Relaxed);
        self.stats.subscriptions.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Bring the owner's subscribed topic set to exactly `required`.
    ///
    /// Only the difference is applied: missing patterns are subscribed,
    /// surplus ones unsubscribed, retained ones keep their index entry and
    /// get `filter` in place if it changed. Every pattern is validated before
    /// anything is touched.
    pub fn sync_subscriptions<I, S>(
        &self,
        owner_id: impl Into<OwnerId>,
        required: I,
        filter: &SubscriptionFilter,
    ) -> Result<SyncReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let owner_id = owner_id.into();
        let mut wanted: BTreeMap<String, TopicPattern> = BTreeMap::new();
        for topic in required {
            let pattern = TopicPattern::parse(topic.as_ref())?;
            wanted.insert(pattern.as_str().to_string(), pattern);
        }

        let observer = self.observer(&owner_id)?;
        let mut state = observer.state.write();
        if state.closed {
            return Err(Error::not_found("Observer", owner_id.as_str()));
        }

        let mut report = SyncReport::default();

        let surplus: Vec<String> = state
            .subscriptions
            .keys()
            .filter(|key| !wanted.contains_key(*key))
            .cloned()
            .collect();
        for key in surplus {
            if self.remove_locked(&owner_id, &mut state, &key) {
                report.unsubscribed.push(key);
            }
        }

        for (key, pattern) in wanted {
            if let Some(existing) = state.subscriptions.get_mut(&key) {
                if existing.filter != *filter {
                    existing.filter = filter.clone();
                    report.filters_updated += 1;
                }
                continue;
            }
            self.insert_locked(&observer, &mut state, pattern, filter.clone());
            report.subscribed.push(key);
        }
        report.unsubscribed.sort();

        if !report.is_noop() {
            debug!(
                owner = %owner_id,
                added = report.subscribed.len(),
                removed = report.unsubscribed.len(),
                filters_updated = report.filters_updated,
                "Subscriptions synchronized"
            );
        }
        Ok(report)
    }

    /// Remove the owner and every subscription it holds.
    ///
    /// Safe to call concurrently with dispatch; once this returns no further
    /// event reaches the owner's sink. Unknown owners are a no-op.
    pub fn remove_owner(&self, owner_id: impl Into<OwnerId>) -> usize {
        let owner_id = owner_id.into();
        let Some(observer) = self.shards[owner_id.shard_index()].write().remove(&owner_id) else {
            return 0;
        };

        let removed: Vec<Subscription> = {
            let mut state = observer.state.write();
            state.closed = true;
            state.subscriptions.drain().map(|(_, s)| s).collect()
        };

        {
            let mut index = self.index.write();
            for subscription in &removed {
                index.remove(&subscription.pattern, &owner_id);
            }
        }

        let count = removed.len();
        self.stats
            .subscriptions
            .fetch_sub(count as u64, Ordering::Relaxed);
        self.stats.observers.fetch_sub(1, Ordering::Relaxed);
        self.stats.removals.fetch_add(1, Ordering::Relaxed);

        info!(owner = %owner_id, subscriptions = count, "Observer removed");
        count
    }

    /// Patterns the owner is subscribed to, sorted
    pub fn topics_of(&self, owner_id: impl Into<OwnerId>) -> Vec<String> {
        let owner_id = owner_id.into();
        let Ok(observer) = self.observer(&owner_id) else {
            return Vec::new();
        };
        let state = observer.state.read();
        let mut topics: Vec<String> = state.subscriptions.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Current subscription of the owner for `pattern`
    pub fn subscription(&self, owner_id: impl Into<OwnerId>, pattern: &str) -> Option<Subscription> {
        let owner_id = owner_id.into();
        let observer = self.observer(&owner_id).ok()?;
        let state = observer.state.read();
        state.subscriptions.get(pattern.trim()).cloned()
    }

    /// Deliver an event to every observer with a matching, accepting
    /// subscription
    pub fn dispatch(&self, event: &Arc<Event>) -> DispatchReport {
        let candidates = self.index.read().candidates(&event.topic);

        let mut report = DispatchReport::default();
        for observer in candidates.values() {
            if let Some(observer) = observer.upgrade() {
                observer.offer(event, &mut report);
            }
        }
        report
    }

    /// Observer counts per `(credential id, region)` for live subscriptions
    /// that can match `family` and pin both dimensions in their filter.
    /// Each observer counts once per pair.
    pub fn interest(&self, family: ResourceFamily) -> BTreeMap<(String, String), usize> {
        let mut pairs: BTreeMap<(String, String), usize> = BTreeMap::new();

        for shard in self.shards.iter() {
            for observer in shard.read().values() {
                let state = observer.state.read();
                if state.closed {
                    continue;
                }

                let mut seen = BTreeSet::new();
                for subscription in state.subscriptions.values() {
                    if !subscription.pattern.covers_family(family) {
                        continue;
                    }
                    let (Some(credentials), Some(regions)) = (
                        subscription.filter.pinned_credentials(),
                        subscription.filter.pinned_regions(),
                    ) else {
                        continue;
                    };
                    for credential in credentials {
                        for region in regions {
                            seen.insert((credential.clone(), region.clone()));
                        }
                    }
                }

                for pair in seen {
                    *pairs.entry(pair).or_default() += 1;
                }
            }
        }

        pairs
    }

    pub fn observer_count(&self) -> usize {
        self.stats.observers.load(Ordering::Relaxed) as usize
    }

    /// Distinct patterns in the index
    pub fn pattern_count(&self) -> usize {
        self.index.read().pattern_count()
    }

    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::EventSink;
    use crate::events::event::EventPayload;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64};

    #[derive(Default)]
    struct RecordingSink {
        events: parking_lot::Mutex<Vec<Arc<Event>>>,
        removed: AtomicBool,
        late_deliveries: AtomicU64,
    }

    impl EventSink for RecordingSink {
        fn deliver(&self, event: Arc<Event>) -> DeliveryOutcome {
            if self.removed.load(Ordering::SeqCst) {
                self.late_deliveries.fetch_add(1, Ordering::SeqCst);
            }
            self.events.lock().push(event);
            DeliveryOutcome::Delivered
        }
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.events.lock().len()
        }
    }

    fn event(topic: &str, pairs: &[(&str, &str)]) -> Arc<Event> {
        let payload: EventPayload = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        Arc::new(Event::from_topic(topic, payload))
    }

    const AWS_CREATED: &str = "kubernetes.aws.cred1.us-east-1.clusters.created";

    #[test]
    fn test_owner_id_sharding() {
        let a = OwnerId::new("conn-1");
        let b = OwnerId::new("conn-1");
        assert_eq!(a.shard_index(), b.shard_index());
        assert!(a.shard_index() < OWNER_SHARD_COUNT);
    }

    #[test]
    fn test_subscribe_and_dispatch() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        registry.connect("conn-1", sink.clone()).unwrap();

        assert!(registry
            .subscribe("conn-1", "kubernetes.aws.*.*.clusters.created", SubscriptionFilter::any())
            .unwrap());

        let report = registry.dispatch(&event(AWS_CREATED, &[]));
        assert_eq!(report.delivered, 1);
        assert_eq!(sink.count(), 1);

        let report = registry.dispatch(&event("kubernetes.gcp.c.europe-west1.clusters.created", &[]));
        assert_eq!(report.matched, 0);
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_overlapping_patterns_deliver_once() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        registry.connect("conn-1", sink.clone()).unwrap();
        registry
            .sync_subscriptions(
                "conn-1",
                ["kubernetes.aws.*.*.clusters.created", "kubernetes.*.*.*.*.*", AWS_CREATED],
                &SubscriptionFilter::any(),
            )
            .unwrap();

        let report = registry.dispatch(&event(AWS_CREATED, &[]));
        assert_eq!(report.matched, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_many_observers_share_pattern() {
        let registry = SubscriptionRegistry::new();
        let sinks: Vec<Arc<RecordingSink>> = (0..5).map(|_| Arc::new(RecordingSink::default())).collect();
        for (i, sink) in sinks.iter().enumerate() {
            let owner = format!("conn-{}", i);
            registry.connect(owner.as_str(), sink.clone()).unwrap();
            registry
                .subscribe(owner.as_str(), "kubernetes.*.*.*.clusters.*", SubscriptionFilter::any())
                .unwrap();
        }
        assert_eq!(registry.pattern_count(), 1);

        let report = registry.dispatch(&event(AWS_CREATED, &[]));
        assert_eq!(report.delivered, 5);
        assert!(sinks.iter().all(|s| s.count() == 1));
    }

    #[test]
    fn test_region_filter_blocks_matching_topic() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        registry.connect("conn-1", sink.clone()).unwrap();
        registry
            .subscribe(
                "conn-1",
                "kubernetes.aws.*.*.clusters.*",
                SubscriptionFilter::any().with_regions(["us-east-1"]),
            )
            .unwrap();

        let report = registry.dispatch(&event(
            "kubernetes.aws.cred1.eu-west-1.clusters.created",
            &[("region", "eu-west-1")],
        ));
        assert_eq!(report.matched, 1);
        assert_eq!(report.filtered, 1);
        assert_eq!(sink.count(), 0);

        registry.dispatch(&event(AWS_CREATED, &[("region", "us-east-1")]));
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_sync_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        registry
            .connect("conn-1", Arc::new(RecordingSink::default()))
            .unwrap();

        let topics = ["kubernetes.aws.*.*.clusters.*", "network.aws.*.*.vpcs.*"];
        let first = registry
            .sync_subscriptions("conn-1", topics, &SubscriptionFilter::any())
            .unwrap();
        assert_eq!(first.subscribed.len(), 2);

        let before = registry.stats();
        let second = registry
            .sync_subscriptions("conn-1", topics, &SubscriptionFilter::any())
            .unwrap();
        let after = registry.stats();

        assert!(second.is_noop());
        assert_eq!(before.subscribe_calls, after.subscribe_calls);
        assert_eq!(before.unsubscribe_calls, after.unsubscribe_calls);
    }

    #[test]
    fn test_sync_applies_minimal_delta() {
        let registry = SubscriptionRegistry::new();
        registry
            .connect("conn-1", Arc::new(RecordingSink::default()))
            .unwrap();

        let (a, b, c) = ("vm.*.*.*.instances.*", "network.*.*.*.vpcs.*", "kubernetes.*.*.*.clusters.*");
        registry
            .sync_subscriptions("conn-1", [a, b], &SubscriptionFilter::any())
            .unwrap();

        let before = registry.stats();
        let report = registry
            .sync_subscriptions("conn-1", [b, c], &SubscriptionFilter::any())
            .unwrap();
        let after = registry.stats();

        assert_eq!(report.subscribed, vec![c.to_string()]);
        assert_eq!(report.unsubscribed, vec![a.to_string()]);
        assert_eq!(report.filters_updated, 0);
        assert_eq!(after.subscribe_calls - before.subscribe_calls, 1);
        assert_eq!(after.unsubscribe_calls - before.unsubscribe_calls, 1);
        assert_eq!(registry.topics_of("conn-1"), vec![c.to_string(), b.to_string()]);
    }

    #[test]
    fn test_sync_updates_filter_in_place() {
        let registry = SubscriptionRegistry::new();
        registry
            .connect("conn-1", Arc::new(RecordingSink::default()))
            .unwrap();
        let pattern = "kubernetes.*.*.*.clusters.*";
        registry
            .sync_subscriptions("conn-1", [pattern], &SubscriptionFilter::any())
            .unwrap();

        let narrowed = SubscriptionFilter::any().with_regions(["us-east-1"]);
        let report = registry
            .sync_subscriptions("conn-1", [pattern], &narrowed)
            .unwrap();
        assert_eq!(report.filters_updated, 1);
        assert!(report.subscribed.is_empty() && report.unsubscribed.is_empty());
        assert_eq!(registry.subscription("conn-1", pattern).unwrap().filter, narrowed);
    }

    #[test]
    fn test_sync_rejects_invalid_pattern_without_changes() {
        let registry = SubscriptionRegistry::new();
        registry
            .connect("conn-1", Arc::new(RecordingSink::default()))
            .unwrap();
        registry
            .sync_subscriptions("conn-1", ["vm.*.*.*.instances.*"], &SubscriptionFilter::any())
            .unwrap();

        let result = registry.sync_subscriptions(
            "conn-1",
            ["network.*.*.*.vpcs.*", "bad..pattern"],
            &SubscriptionFilter::any(),
        );
        assert_matches!(result, Err(Error::InvalidArgument(_)));
        assert_eq!(registry.topics_of("conn-1"), vec!["vm.*.*.*.instances.*".to_string()]);
    }

    #[test]
    fn test_unknown_owner() {
        let registry = SubscriptionRegistry::new();
        assert_matches!(
            registry.subscribe("ghost", "vm.*.*.*.instances.*", SubscriptionFilter::any()),
            Err(Error::NotFound { .. })
        );
        assert_eq!(registry.remove_owner("ghost"), 0);
    }

    #[test]
    fn test_duplicate_connect_conflicts() {
        let registry = SubscriptionRegistry::new();
        registry
            .connect("conn-1", Arc::new(RecordingSink::default()))
            .unwrap();
        assert_matches!(
            registry.connect("conn-1", Arc::new(RecordingSink::default())),
            Err(Error::Conflict(_))
        );
    }

    #[test]
    fn test_remove_owner_clears_everything() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        registry.connect("conn-1", sink.clone()).unwrap();
        registry
            .sync_subscriptions(
                "conn-1",
                ["kubernetes.*.*.*.clusters.*", "network.*.*.*.vpcs.*"],
                &SubscriptionFilter::any(),
            )
            .unwrap();

        assert_eq!(registry.remove_owner("conn-1"), 2);
        assert!(!registry.is_connected("conn-1"));
        assert_eq!(registry.pattern_count(), 0);
        assert_eq!(registry.stats().subscriptions, 0);
        assert_eq!(registry.dispatch(&event(AWS_CREATED, &[])).matched, 0);
        assert_eq!(sink.count(), 0);

        // Reconnecting under the same id starts clean
        registry.connect("conn-1", sink).unwrap();
        assert!(registry.topics_of("conn-1").is_empty());
    }

    #[test]
    fn test_index_holds_weak_references() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        registry.connect("conn-1", sink.clone()).unwrap();
        registry
            .subscribe("conn-1", "kubernetes.*.*.*.clusters.*", SubscriptionFilter::any())
            .unwrap();

        registry.remove_owner("conn-1");
        // Only the test's own handle keeps the sink alive
        assert_eq!(Arc::strong_count(&sink), 1);
    }

    #[test]
    fn test_interest_counts_pinned_pairs() {
        let registry = SubscriptionRegistry::new();
        let pinned = SubscriptionFilter::any()
            .with_credential_ids(["cred-1"])
            .with_regions(["us-east-1", "eu-west-1"]);

        for owner in ["a", "b"] {
            registry
                .connect(owner, Arc::new(RecordingSink::default()))
                .unwrap();
            registry
                .sync_subscriptions(
                    owner,
                    ["kubernetes.*.*.*.clusters.*", "kubernetes.*.*.*.nodegroups.*"],
                    &pinned,
                )
                .unwrap();
        }
        registry
            .connect("unpinned", Arc::new(RecordingSink::default()))
            .unwrap();
        registry
            .subscribe("unpinned", "kubernetes.*.*.*.clusters.*", SubscriptionFilter::any())
            .unwrap();

        let interest = registry.interest(ResourceFamily::Kubernetes);
        assert_eq!(interest.len(), 2);
        assert_eq!(interest[&("cred-1".to_string(), "us-east-1".to_string())], 2);
        assert!(registry.interest(ResourceFamily::Network).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_owner_races_with_dispatch() {
        const PUBLISHERS: usize = 4;
        const CYCLES: usize = 200;

        let registry = SubscriptionRegistry::new();
        let stop = Arc::new(AtomicBool::new(false));

        let mut publishers = Vec::new();
        for _ in 0..PUBLISHERS {
            let registry = registry.clone();
            let stop = stop.clone();
            publishers.push(tokio::spawn(async move {
                let event = event(AWS_CREATED, &[("region", "us-east-1")]);
                while !stop.load(Ordering::Relaxed) {
                    registry.dispatch(&event);
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut sinks = Vec::new();
        for cycle in 0..CYCLES {
            let owner = format!("conn-{}", cycle % 8);
            let sink = Arc::new(RecordingSink::default());
            registry.connect(owner.as_str(), sink.clone()).unwrap();
            registry
                .sync_subscriptions(
                    owner.as_str(),
                    ["kubernetes.aws.*.*.clusters.*", "kubernetes.*.*.*.*.created"],
                    &SubscriptionFilter::any(),
                )
                .unwrap();
            tokio::task::yield_now().await;

            registry.remove_owner(owner.as_str());
            sink.removed.store(true, Ordering::SeqCst);
            sinks.push(sink);
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop.store(true, Ordering::Relaxed);
        for handle in publishers {
            handle.await.unwrap();
        }

        for sink in &sinks {
            assert_eq!(sink.late_deliveries.load(Ordering::SeqCst), 0);
        }
        assert_eq!(registry.observer_count(), 0);
        assert_eq!(registry.pattern_count(), 0);
    }
}
