//! Reconciliation Sweep
//!
//! Pushes refreshed `list` snapshots to observers. Which scopes get swept is
//! derived from live subscriptions: every `(credential, region)` pair that
//! at least one observer pins in its filter is listed periodically, more
//! often when many observers are watching. Networks of every baseline
//! credential are also listed in its provider's default regions at low
//! priority, watched or not.

use crate::controlplane::orchestrator::ResourceOrchestrator;
use crate::error::{Error, Result};
use crate::events::{ResourceFamily, SubscriptionRegistry};
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Families with a `list` snapshot
const SWEPT_FAMILIES: [ResourceFamily; 2] = [ResourceFamily::Kubernetes, ResourceFamily::Network];

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub enabled: bool,
    /// Sweep interval for scopes with many observers
    pub high_interval_secs: u64,
    /// Sweep interval for every other observed scope
    pub medium_interval_secs: u64,
    /// Sweep interval for unwatched default regions of baseline credentials
    pub low_interval_secs: u64,
    /// Default regions per provider, listed at low priority
    pub low_priority_regions: BTreeMap<String, Vec<String>>,
    /// Observer count at which a scope becomes high priority
    pub high_priority_threshold: usize,
    /// How often the scheduler checks for due scopes
    pub tick_secs: u64,
    pub retry_initial_ms: u64,
    /// Give up on a scope for this round after this long
    pub retry_max_elapsed_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_interval_secs: 60,
            medium_interval_secs: 180,
            low_interval_secs: 600,
            low_priority_regions: default_low_priority_regions(),
            high_priority_threshold: 5,
            tick_secs: 5,
            retry_initial_ms: 500,
            retry_max_elapsed_ms: 30_000,
        }
    }
}

fn default_low_priority_regions() -> BTreeMap<String, Vec<String>> {
    let regions = |list: &[&str]| list.iter().map(|r| r.to_string()).collect();
    BTreeMap::from([
        (
            "aws".to_string(),
            regions(&["ap-northeast-2", "us-east-1", "us-west-2", "eu-west-1"]),
        ),
        (
            "gcp".to_string(),
            regions(&["asia-northeast3", "asia-northeast1", "us-central1", "europe-west1"]),
        ),
    ])
}

impl ReconcileConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    fn default_regions(&self, provider: &str) -> &[String] {
        self.low_priority_regions
            .get(&provider.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Credential whose default regions are swept even without observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineCredential {
    pub credential_id: String,
    pub provider: String,
}

impl BaselineCredential {
    pub fn new(credential_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            credential_id: credential_id.into(),
            provider: provider.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPriority {
    High,
    Medium,
    Low,
}

impl SweepPriority {
    /// `None` when nobody is watching
    pub fn from_subscribers(count: usize, high_threshold: usize) -> Option<Self> {
        match count {
            0 => None,
            n if n >= high_threshold => Some(SweepPriority::High),
            _ => Some(SweepPriority::Medium),
        }
    }

    pub fn interval(&self, config: &ReconcileConfig) -> Duration {
        match self {
            SweepPriority::High => Duration::from_secs(config.high_interval_secs),
            SweepPriority::Medium => Duration::from_secs(config.medium_interval_secs),
            SweepPriority::Low => Duration::from_secs(config.low_interval_secs),
        }
    }
}

/// Outcome of one scheduler pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub swept: usize,
    pub failed: usize,
    /// Observed scopes that were not due yet
    pub skipped: usize,
}

type ScopeKey = (ResourceFamily, String, String);

// =============================================================================
// Reconciler
// =============================================================================

pub struct Reconciler {
    config: ReconcileConfig,
    orchestrator: Arc<ResourceOrchestrator>,
    registry: Arc<SubscriptionRegistry>,
    baseline: Vec<BaselineCredential>,
    last_swept: Mutex<HashMap<ScopeKey, Instant>>,
    runtime: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcileConfig,
        orchestrator: Arc<ResourceOrchestrator>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Arc<Self> {
        Self::with_baseline(config, orchestrator, registry, Vec::new())
    }

    /// Reconciler that also sweeps the default regions of `baseline`
    pub fn with_baseline(
        config: ReconcileConfig,
        orchestrator: Arc<ResourceOrchestrator>,
        registry: Arc<SubscriptionRegistry>,
        baseline: Vec<BaselineCredential>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            orchestrator,
            registry,
            baseline,
            last_swept: Mutex::new(HashMap::new()),
            runtime: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Spawn the scheduler loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(Error::Conflict("reconciler is already running".to_string()));
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run(shutdown.clone()));
        *runtime = Some((shutdown, handle));

        info!(
            tick_secs = self.config.tick_secs,
            high_interval_secs = self.config.high_interval_secs,
            medium_interval_secs = self.config.medium_interval_secs,
            low_interval_secs = self.config.low_interval_secs,
            baseline = self.baseline.len(),
            "Reconciler started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        let Some((shutdown, handle)) = self.runtime.lock().take() else {
            return;
        };
        shutdown.cancel();
        if let Err(e) = handle.await {
            warn!("Reconciler loop ended abnormally: {}", e);
        }
        info!("Reconciler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                report = self.sweep_once() => {
                    if report.swept + report.failed > 0 {
                        debug!(
                            swept = report.swept,
                            failed = report.failed,
                            skipped = report.skipped,
                            "Reconcile pass finished"
                        );
                    }
                }
            }
        }
    }

    /// Sweep every observed or baseline scope that is due
    pub async fn sweep_once(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut observed = HashSet::new();
        let mut due = Vec::new();

        {
            let last_swept = self.last_swept.lock();
            let mut schedule = |key: ScopeKey, priority: SweepPriority| {
                let fresh = last_swept
                    .get(&key)
                    .is_some_and(|at| now.duration_since(*at) < priority.interval(&self.config));
                observed.insert(key.clone());
                if fresh {
                    report.skipped += 1;
                } else {
                    due.push(key);
                }
            };

            let mut watched = HashSet::new();
            for family in SWEPT_FAMILIES {
                for ((credential_id, region), count) in self.registry.interest(family) {
                    let Some(priority) =
                        SweepPriority::from_subscribers(count, self.config.high_priority_threshold)
                    else {
                        continue;
                    };
                    let key = (family, credential_id, region);
                    watched.insert(key.clone());
                    schedule(key, priority);
                }
            }

            // Watched scopes already run at a higher priority
            for credential in &self.baseline {
                for region in self.config.default_regions(&credential.provider) {
                    let key = (
                        ResourceFamily::Network,
                        credential.credential_id.clone(),
                        region.clone(),
                    );
                    if !watched.contains(&key) {
                        schedule(key, SweepPriority::Low);
                    }
                }
            }
        }

        {
            let mut last_swept = self.last_swept.lock();
            last_swept.retain(|key, _| observed.contains(key));
            for key in &due {
                last_swept.insert(key.clone(), now);
            }
        }

        let sweeps = due
            .iter()
            .map(|(family, credential_id, region)| self.sweep_scope(*family, credential_id, region));
        for (key, outcome) in due.iter().zip(futures::future::join_all(sweeps).await) {
            match outcome {
                Ok(count) => {
                    report.swept += 1;
                    debug!(family = %key.0, credential_id = %key.1, region = %key.2, count, "Published snapshot");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(family = %key.0, credential_id = %key.1, region = %key.2, "Snapshot failed: {}", e);
                }
            }
        }

        report
    }

    /// List one scope, retrying transient failures
    async fn sweep_scope(
        &self,
        family: ResourceFamily,
        credential_id: &str,
        region: &str,
    ) -> Result<usize> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.retry_initial_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.config.retry_max_elapsed_ms)))
            .build();
        let orchestrator = &self.orchestrator;

        backoff::future::retry(policy, || async move {
            let ctx = orchestrator.context();
            let listed = match family {
                ResourceFamily::Kubernetes => {
                    orchestrator
                        .publish_cluster_snapshot(&ctx, credential_id, region)
                        .await
                }
                _ => {
                    orchestrator
                        .publish_network_snapshot(&ctx, credential_id, region)
                        .await
                }
            };
            listed.map_err(|e| {
                if e.is_retryable() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::{Harness, MockAdapter, CREDENTIAL_ID};
    use crate::error::ErrorKind;
    use crate::events::{EventAction, SubscriptionFilter};

    fn fast_config() -> ReconcileConfig {
        ReconcileConfig {
            retry_initial_ms: 10,
            retry_max_elapsed_ms: 200,
            ..ReconcileConfig::default()
        }
    }

    fn reconciler(harness: &Harness) -> Arc<Reconciler> {
        Reconciler::new(
            fast_config(),
            harness.orchestrator.clone(),
            harness.bus.registry().clone(),
        )
    }

    fn watch(harness: &Harness, owner: &str, pattern: &str) {
        let filter = SubscriptionFilter::any()
            .with_credential_ids([CREDENTIAL_ID])
            .with_regions(["us-east-1"]);
        harness.bus.registry().subscribe(owner, pattern, filter).unwrap();
    }

    #[test]
    fn test_priority_from_subscribers() {
        assert_eq!(SweepPriority::from_subscribers(0, 5), None);
        assert_eq!(SweepPriority::from_subscribers(1, 5), Some(SweepPriority::Medium));
        assert_eq!(SweepPriority::from_subscribers(5, 5), Some(SweepPriority::High));

        let config = ReconcileConfig::default();
        assert_eq!(SweepPriority::High.interval(&config), Duration::from_secs(60));
        assert_eq!(SweepPriority::Medium.interval(&config), Duration::from_secs(180));
        assert_eq!(SweepPriority::Low.interval(&config), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_baseline_sweeps_default_regions_unwatched() {
        let harness = Harness::new(MockAdapter::aws_like());
        let config = ReconcileConfig {
            low_priority_regions: BTreeMap::from([(
                "aws".to_string(),
                vec!["us-east-1".to_string(), "eu-west-1".to_string()],
            )]),
            ..fast_config()
        };
        let reconciler = Reconciler::with_baseline(
            config,
            harness.orchestrator.clone(),
            harness.bus.registry().clone(),
            vec![BaselineCredential::new(CREDENTIAL_ID, "AWS")],
        );

        let report = reconciler.sweep_once().await;
        assert_eq!(report.swept, 2);
        assert_eq!(harness.adapter.call_count("list_networks"), 2);
        assert_eq!(harness.adapter.call_count("list_clusters"), 0);

        // Low interval has not elapsed
        let report = reconciler.sweep_once().await;
        assert_eq!(report, SweepReport { swept: 0, failed: 0, skipped: 2 });
        assert_eq!(reconciler.last_swept.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_watched_default_region_not_swept_twice() {
        let harness = Harness::new(MockAdapter::aws_like());
        let _watcher = harness.bus.connect("watcher").unwrap();
        watch(&harness, "watcher", "network.*.*.*.vpcs.*");

        let config = ReconcileConfig {
            low_priority_regions: BTreeMap::from([(
                "aws".to_string(),
                vec!["us-east-1".to_string()],
            )]),
            ..fast_config()
        };
        let reconciler = Reconciler::with_baseline(
            config,
            harness.orchestrator.clone(),
            harness.bus.registry().clone(),
            vec![BaselineCredential::new(CREDENTIAL_ID, "aws")],
        );

        assert_eq!(reconciler.sweep_once().await.swept, 1);
        assert_eq!(harness.adapter.call_count("list_networks"), 1);
    }

    #[tokio::test]
    async fn test_sweeps_only_observed_scopes() {
        let harness = Harness::new(MockAdapter::aws_like());
        let mut watcher = harness.bus.connect("watcher").unwrap();
        watch(&harness, "watcher", "kubernetes.aws.*.*.clusters.*");

        let reconciler = reconciler(&harness);
        let report = reconciler.sweep_once().await;
        assert_eq!(report.swept, 1);
        assert_eq!(harness.adapter.call_count("list_clusters"), 1);
        assert_eq!(harness.adapter.call_count("list_networks"), 0);

        let event = tokio::time::timeout(Duration::from_secs(1), watcher.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, "kubernetes.aws.cred-1.us-east-1.clusters.list");
        assert_eq!(event.action, EventAction::ListSync);

        // Not due again until the medium interval has passed
        let report = reconciler.sweep_once().await;
        assert_eq!(report, SweepReport { swept: 0, failed: 0, skipped: 1 });
    }

    #[tokio::test]
    async fn test_unobserved_scope_is_forgotten() {
        let harness = Harness::new(MockAdapter::aws_like());
        let _watcher = harness.bus.connect("watcher").unwrap();
        watch(&harness, "watcher", "network.*.*.*.vpcs.*");

        let reconciler = reconciler(&harness);
        assert_eq!(reconciler.sweep_once().await.swept, 1);

        harness.bus.registry().remove_owner("watcher");
        assert_eq!(reconciler.sweep_once().await, SweepReport::default());
        assert!(reconciler.last_swept.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let harness = Harness::new(MockAdapter::aws_like());
        harness.adapter.fail("list_clusters", ErrorKind::Unavailable);
        let _watcher = harness.bus.connect("watcher").unwrap();
        watch(&harness, "watcher", "kubernetes.*.*.*.*.*");

        let report = reconciler(&harness).sweep_once().await;
        assert_eq!(report.failed, 1);
        assert!(harness.adapter.call_count("list_clusters") > 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let harness = Harness::new(MockAdapter::aws_like());
        harness
            .adapter
            .fail("list_clusters", ErrorKind::PermissionDenied);
        let _watcher = harness.bus.connect("watcher").unwrap();
        watch(&harness, "watcher", "kubernetes.*.*.*.*.*");

        let report = reconciler(&harness).sweep_once().await;
        assert_eq!(report.failed, 1);
        assert_eq!(harness.adapter.call_count("list_clusters"), 1);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let harness = Harness::new(MockAdapter::aws_like());
        let reconciler = reconciler(&harness);

        reconciler.start().unwrap();
        assert!(reconciler.is_running());
        assert!(reconciler.start().is_err());

        reconciler.stop().await;
        assert!(!reconciler.is_running());
    }
}
