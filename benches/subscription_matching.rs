//! Benchmark for topic matching and event fan-out
//!
//! Target: 100K dispatches/sec with 1K observers registered

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use multicloud_orchestrator::domain::ports::{DeliveryOutcome, EventSink};
use multicloud_orchestrator::events::{Event, EventPayload, SubscriptionFilter, SubscriptionRegistry};
use multicloud_orchestrator::topic_matches;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const TOPIC: &str = "kubernetes.aws.cred-0042.us-east-1.clusters.created";

#[derive(Default)]
struct CountingSink {
    delivered: AtomicU64,
}

impl EventSink for CountingSink {
    fn deliver(&self, _event: Arc<Event>) -> DeliveryOutcome {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        DeliveryOutcome::Delivered
    }
}

fn event() -> Arc<Event> {
    let mut payload = EventPayload::new();
    payload.insert("provider".to_string(), json!("aws"));
    payload.insert("credential_id".to_string(), json!("cred-0042"));
    payload.insert("region".to_string(), json!("us-east-1"));
    Arc::new(Event::from_topic(TOPIC, payload))
}

fn bench_topic_matches(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_matching");
    group.throughput(Throughput::Elements(1));

    for (name, pattern) in [
        ("literal", TOPIC),
        ("wildcards", "kubernetes.*.*.*.clusters.*"),
        ("length_mismatch", "kubernetes.aws.*.clusters.created"),
        ("early_reject", "network.*.*.*.*.*"),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| topic_matches(black_box(pattern), black_box(TOPIC)));
        });
    }

    group.finish();
}

fn bench_dispatch_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    for observers in [10usize, 100, 1000] {
        let registry = SubscriptionRegistry::new();
        for i in 0..observers {
            let owner = format!("conn-{}", i);
            registry
                .connect(owner.as_str(), Arc::new(CountingSink::default()))
                .expect("connect");

            // A quarter watch this credential, the rest something else
            let filter = SubscriptionFilter::any()
                .with_credential_ids([format!("cred-{:04}", if i % 4 == 0 { 42 } else { i })]);
            registry
                .sync_subscriptions(
                    owner.as_str(),
                    ["kubernetes.aws.*.*.clusters.*", "network.*.*.*.*.*"],
                    &filter,
                )
                .expect("sync");
        }

        let event = event();
        group.bench_with_input(BenchmarkId::from_parameter(observers), &observers, |b, _| {
            b.iter(|| registry.dispatch(black_box(&event)));
        });
    }

    group.finish();
}

fn bench_sync_subscriptions(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_subscriptions");
    group.throughput(Throughput::Elements(1));

    let registry = SubscriptionRegistry::new();
    registry
        .connect("conn-1", Arc::new(CountingSink::default()))
        .expect("connect");
    let filter = SubscriptionFilter::any();
    let a = ["kubernetes.*.*.*.clusters.*", "network.*.*.*.vpcs.*"];
    let b_set = ["network.*.*.*.vpcs.*", "network.*.*.*.subnets.*"];

    group.bench_function("noop", |b| {
        registry.sync_subscriptions("conn-1", a, &filter).expect("sync");
        b.iter(|| registry.sync_subscriptions("conn-1", black_box(a), &filter));
    });

    group.bench_function("alternate", |b| {
        let mut flip = false;
        b.iter(|| {
            flip = !flip;
            let required = if flip { a } else { b_set };
            registry.sync_subscriptions("conn-1", black_box(required), &filter)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_topic_matches,
    bench_dispatch_fan_out,
    bench_sync_subscriptions,
);
criterion_main!(benches);
