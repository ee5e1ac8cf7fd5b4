//! Grab path benchmarks.
//!
//! Measures the in-process overhead of the decision path and the persister
//! against the in-memory fakes, i.e. everything except network round trips:
//! - grab decision (granted and out-of-stock paths)
//! - event envelope encode/decode
//! - persister batch write
//!
//! Run with: `cargo bench -p flashgrab-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use chrono::Utc;
use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use flashgrab_core::environment::SystemClock;
use flashgrab_core::event::{PipelineEvent, SerializedEvent};
use flashgrab_core::event_channel::EventChannel;
use flashgrab_core::types::{EventId, GrabEvent, Outcome, ResourceId, UserId};
use flashgrab_runtime::gateway::{DecisionGateway, GatewayConfig};
use flashgrab_runtime::persister::{Persister, PersisterConfig};
use flashgrab_runtime::publisher::{EventPublisher, PublisherConfig};
use flashgrab_testing::{
    InMemoryCounterStore, InMemoryDeadLetterQueue, InMemoryEventChannel, InMemoryLedger,
};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn grab_event(user: u64) -> PipelineEvent {
    PipelineEvent::Grab(GrabEvent {
        event_id: EventId::new(),
        user_id: UserId::new(format!("user-{user}")),
        resource_id: ResourceId::new("coupon"),
        outcome: Outcome::Granted,
        stock_snapshot: 0,
        occurred_at: Utc::now(),
    })
}

fn gateway(
    runtime: &tokio::runtime::Runtime,
    store: &InMemoryCounterStore,
    duplicate_protection: bool,
) -> (DecisionGateway, broadcast::Sender<()>) {
    let (shutdown, rx) = broadcast::channel(1);
    let channel = Arc::new(InMemoryEventChannel::new());
    let (publisher, _task) = runtime.block_on(async {
        EventPublisher::spawn(channel, PublisherConfig::new("bench").with_buffer(1 << 20), rx)
    });
    let config = GatewayConfig {
        duplicate_protection,
        ..GatewayConfig::default()
    };
    (
        DecisionGateway::new(Arc::new(store.clone()), publisher, Arc::new(SystemClock), config),
        shutdown,
    )
}

/// Benchmark a single grab decision
fn benchmark_grab_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("grab_decision");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();
    let resource = ResourceId::new("coupon");

    group.bench_function("granted_with_duplicate_marker", |b| {
        let store = InMemoryCounterStore::new();
        store.seed(&resource, i64::MAX);
        let (gateway, _shutdown) = gateway(&runtime, &store, true);
        let next = AtomicU64::new(0);

        b.to_async(&runtime).iter(|| async {
            let user = UserId::new(format!("user-{}", next.fetch_add(1, Ordering::Relaxed)));
            let _ = black_box(gateway.grab(&user, &resource).await);
        });
    });

    group.bench_function("out_of_stock", |b| {
        let store = InMemoryCounterStore::new();
        store.seed(&resource, 0);
        let (gateway, _shutdown) = gateway(&runtime, &store, false);
        let user = UserId::new("user");

        b.to_async(&runtime).iter(|| async {
            let _ = black_box(gateway.grab(&user, &resource).await);
        });
    });

    group.finish();
}

/// Benchmark envelope encoding and decoding
fn benchmark_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    group.throughput(Throughput::Elements(1));
    let event = grab_event(1);
    let envelope = SerializedEvent::from_event(&event).expect("encode");

    group.bench_function("encode", |b| {
        b.iter(|| SerializedEvent::from_event(black_box(&event)));
    });
    group.bench_function("decode", |b| {
        b.iter(|| PipelineEvent::decode(black_box(&envelope)));
    });

    group.finish();
}

/// Benchmark one persister batch against the in-memory ledger
fn benchmark_persister_batch(c: &mut Criterion) {
    const BATCH: u64 = 100;
    let mut group = c.benchmark_group("persister");
    group.throughput(Throughput::Elements(BATCH));
    let runtime = runtime();

    group.bench_function("batch_of_100", |b| {
        b.to_async(&runtime).iter_batched(
            || {
                let channel = InMemoryEventChannel::new();
                let persister = Persister::new(
                    Arc::new(channel.clone()),
                    Arc::new(InMemoryLedger::new()),
                    Arc::new(InMemoryDeadLetterQueue::new()),
                    PersisterConfig::new("bench"),
                );
                (channel, persister)
            },
            |(channel, persister)| async move {
                for user in 0..BATCH {
                    let envelope = SerializedEvent::from_event(&grab_event(user)).expect("encode");
                    channel.publish("bench", &envelope).await.expect("publish");
                }
                let stream = channel.subscribe("bench").await.expect("subscribe");
                let deliveries: Vec<_> = stream
                    .take(usize::try_from(BATCH).expect("batch fits"))
                    .filter_map(|d| async move { d.ok() })
                    .collect()
                    .await;
                black_box(persister.process_batch(deliveries).await);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_grab_decision,
    benchmark_envelope,
    benchmark_persister_batch,
);
criterion_main!(benches);
