//! End-to-end properties of the grab pipeline against the in-memory stores.
//!
//! Gateway → publisher → channel → persister → ledger, plus the reconciler.

#![allow(clippy::unwrap_used, clippy::panic)]

use flashgrab_core::event::{PipelineEvent, SerializedEvent};
use flashgrab_core::event_channel::EventChannel;
use flashgrab_core::ledger::Ledger;
use flashgrab_core::types::{DenialReason, EventId, GrabEvent, Outcome, ResourceId, UserId};
use flashgrab_runtime::gateway::{DecisionGateway, GatewayConfig, GrabResponse};
use flashgrab_runtime::persister::{Persister, PersisterConfig};
use flashgrab_runtime::publisher::{EventPublisher, PublisherConfig};
use flashgrab_runtime::reconciler::{Reconciler, ReconcilerConfig};
use flashgrab_runtime::retry::RetryPolicy;
use flashgrab_testing::{
    InMemoryCounterStore, InMemoryDeadLetterQueue, InMemoryEventChannel, InMemoryLedger,
    helpers, properties, test_clock,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const TOPIC: &str = "flashgrab-events";

struct Pipeline {
    counter: InMemoryCounterStore,
    channel: InMemoryEventChannel,
    ledger: InMemoryLedger,
    gateway: DecisionGateway,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    fn start(resource: &str, stock: i64, buffer: usize) -> Self {
        helpers::init_tracing();
        let counter = InMemoryCounterStore::new();
        counter.seed(&ResourceId::new(resource), stock);
        let channel = InMemoryEventChannel::new();
        let ledger = InMemoryLedger::with_stock(&[(resource, stock)]);
        let (shutdown, _) = broadcast::channel(1);

        let fast = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(10))
            .build();
        let (publisher, publisher_task) = EventPublisher::spawn(
            Arc::new(channel.clone()),
            PublisherConfig::new(TOPIC)
                .with_buffer(buffer)
                .with_retry(fast.clone()),
            shutdown.subscribe(),
        );
        let persister = Persister::new(
            Arc::new(channel.clone()),
            Arc::new(ledger.clone()),
            Arc::new(InMemoryDeadLetterQueue::new()),
            PersisterConfig::new(TOPIC)
                .with_batch_size(16)
                .with_batch_linger(Duration::from_millis(2))
                .with_retry(fast)
                .with_reconnect_delay(Duration::from_millis(5)),
        );
        let persister_task = persister.spawn(shutdown.subscribe());

        let gateway = DecisionGateway::new(
            Arc::new(counter.clone()),
            publisher,
            Arc::new(test_clock()),
            GatewayConfig::default(),
        );

        Self {
            counter,
            channel,
            ledger,
            gateway,
            shutdown,
            tasks: vec![publisher_task, persister_task],
        }
    }

    async fn grab_concurrently(&self, grabs: Vec<(String, String)>) -> Vec<GrabResponse> {
        let handles: Vec<_> = grabs
            .into_iter()
            .map(|(user, resource)| {
                let gateway = self.gateway.clone();
                tokio::spawn(async move {
                    gateway
                        .grab(&UserId::new(user), &ResourceId::new(resource))
                        .await
                })
            })
            .collect();

        let mut responses = Vec::with_capacity(handles.len());
        for handle in handles {
            responses.push(handle.await.unwrap().unwrap());
        }
        responses
    }

    async fn wait_for_rows(&self, rows: usize) {
        for _ in 0..1000 {
            if self.ledger.grab_event_count() >= rows {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "ledger holds {} of {rows} grab rows",
            self.ledger.grab_event_count()
        );
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

fn granted(responses: &[GrabResponse]) -> Vec<&GrabResponse> {
    responses.iter().filter(|r| r.outcome.is_granted()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

    #[test]
    fn grants_never_exceed_stock((stock, requests) in properties::stock_and_requests(20, 40)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let (mut remaining, counter_after) = runtime.block_on(async {
            let pipeline = Pipeline::start("coupon", stock, 1024);
            let grabs = (0..requests)
                .map(|i| (format!("user-{i}"), "coupon".to_string()))
                .collect();
            let responses = pipeline.grab_concurrently(grabs).await;
            let remaining: Vec<i64> = granted(&responses)
                .iter()
                .map(|r| r.remaining_stock)
                .collect();
            let counter_after = pipeline.counter.value(&ResourceId::new("coupon"));
            pipeline.stop().await;
            (remaining, counter_after)
        });

        let expected_grants = stock.min(i64::try_from(requests).unwrap());
        prop_assert_eq!(i64::try_from(remaining.len()).unwrap(), expected_grants);

        // Each granted call saw a distinct unit: S-1, S-2, ..., S-grants.
        remaining.sort_unstable();
        let expected: Vec<i64> = (stock - expected_grants..stock).collect();
        prop_assert_eq!(remaining, expected);
        prop_assert_eq!(counter_after, Some(stock - expected_grants));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_units_five_users() {
    let pipeline = Pipeline::start("coupon-101", 3, 1024);
    let grabs = (1..=5)
        .map(|i| (format!("user-{i}"), "coupon-101".to_string()))
        .collect();
    let responses = pipeline.grab_concurrently(grabs).await;

    let mut remaining: Vec<i64> = granted(&responses).iter().map(|r| r.remaining_stock).collect();
    remaining.sort_unstable();
    assert_eq!(remaining, vec![0, 1, 2]);

    let out_of_stock = responses
        .iter()
        .filter(|r| r.outcome == Outcome::Denied(DenialReason::OutOfStock))
        .count();
    assert_eq!(out_of_stock, 2);

    pipeline.wait_for_rows(5).await;
    let stats = pipeline.ledger.system_stats().await.unwrap();
    assert_eq!(stats.successful_grants, 3);
    assert_eq!(stats.failed_attempts, 2);
    assert_eq!(stats.distinct_users, 5);
    assert_eq!(pipeline.ledger.aggregate_count(), 5);
    pipeline.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_grant_per_user() {
    let pipeline = Pipeline::start("coupon", 10, 1024);
    let grabs = (0..25)
        .map(|_| ("same-user".to_string(), "coupon".to_string()))
        .collect();
    let responses = pipeline.grab_concurrently(grabs).await;

    assert_eq!(granted(&responses).len(), 1);
    assert!(
        responses
            .iter()
            .filter(|r| !r.outcome.is_granted())
            .all(|r| r.outcome.reason().is_some())
    );
    // Every losing attempt handed its unit back.
    assert_eq!(pipeline.counter.value(&ResourceId::new("coupon")), Some(9));
    pipeline.stop().await;
}

#[tokio::test]
async fn redelivered_event_is_persisted_once() {
    let pipeline = Pipeline::start("coupon", 5, 16);
    let envelope = SerializedEvent::from_event(&PipelineEvent::Grab(GrabEvent {
        event_id: EventId::new(),
        user_id: UserId::new("alice"),
        resource_id: ResourceId::new("coupon"),
        outcome: Outcome::Granted,
        stock_snapshot: 4,
        occurred_at: chrono::Utc::now(),
    }))
    .unwrap();

    for _ in 0..4 {
        pipeline.channel.publish(TOPIC, &envelope).await.unwrap();
    }
    for _ in 0..500 {
        if pipeline.channel.acked() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(pipeline.channel.acked(), 4);
    assert_eq!(pipeline.ledger.grab_event_count(), 1);
    let aggregate = pipeline
        .ledger
        .user_aggregate(&UserId::new("alice"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.total_attempts, 1);
    assert_eq!(aggregate.successful_grants, 1);
    pipeline.stop().await;
}

#[tokio::test]
async fn reconcile_restores_ledger_figure() {
    let pipeline = Pipeline::start("coupon", 10, 64);
    let grabs = (0..4)
        .map(|i| (format!("user-{i}"), "coupon".to_string()))
        .collect();
    pipeline.grab_concurrently(grabs).await;
    pipeline.wait_for_rows(4).await;

    let resource = ResourceId::new("coupon");
    let reconciler = Reconciler::new(
        Arc::new(pipeline.counter.clone()),
        Arc::new(pipeline.ledger.clone()),
        Arc::new(test_clock()),
        ReconcilerConfig {
            confirm_upward: false,
            ..ReconcilerConfig::default()
        },
    );

    for forced in [42, 0] {
        pipeline.counter.seed(&resource, forced);
        let report = reconciler.reconcile(&resource).await.unwrap();
        assert!(report.corrected);
        assert_eq!(pipeline.counter.value(&resource), Some(6));
    }

    pipeline.counter.forget(&resource);
    reconciler.reconcile(&resource).await.unwrap();
    assert_eq!(pipeline.counter.value(&resource), Some(6));
    assert_eq!(pipeline.ledger.drift_log().len(), 3);
    pipeline.stop().await;
}

#[tokio::test]
async fn decisions_complete_while_channel_is_down() {
    let pipeline = Pipeline::start("coupon", 100, 256);
    pipeline.channel.set_unavailable(true);

    let grabs = (0..30)
        .map(|i| (format!("user-{i}"), "coupon".to_string()))
        .collect();
    let responses = tokio::time::timeout(
        Duration::from_secs(1),
        pipeline.grab_concurrently(grabs),
    )
    .await
    .unwrap();
    assert_eq!(granted(&responses).len(), 30);
    assert!(responses.iter().all(|r| r.event_enqueued));
    assert_eq!(pipeline.ledger.grab_event_count(), 0);

    pipeline.channel.set_unavailable(false);
    pipeline.wait_for_rows(30).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pipeline.ledger.grab_event_count(), 30);
    pipeline.stop().await;
}

#[tokio::test]
async fn saturated_buffer_still_answers() {
    let pipeline = Pipeline::start("coupon", 100, 2);
    pipeline.channel.set_unavailable(true);

    let grabs = (0..20)
        .map(|i| (format!("user-{i}"), "coupon".to_string()))
        .collect();
    let responses = pipeline.grab_concurrently(grabs).await;

    assert_eq!(granted(&responses).len(), 20);
    assert!(responses.iter().any(|r| !r.event_enqueued));
    pipeline.stop().await;
}
