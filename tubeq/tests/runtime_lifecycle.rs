//! Spawned dispatcher loop: start, error backoff, events and graceful
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use tubeq::*;
use tubeq_testkit::{InMemoryBroker, MockHandler, Op, TestHarness};

async fn wait_for_calls(handler: &MockHandler, expected: usize) {
    timeout(Duration::from_secs(5), async {
        while handler.call_count() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("handler was not called in time");
}

fn looping_worker() -> WorkerConfig {
    WorkerConfig::new("loop")
        .with_reserve_timeout(1)
        .with_error_backoff(10)
        .with_shutdown_timeout(5)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_started_dispatcher_processes_and_shuts_down() {
    let handler = MockHandler::new();
    let harness = TestHarness::new(&[("A", handler.clone())]);
    let dispatcher = Arc::new(
        harness
            .dispatcher_builder()
            .with_worker_config(looping_worker())
            .build()
            .unwrap(),
    );

    dispatcher.start().await.unwrap();
    let id = harness
        .producer()
        .push_default("A", &json!({ "n": 1 }))
        .await
        .unwrap();
    wait_for_calls(&handler, 1).await;

    let result = timeout(Duration::from_secs(5), dispatcher.shutdown()).await;
    assert!(result.is_ok(), "shutdown did not complete within 5 seconds");
    result.unwrap().unwrap();
    assert!(dispatcher.shutdown_token().is_cancelled());

    let ops = harness.broker.ops();
    assert!(ops.contains(&Op::Watch { tube: "A".into() }));
    assert!(ops.contains(&Op::Ignore { tube: DEFAULT_TUBE.into() }));
    assert!(ops.contains(&Op::Delete { id }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_twice_is_rejected() {
    let harness = TestHarness::new(&[("A", MockHandler::new())]);
    let dispatcher = Arc::new(
        harness
            .dispatcher_builder()
            .with_worker_config(looping_worker())
            .build()
            .unwrap(),
    );

    dispatcher.start().await.unwrap();
    assert!(matches!(dispatcher.start().await, Err(QueueError::Config(_))));
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_survives_broker_errors() {
    let handler = MockHandler::new();
    let harness = TestHarness::new(&[("A", handler.clone())]);
    let dispatcher = Arc::new(
        harness
            .dispatcher_builder()
            .with_worker_config(looping_worker())
            .build()
            .unwrap(),
    );
    dispatcher.prepare().await.unwrap();
    harness
        .producer()
        .push_default("A", &json!({ "n": 1 }))
        .await
        .unwrap();

    harness.broker.fail_next(3);
    let token = dispatcher.shutdown_token();
    let looping = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let token = token.clone();
        async move { dispatcher.run(token).await }
    });

    wait_for_calls(&handler, 1).await;
    token.cancel();
    timeout(Duration::from_secs(5), looping).await.unwrap().unwrap();
    assert_eq!(harness.broker.job_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_timeout_polls_are_paced() {
    let harness = TestHarness::new(&[("A", MockHandler::new())]);
    // Empty reserves return immediately, like `reserve-with-timeout 0`.
    let broker: InMemoryBroker = harness.broker.clone().with_idle_wait(Duration::ZERO);
    let dispatcher = Arc::new(
        harness
            .dispatcher_builder()
            .with_broker(Arc::new(broker.clone()))
            .with_worker_config(
                WorkerConfig::new("poll")
                    .with_reserve_timeout(0)
                    .with_error_backoff(50)
                    .with_shutdown_timeout(5),
            )
            .build()
            .unwrap(),
    );

    dispatcher.start().await.unwrap();
    let before = broker.call_count();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let polls = broker.call_count() - before;
    dispatcher.shutdown().await.unwrap();

    assert!(polls >= 1, "loop never polled");
    assert!(polls <= 10, "{polls} reserve calls in 200ms");
}

#[tokio::test]
async fn test_dispatch_publishes_lifecycle_events() {
    let harness = TestHarness::new(&[("A", MockHandler::new())]);
    let bus = Arc::new(InProcEventBus::new(16));
    let mut rx = bus.subscribe_jobs();
    let dispatcher = harness.dispatcher_builder().with_events(bus.clone()).build().unwrap();
    dispatcher.prepare().await.unwrap();

    let id = harness
        .producer()
        .push_default("A", &json!({ "n": 1 }))
        .await
        .unwrap();
    dispatcher.reserve_next().await.unwrap().unwrap();

    let reserved = rx.recv().await.unwrap();
    assert_eq!(reserved.job_id(), id);
    assert_eq!(reserved.payload, JobEventPayload::Reserved);

    let completed = rx.recv().await.unwrap();
    assert_eq!(completed.payload, JobEventPayload::Completed);
    assert_eq!(completed.meta.tube.as_deref(), Some("A"));
}

#[tokio::test]
async fn test_shutdown_without_start_is_ok() {
    let harness = TestHarness::new(&[("A", MockHandler::new())]);
    let dispatcher = harness.dispatcher();
    dispatcher.shutdown().await.unwrap();
    assert!(dispatcher.shutdown_token().is_cancelled());
}
