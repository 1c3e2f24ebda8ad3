//! Dispatcher integration tests against the in-memory broker.
//!
//! Covers the settle paths of a reserved job: completion, retry with the
//! plot's delays, burial, and poison-message discard.

use std::sync::Arc;

use serde_json::json;
use tubeq::*;
use tubeq_testkit::{envelope_body, payload, InMemoryBroker, MockHandler, Op, Scripted, TestHarness};

async fn put_raw(broker: &InMemoryBroker, tube: &str, body: &[u8]) -> JobId {
    broker
        .put(tube, body, JobPriority::DEFAULT, 0, 60)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_success_deletes_job() {
    let handler = MockHandler::new();
    let harness = TestHarness::new(&[("A", handler.clone())]);
    let dispatcher = harness.dispatcher();
    dispatcher.prepare().await.unwrap();

    let id = harness
        .producer()
        .push_default("A", &json!({ "amount": 5 }))
        .await
        .unwrap();

    let report = dispatcher.reserve_next().await.unwrap().unwrap();
    assert_eq!(report.job_id, id);
    assert_eq!(report.tube.as_deref(), Some("A"));
    assert_eq!(report.outcome, DispatchOutcome::Completed);

    assert_eq!(handler.calls(), vec![payload(json!({ "amount": 5 }))]);
    assert!(matches!(harness.broker.peek(id).await, Err(QueueError::JobNotFound(_))));
    assert!(harness.admin().peek_next_ready("A").await.unwrap().is_none());
    assert!(harness.admin().peek_next_delayed("A").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failures_walk_the_plot_then_bury() {
    let handler = MockHandler::failing();
    let harness = TestHarness::new(&[("A", handler.clone())]).with_plot(vec![10, 30]);
    let dispatcher = harness.dispatcher();
    dispatcher.prepare().await.unwrap();
    let id = harness
        .producer()
        .push_default("A", &json!({ "amount": 5 }))
        .await
        .unwrap();

    let first = dispatcher.reserve_next().await.unwrap().unwrap();
    assert_eq!(
        first.outcome,
        DispatchOutcome::Released {
            delay_secs: 10,
            reserve_count: 0
        }
    );
    assert_eq!(harness.broker.job_state(id), Some(JobState::Delayed));
    assert!(dispatcher.reserve_next().await.unwrap().is_none());

    harness.broker.advance(10);
    let second = dispatcher.reserve_next().await.unwrap().unwrap();
    assert_eq!(
        second.outcome,
        DispatchOutcome::Released {
            delay_secs: 30,
            reserve_count: 1
        }
    );

    harness.broker.advance(30);
    let third = dispatcher.reserve_next().await.unwrap().unwrap();
    assert_eq!(third.outcome, DispatchOutcome::Buried { reserve_count: 2 });
    assert_eq!(harness.broker.job_state(id), Some(JobState::Buried));

    harness.broker.advance(3600);
    assert!(dispatcher.reserve_next().await.unwrap().is_none());
    handler.assert_call_count_eq(3);

    let releases: Vec<_> = harness
        .broker
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            Op::Release { delay_secs, .. } => Some(delay_secs),
            _ => None,
        })
        .collect();
    assert_eq!(releases, vec![10, 30]);

    assert!(harness.admin().kick(id).await.unwrap());
    assert_eq!(harness.broker.job_state(id), Some(JobState::Ready));
}

#[tokio::test]
async fn test_unroutable_job_is_deleted_without_retry() {
    let handler = MockHandler::new();
    let harness = TestHarness::new(&[("A", handler.clone())]).with_plot(vec![10, 30]);
    let dispatcher = harness.dispatcher();
    dispatcher.prepare().await.unwrap();

    let id = put_raw(&harness.broker, "A", &envelope_body("GHOST", json!({ "amount": 5 }))).await;
    harness.broker.clear_ops();

    let report = dispatcher.reserve_next().await.unwrap().unwrap();
    match &report.outcome {
        DispatchOutcome::Discarded { reason } => assert!(reason.contains("tube not found"), "{reason}"),
        other => panic!("expected discard, got {other:?}"),
    }
    assert_eq!(report.tube, None);
    harness.broker.assert_ops_eq(&[Op::Reserve { id }, Op::Delete { id }]);
    handler.assert_call_count_eq(0);
}

#[tokio::test]
async fn test_malformed_bodies_are_discarded() {
    let harness = TestHarness::new(&[("A", MockHandler::new())]);
    let dispatcher = harness.dispatcher();
    dispatcher.prepare().await.unwrap();

    put_raw(&harness.broker, "A", b"not json at all").await;
    put_raw(&harness.broker, "A", br#"{"data":{"amount":5}}"#).await;

    for _ in 0..2 {
        let report = dispatcher.reserve_next().await.unwrap().unwrap();
        assert_eq!(report.outcome.as_str(), "discarded");
    }
    assert_eq!(harness.broker.job_count(), 0);
}

#[tokio::test]
async fn test_tag_without_bound_handler_is_discarded() {
    let broker = InMemoryBroker::new();
    let handler = MockHandler::new();
    let registry = TubeRegistry::from_definitions([
        TubeDefinition::new("A", "A-consumer", "", Some(Arc::new(handler.clone()) as Arc<dyn TubeHandler>)),
        TubeDefinition::new("B", "producer-only", "", None),
    ])
    .unwrap();
    let dispatcher = ConsumerDispatcherBuilder::new()
        .with_broker(Arc::new(broker.clone()))
        .with_registry(Arc::new(registry))
        .with_worker_config(WorkerConfig::new("t").with_reserve_timeout(0))
        .build()
        .unwrap();
    assert_eq!(dispatcher.watched().iter().collect::<Vec<_>>(), vec!["A"]);
    dispatcher.prepare().await.unwrap();

    let id = put_raw(&broker, "A", &envelope_body("B", json!({ "x": 1 }))).await;
    let report = dispatcher.reserve_next().await.unwrap().unwrap();

    assert_eq!(report.tube.as_deref(), Some("B"));
    match report.outcome {
        DispatchOutcome::Discarded { reason } => assert!(reason.contains("no handler"), "{reason}"),
        other => panic!("expected discard, got {other:?}"),
    }
    assert_eq!(broker.job_state(id), None);
    handler.assert_call_count_eq(0);
}

#[tokio::test]
async fn test_poison_tube_keeps_a_copy() {
    let harness = TestHarness::new(&[("A", MockHandler::new())]);
    let dispatcher = harness.dispatcher_builder().with_poison_tube("poison").build().unwrap();
    dispatcher.prepare().await.unwrap();

    let body = envelope_body("GHOST", json!({ "amount": 5 }));
    let id = put_raw(&harness.broker, "A", &body).await;
    dispatcher.reserve_next().await.unwrap().unwrap();

    assert_eq!(harness.broker.job_state(id), None);
    let copy = harness.admin().peek_next_ready("POISON").await.unwrap().unwrap();
    assert_eq!(copy.stats.tube, "POISON");
    assert_eq!(copy.data.and_then(|e| e.tag), Some("GHOST".to_string()));
    assert_eq!(harness.broker.count("POISON", JobState::Ready), 1);
}

#[tokio::test]
async fn test_handler_error_panic_and_bad_data_are_retried() {
    let handler = MockHandler::new().with_script([
        Scripted::Error("downstream timeout".into()),
        Scripted::Panic("boom".into()),
    ]);
    let harness = TestHarness::new(&[("A", handler.clone())]);
    let dispatcher = harness.dispatcher();
    dispatcher.prepare().await.unwrap();

    let id = harness
        .producer()
        .push_default("A", &json!({ "n": 1 }))
        .await
        .unwrap();

    let errored = dispatcher.reserve_next().await.unwrap().unwrap();
    assert_eq!(errored.outcome.as_str(), "released");

    harness.broker.advance(10);
    let panicked = dispatcher.reserve_next().await.unwrap().unwrap();
    assert_eq!(
        panicked.outcome,
        DispatchOutcome::Released {
            delay_secs: 30,
            reserve_count: 1
        }
    );

    harness.broker.advance(30);
    let completed = dispatcher.reserve_next().await.unwrap().unwrap();
    assert_eq!(completed.outcome, DispatchOutcome::Completed);
    assert_eq!(harness.broker.job_state(id), None);

    let bad = put_raw(&harness.broker, "A", br#"{"tag":"A","data":[1,2,3]}"#).await;
    let report = dispatcher.reserve_next().await.unwrap().unwrap();
    assert_eq!(report.job_id, bad);
    assert_eq!(report.outcome.as_str(), "released");
    handler.assert_call_count_eq(3);
}

#[tokio::test]
async fn test_non_success_code_is_a_failure() {
    let handler = MockHandler::with_fallback(Scripted::Fail(7));
    let harness = TestHarness::new(&[("A", handler)]).with_plot(vec![5]);
    let dispatcher = harness.dispatcher();
    dispatcher.prepare().await.unwrap();
    harness
        .producer()
        .push_default("A", &json!({ "n": 1 }))
        .await
        .unwrap();

    assert_eq!(
        dispatcher.reserve_next().await.unwrap().unwrap().outcome,
        DispatchOutcome::Released {
            delay_secs: 5,
            reserve_count: 0
        }
    );
    harness.broker.advance(5);
    assert_eq!(
        dispatcher.reserve_next().await.unwrap().unwrap().outcome,
        DispatchOutcome::Buried { reserve_count: 1 }
    );
}

#[tokio::test]
async fn test_per_tube_plot_overrides_default() {
    let harness = TestHarness::new(&[("A", MockHandler::failing()), ("B", MockHandler::failing())]);
    let retry = RetryPolicy::new(RetryPlot::new(vec![10]).unwrap())
        .with_tube_plot("b", RetryPlot::new(vec![99, 100]).unwrap());
    let dispatcher = harness.dispatcher_builder().with_retry_policy(retry).build().unwrap();
    dispatcher.prepare().await.unwrap();

    let producer = harness.producer();
    producer.push_default("B", &json!({ "n": 1 })).await.unwrap();

    assert_eq!(
        dispatcher.reserve_next().await.unwrap().unwrap().outcome,
        DispatchOutcome::Released {
            delay_secs: 99,
            reserve_count: 0
        }
    );
}

#[tokio::test]
async fn test_prepare_watches_tubes_and_ignores_default() {
    let harness = TestHarness::new(&[("A", MockHandler::new()), ("B", MockHandler::new())]);
    let dispatcher = harness.dispatcher();

    assert_eq!(dispatcher.prepare().await.unwrap(), 2);
    let mut watched = harness.broker.list_watched_tubes().await.unwrap();
    watched.sort();
    assert_eq!(watched, vec!["A", "B"]);

    put_raw(&harness.broker, DEFAULT_TUBE, &envelope_body("A", json!({ "n": 1 }))).await;
    assert!(dispatcher.reserve_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_builder_rejects_unhandled_watch() {
    let harness = TestHarness::new(&[("A", MockHandler::new())]);

    let unknown = harness.dispatcher_builder().with_watch(["A", "MISSING"]).build();
    assert!(matches!(unknown, Err(QueueError::UnknownTube(ref t)) if t == "MISSING"));

    let registry = TubeRegistry::from_definitions([TubeDefinition::new("C", "none", "", None)]).unwrap();
    let unbound = ConsumerDispatcherBuilder::new()
        .with_broker(harness.broker_arc())
        .with_registry(Arc::new(registry))
        .with_watch(["c"])
        .build();
    assert!(matches!(unbound, Err(QueueError::HandlerMissing(ref t)) if t == "C"));

    let poison_watched = harness.dispatcher_builder().with_poison_tube("a").build();
    assert!(matches!(poison_watched, Err(QueueError::Config(_))));
}

#[tokio::test]
async fn test_broker_error_while_settling_is_reported() {
    let harness = TestHarness::new(&[("A", MockHandler::new())]);
    let dispatcher = harness.dispatcher();
    dispatcher.prepare().await.unwrap();
    let id = harness
        .producer()
        .push_default("A", &json!({ "n": 1 }))
        .await
        .unwrap();

    let job = harness
        .broker
        .reserve(std::time::Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    harness.broker.fail_next(1);
    let result = dispatcher.process(job).await;

    assert!(matches!(result, Err(QueueError::BrokerUnavailable(_))));
    assert_eq!(harness.broker.job_state(id), Some(JobState::Reserved));
}
