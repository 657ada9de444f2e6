//! Integration tests for the unit lifecycle driven by `SubAgentTracker`
//! over the container launch strategy.
//!
//! Validates:
//! - A zero exit completes the unit with `success = true`
//! - A non-zero exit fails the unit and records the exit code
//! - A unit that outlives its timeout ends `timed_out` and leaves no
//!   running container behind
//! - Cancellation of a running unit ends `cancelled`; cancelling a
//!   terminal unit is a no-op
//! - Launch failures surface synchronously and leave a queryable `failed`
//!   unit
//! - `wait` returns as soon as the unit finishes, not at its own timeout
//! - Event logs are ordered and end with exactly one `finished` event

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use subagent_runtime::models::container::{ContainerFilter, ContainerStatus};
use subagent_runtime::models::unit::{
    QueryType, UnitEventKind, UnitStatus, UnitView, WaitOutcome,
};
use subagent_runtime::sandbox::engine::UNIT_LABEL;
use subagent_runtime::AppError;

use super::test_helpers::{container_spec, FakeEngine, Harness, PaneScript, SETTLE};

async fn finished(harness: &Harness, unit_id: &str) -> subagent_runtime::models::unit::UnitResult {
    match harness.tracker.wait(unit_id, SETTLE).await.expect("wait") {
        WaitOutcome::Finished { result, .. } => result,
        WaitOutcome::TimedOut { status, .. } => panic!("unit still {status} after settle wait"),
    }
}

// ── Normal completion ────────────────────────────────────

#[tokio::test]
async fn zero_exit_completes_with_success() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["echo", "hello", "world"], Duration::from_secs(10)))
        .await
        .expect("spawn");

    let result = finished(&harness, &unit_id).await;
    assert_eq!(result.status, UnitStatus::Completed);
    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output, "hello world\n");
    assert!(result.error.is_none());

    let snapshot = harness.tracker.status(&unit_id).expect("status");
    assert_eq!(snapshot.status, UnitStatus::Completed);
    assert!(snapshot.ended_at.is_some());
    assert_eq!(snapshot.result.as_ref(), Some(&result));
    assert_eq!(harness.tracker.live_count(), 0);
}

#[tokio::test]
async fn wait_returns_promptly_after_completion() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["sleep", "50"], Duration::from_secs(10)))
        .await
        .expect("spawn");

    let started = Instant::now();
    let outcome = harness
        .tracker
        .wait(&unit_id, Duration::from_secs(5))
        .await
        .expect("wait");
    let elapsed = started.elapsed();

    let WaitOutcome::Finished { result, .. } = outcome else {
        panic!("unit should finish before the wait timeout");
    };
    assert_eq!(result.status, UnitStatus::Completed);
    assert!(
        elapsed < Duration::from_secs(1),
        "wait took {elapsed:?} for a 50ms unit"
    );
}

#[tokio::test]
async fn completed_container_is_removed_and_labelled() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["exit", "0"], Duration::from_secs(10)))
        .await
        .expect("spawn");
    let backing_id = harness
        .tracker
        .status(&unit_id)
        .expect("status")
        .backing_id
        .expect("backing id once running");
    finished(&harness, &unit_id).await;

    assert!(harness.engine.removed_ids().contains(&backing_id));
    assert!(harness.engine.running_ids().is_empty());

    let registry = harness.sandbox.runner().registry();
    let record = registry.get(&backing_id).await.expect("record");
    assert_eq!(record.status, ContainerStatus::Removed);
    assert_eq!(record.unit_id.as_deref(), Some(unit_id.as_str()));
}

#[tokio::test]
async fn container_carries_unit_label() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["sleep", "300"], Duration::from_secs(10)))
        .await
        .expect("spawn");
    let backing_id = harness
        .tracker
        .status(&unit_id)
        .expect("status")
        .backing_id
        .expect("backing id");

    let labels = harness.engine.labels_of(&backing_id);
    assert!(labels.contains(&(UNIT_LABEL.to_owned(), unit_id.clone())));
    finished(&harness, &unit_id).await;
}

#[tokio::test]
async fn nonzero_exit_fails_with_exit_code() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["exit", "3"], Duration::from_secs(10)))
        .await
        .expect("spawn");

    let result = finished(&harness, &unit_id).await;
    assert_eq!(result.status, UnitStatus::Failed);
    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.error.as_deref(), Some("process exited with code 3"));
}

#[tokio::test]
async fn exec_error_fails_unit() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["fail"], Duration::from_secs(10)))
        .await
        .expect("spawn");

    let result = finished(&harness, &unit_id).await;
    assert_eq!(result.status, UnitStatus::Failed);
    assert!(result.error.as_deref().unwrap_or_default().contains("exec exploded"));

    let running = harness
        .sandbox
        .runner()
        .registry()
        .list(&ContainerFilter::with_status(ContainerStatus::Running))
        .await
        .expect("list");
    assert!(running.is_empty());
}

// ── Timeout ──────────────────────────────────────────────

#[tokio::test]
async fn overrunning_unit_times_out_and_is_cleaned_up() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["sleep", "5000"], Duration::from_millis(100)))
        .await
        .expect("spawn");

    let result = finished(&harness, &unit_id).await;
    assert_eq!(result.status, UnitStatus::TimedOut);
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or_default().contains("timeout"));

    let registry = harness.sandbox.runner().registry();
    let running = registry
        .list(&ContainerFilter::with_status(ContainerStatus::Running))
        .await
        .expect("list");
    assert!(running.is_empty(), "no container may stay running after timeout");
    assert!(harness.engine.running_ids().is_empty());
}

// ── Wait ─────────────────────────────────────────────────

#[tokio::test]
async fn wait_timeout_leaves_unit_running() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["sleep", "300"], Duration::from_secs(10)))
        .await
        .expect("spawn");

    let early = harness
        .tracker
        .wait(&unit_id, Duration::from_millis(10))
        .await
        .expect("wait");
    assert_eq!(
        early,
        WaitOutcome::TimedOut {
            unit_id: unit_id.clone(),
            status: UnitStatus::Running,
        }
    );

    let result = finished(&harness, &unit_id).await;
    assert_eq!(result.status, UnitStatus::Completed);
}

#[tokio::test]
async fn wait_on_terminal_unit_returns_immediately() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["exit", "0"], Duration::from_secs(10)))
        .await
        .expect("spawn");
    let first = finished(&harness, &unit_id).await;

    let again = harness
        .tracker
        .wait(&unit_id, Duration::from_millis(1))
        .await
        .expect("wait");
    assert_eq!(
        again,
        WaitOutcome::Finished {
            unit_id,
            result: first,
        }
    );
}

#[tokio::test]
async fn wait_unknown_unit_is_not_found() {
    let harness = Harness::new().await;
    let err = harness
        .tracker
        .wait("missing", Duration::from_millis(10))
        .await
        .expect_err("unknown unit");
    assert!(matches!(err, AppError::NotFound(_)));
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_running_unit_ends_cancelled() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["sleep", "5000"], Duration::from_secs(10)))
        .await
        .expect("spawn");

    let status = harness.tracker.cancel(&unit_id).expect("cancel");
    assert_eq!(status, UnitStatus::Running);

    let result = finished(&harness, &unit_id).await;
    assert_eq!(result.status, UnitStatus::Cancelled);
    assert!(!result.success);
    assert!(harness.engine.running_ids().is_empty());

    let snapshot = harness.tracker.status(&unit_id).expect("status");
    assert!(snapshot.cancel_requested);
    let UnitView::Events(events) = harness
        .tracker
        .query(&unit_id, QueryType::Events, None)
        .expect("events")
    else {
        panic!("expected events view");
    };
    assert!(events
        .iter()
        .any(|e| e.kind == UnitEventKind::CancelRequested));
}

#[tokio::test]
async fn cancel_terminal_unit_is_noop() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["exit", "0"], Duration::from_secs(10)))
        .await
        .expect("spawn");
    let result = finished(&harness, &unit_id).await;
    let events_before = harness.tracker.status(&unit_id).expect("status").event_count;

    let status = harness.tracker.cancel(&unit_id).expect("cancel");
    assert_eq!(status, UnitStatus::Completed);

    let snapshot = harness.tracker.status(&unit_id).expect("status");
    assert_eq!(snapshot.status, UnitStatus::Completed);
    assert_eq!(snapshot.result, Some(result));
    assert_eq!(snapshot.event_count, events_before);
}

#[tokio::test]
async fn cancel_unknown_unit_is_not_found() {
    let harness = Harness::new().await;
    assert!(matches!(
        harness.tracker.cancel("missing"),
        Err(AppError::NotFound(_))
    ));
}

// ── Launch failures ──────────────────────────────────────

#[tokio::test]
async fn create_failure_surfaces_launch_error_and_failed_unit() {
    let engine = FakeEngine::new();
    engine.fail_create.store(true, Ordering::SeqCst);
    let harness = Harness::with(
        engine,
        PaneScript::RunForever,
        super::test_helpers::fast_settings(),
    )
    .await;

    let err = harness
        .tracker
        .spawn(container_spec(&["exit", "0"], Duration::from_secs(10)))
        .await
        .expect_err("launch must fail");
    let AppError::Launch(message) = err else {
        panic!("expected launch error, got {err}");
    };

    let units = harness.tracker.list();
    assert_eq!(units.len(), 1);
    let unit = &units[0];
    assert!(message.contains(&unit.unit_id), "error names the unit id");
    assert_eq!(unit.status, UnitStatus::Failed);
    let result = unit.result.as_ref().expect("failed unit has a result");
    assert!(result.error.as_deref().unwrap_or_default().contains("create refused"));
    assert_eq!(harness.tracker.live_count(), 0);
}

#[tokio::test]
async fn start_failure_leaves_no_running_container() {
    let engine = FakeEngine::new();
    engine.fail_start.store(true, Ordering::SeqCst);
    let harness = Harness::with(
        engine,
        PaneScript::RunForever,
        super::test_helpers::fast_settings(),
    )
    .await;

    let err = harness
        .tracker
        .spawn(container_spec(&["exit", "0"], Duration::from_secs(10)))
        .await
        .expect_err("launch must fail");
    assert!(matches!(err, AppError::Launch(_)));

    let records = harness
        .sandbox
        .runner()
        .registry()
        .list(&ContainerFilter::default())
        .await
        .expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ContainerStatus::Removed);
}

#[tokio::test]
async fn unavailable_engine_rejects_without_registering() {
    let harness = Harness::with(
        FakeEngine::unavailable(),
        PaneScript::RunForever,
        super::test_helpers::fast_settings(),
    )
    .await;

    let err = harness
        .tracker
        .spawn(container_spec(&["exit", "0"], Duration::from_secs(10)))
        .await
        .expect_err("engine unavailable");
    assert!(matches!(err, AppError::Validation(_)));
    assert!(harness.tracker.list().is_empty());
    assert_eq!(harness.engine.created_count(), 0);
}

#[tokio::test]
async fn invalid_spec_rejected_before_any_side_effect() {
    let harness = Harness::new().await;

    let mut empty_prompt = container_spec(&["exit", "0"], Duration::from_secs(10));
    empty_prompt.prompt = "  ".into();
    let mut zero_timeout = container_spec(&["exit", "0"], Duration::from_secs(10));
    zero_timeout.timeout = Duration::ZERO;
    let mut over_ceiling = container_spec(&["exit", "0"], Duration::from_secs(10));
    over_ceiling.limits.memory_mb = Some(1_000_000);
    let empty_command = container_spec(&[], Duration::from_secs(10));

    for spec in [empty_prompt, zero_timeout, over_ceiling, empty_command] {
        let err = harness.tracker.spawn(spec).await.expect_err("invalid spec");
        assert!(matches!(err, AppError::Validation(_)), "got {err}");
    }
    assert!(harness.tracker.list().is_empty());
    assert_eq!(harness.engine.created_count(), 0);
}

// ── Events ───────────────────────────────────────────────

#[tokio::test]
async fn event_log_is_ordered_and_ends_with_one_finished() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["echo", "line"], Duration::from_secs(10)))
        .await
        .expect("spawn");
    finished(&harness, &unit_id).await;

    let UnitView::Events(events) = harness
        .tracker
        .query(&unit_id, QueryType::Events, None)
        .expect("events")
    else {
        panic!("expected events view");
    };

    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (0..events.len() as u64).collect();
    assert_eq!(seqs, expected);
    assert!(events.windows(2).all(|w| w[0].at <= w[1].at));

    assert!(matches!(events[0].kind, UnitEventKind::Spawned { .. }));
    assert!(matches!(
        events.last().map(|e| &e.kind),
        Some(UnitEventKind::Finished {
            status: UnitStatus::Completed,
            success: true,
            ..
        })
    ));
    let finished_count = events
        .iter()
        .filter(|e| matches!(e.kind, UnitEventKind::Finished { .. }))
        .count();
    assert_eq!(finished_count, 1);
    assert!(events.iter().any(|e| e.kind
        == UnitEventKind::StatusChanged {
            from: UnitStatus::Pending,
            to: UnitStatus::Running,
        }));
    assert!(events.iter().any(|e| e.kind
        == UnitEventKind::Log {
            line: "line".into(),
        }));

    let emitted: Vec<_> = harness
        .sink
        .events()
        .into_iter()
        .filter(|e| e.unit_id == unit_id)
        .collect();
    assert_eq!(emitted.len(), events.len(), "every appended event is emitted");
}

#[tokio::test]
async fn query_views_reflect_committed_state() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["echo", "hello"], Duration::from_secs(10)))
        .await
        .expect("spawn");
    finished(&harness, &unit_id).await;

    let output = harness
        .tracker
        .query(&unit_id, QueryType::Output, None)
        .expect("output");
    assert_eq!(output, UnitView::Output(Some("hello\n".into())));

    let logs = harness
        .tracker
        .query(&unit_id, QueryType::Logs, Some(10))
        .expect("logs");
    assert_eq!(logs, UnitView::Logs(vec!["hello".into()]));

    let UnitView::Events(limited) = harness
        .tracker
        .query(&unit_id, QueryType::Events, Some(1))
        .expect("events")
    else {
        panic!("expected events view");
    };
    assert_eq!(limited.len(), 1);
    assert!(matches!(limited[0].kind, UnitEventKind::Finished { .. }));

    assert!(matches!(
        harness.tracker.query("missing", QueryType::Status, None),
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn output_is_absent_while_running() {
    let harness = Harness::new().await;
    let unit_id = harness
        .tracker
        .spawn(container_spec(&["sleep", "300"], Duration::from_secs(10)))
        .await
        .expect("spawn");

    let output = harness
        .tracker
        .query(&unit_id, QueryType::Output, None)
        .expect("output");
    assert_eq!(output, UnitView::Output(None));
    finished(&harness, &unit_id).await;
}
