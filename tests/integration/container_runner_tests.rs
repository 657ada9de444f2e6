//! Integration tests for `ContainerRunner` and the `SandboxTool` front end.
//!
//! Validates:
//! - A one-shot run captures output and leaves the container removed
//! - Retained containers accept further execs, then stop and remove
//! - Timed-out and failed execs never leave a `running` record
//! - Only one invocation may hold a container at a time
//! - Out-of-policy requests are rejected before any container is created
//! - Startup reconciliation aligns stale records with the engine

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use subagent_runtime::models::container::{
    ContainerFilter, ContainerStatus, NewContainer, UNKNOWN_EXIT_CODE,
};
use subagent_runtime::models::sandbox::{ResourceLimits, RunOutcome};
use subagent_runtime::sandbox::{SandboxAction, SandboxParams};
use subagent_runtime::AppError;

use super::test_helpers::{test_runner, test_sandbox, FakeEngine};

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_owned()).collect()
}

fn run_params(words: &[&str]) -> SandboxParams {
    SandboxParams {
        command: argv(words),
        timeout: Some(Duration::from_secs(5)),
        ..SandboxParams::default()
    }
}

// ── run ──────────────────────────────────────────────────

#[tokio::test]
async fn run_captures_output_and_removes_container() {
    let engine = FakeEngine::new();
    let sandbox = test_sandbox(test_runner(Arc::clone(&engine)).await);

    let result = sandbox
        .execute(SandboxAction::Run, run_params(&["echo", "hi", "there"]))
        .await
        .expect("run");
    assert_eq!(result.outcome, RunOutcome::Exited);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "hi there\n");
    assert!(result.stderr.is_empty());
    assert!(!result.retained);
    assert!(result.success());

    let record = sandbox
        .runner()
        .registry()
        .get(&result.container_id)
        .await
        .expect("record");
    assert_eq!(record.status, ContainerStatus::Removed);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.image, "test-image");
    assert!(engine.running_ids().is_empty());
}

#[tokio::test]
async fn run_keeps_stderr_separate() {
    let sandbox = test_sandbox(test_runner(FakeEngine::new()).await);
    let result = sandbox
        .execute(SandboxAction::Run, run_params(&["stderr", "warning"]))
        .await
        .expect("run");
    assert!(result.stdout.is_empty());
    assert_eq!(result.stderr, "warning\n");
}

#[tokio::test]
async fn run_timeout_tears_down_container() {
    let engine = FakeEngine::new();
    let sandbox = test_sandbox(test_runner(Arc::clone(&engine)).await);

    let mut params = run_params(&["sleep", "5000"]);
    params.timeout = Some(Duration::from_millis(50));
    params.retain = true;
    let result = sandbox
        .execute(SandboxAction::Run, params)
        .await
        .expect("run");
    assert_eq!(result.outcome, RunOutcome::TimedOut);
    assert!(!result.retained, "timed-out containers are never retained");

    let record = sandbox
        .runner()
        .registry()
        .get(&result.container_id)
        .await
        .expect("record");
    assert_eq!(record.status, ContainerStatus::Removed);
    assert!(engine.running_ids().is_empty());
}

#[tokio::test]
async fn exec_failure_is_an_error_and_tears_down() {
    let engine = FakeEngine::new();
    let sandbox = test_sandbox(test_runner(Arc::clone(&engine)).await);

    let err = sandbox
        .execute(SandboxAction::Run, run_params(&["fail"]))
        .await
        .expect_err("exec fails");
    assert!(matches!(err, AppError::Container(_)));

    let running = sandbox
        .runner()
        .registry()
        .list(&ContainerFilter::with_status(ContainerStatus::Running))
        .await
        .expect("list");
    assert!(running.is_empty());
    assert!(engine.running_ids().is_empty());
}

#[tokio::test]
async fn start_failure_is_launch_error() {
    let engine = FakeEngine::new();
    engine.fail_start.store(true, Ordering::SeqCst);
    let sandbox = test_sandbox(test_runner(Arc::clone(&engine)).await);

    let err = sandbox
        .execute(SandboxAction::Run, run_params(&["echo", "x"]))
        .await
        .expect_err("start fails");
    assert!(matches!(err, AppError::Launch(_)));

    let records = sandbox
        .runner()
        .registry()
        .list(&ContainerFilter::default())
        .await
        .expect("list");
    assert!(records
        .iter()
        .all(|r| r.status != ContainerStatus::Running));
}

// ── Retained containers ──────────────────────────────────

#[tokio::test]
async fn retained_container_lifecycle() {
    let engine = FakeEngine::new();
    let sandbox = test_sandbox(test_runner(Arc::clone(&engine)).await);

    let mut params = run_params(&["echo", "first"]);
    params.retain = true;
    let first = sandbox
        .execute(SandboxAction::Run, params)
        .await
        .expect("run");
    assert!(first.retained);
    let id = first.container_id.clone();

    let registry = sandbox.runner().registry();
    assert_eq!(
        registry.get(&id).await.expect("record").status,
        ContainerStatus::Running
    );

    let second = sandbox
        .execute(
            SandboxAction::Exec,
            SandboxParams {
                container_id: Some(id.clone()),
                ..run_params(&["echo", "second"])
            },
        )
        .await
        .expect("exec");
    assert_eq!(second.stdout, "second\n");
    assert!(second.retained);

    let stopped = sandbox
        .execute(
            SandboxAction::Stop,
            SandboxParams {
                container_id: Some(id.clone()),
                ..SandboxParams::default()
            },
        )
        .await
        .expect("stop");
    assert_eq!(stopped.outcome, RunOutcome::Stopped);
    assert_eq!(stopped.exit_code, Some(137));
    assert_eq!(
        registry.get(&id).await.expect("record").status,
        ContainerStatus::Exited
    );

    let exec_after_stop = sandbox
        .execute(
            SandboxAction::Exec,
            SandboxParams {
                container_id: Some(id.clone()),
                ..run_params(&["echo", "third"])
            },
        )
        .await
        .expect_err("exited container rejects exec");
    assert!(matches!(exec_after_stop, AppError::Validation(_)));

    let remove = SandboxParams {
        container_id: Some(id.clone()),
        ..SandboxParams::default()
    };
    let removed = sandbox
        .execute(SandboxAction::Remove, remove.clone())
        .await
        .expect("remove");
    assert_eq!(removed.outcome, RunOutcome::Removed);
    sandbox
        .execute(SandboxAction::Remove, remove.clone())
        .await
        .expect("second remove is idempotent");
    assert_eq!(
        registry.get(&id).await.expect("record").status,
        ContainerStatus::Removed
    );

    let stop_removed = sandbox
        .execute(SandboxAction::Stop, remove)
        .await
        .expect_err("removed containers cannot be stopped");
    assert!(matches!(stop_removed, AppError::Validation(_)));
}

#[tokio::test]
async fn concurrent_exec_on_same_container_is_rejected() {
    let engine = FakeEngine::new();
    let sandbox = test_sandbox(test_runner(Arc::clone(&engine)).await);

    let mut params = run_params(&["echo", "ready"]);
    params.retain = true;
    let id = sandbox
        .execute(SandboxAction::Run, params)
        .await
        .expect("run")
        .container_id;

    let busy = {
        let sandbox = sandbox.clone();
        let id = id.clone();
        tokio::spawn(async move {
            sandbox
                .execute(
                    SandboxAction::Exec,
                    SandboxParams {
                        container_id: Some(id),
                        ..run_params(&["sleep", "300"])
                    },
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sandbox.runner().is_leased(&id));

    let err = sandbox
        .execute(
            SandboxAction::Exec,
            SandboxParams {
                container_id: Some(id.clone()),
                ..run_params(&["echo", "second"])
            },
        )
        .await
        .expect_err("container is busy");
    assert!(matches!(err, AppError::Validation(_)));
    assert!(err.to_string().contains("in use"));

    busy.await.expect("join").expect("first exec");
    assert!(!sandbox.runner().is_leased(&id));
}

#[tokio::test]
async fn unknown_container_is_not_found() {
    let sandbox = test_sandbox(test_runner(FakeEngine::new()).await);
    for action in [SandboxAction::Exec, SandboxAction::Stop, SandboxAction::Remove] {
        let err = sandbox
            .execute(
                action,
                SandboxParams {
                    container_id: Some("nope".into()),
                    ..run_params(&["echo", "x"])
                },
            )
            .await
            .expect_err("unknown container");
        assert!(matches!(err, AppError::NotFound(_)), "{action:?}: {err}");
    }
}

// ── Policy ───────────────────────────────────────────────

#[tokio::test]
async fn out_of_policy_requests_have_no_side_effects() {
    let engine = FakeEngine::new();
    let sandbox = test_sandbox(test_runner(Arc::clone(&engine)).await);

    let cases = vec![
        (SandboxAction::Run, run_params(&[])),
        (
            SandboxAction::Run,
            SandboxParams {
                limits: ResourceLimits {
                    memory_mb: Some(1_000_000),
                    ..ResourceLimits::default()
                },
                ..run_params(&["echo", "x"])
            },
        ),
        (
            SandboxAction::Run,
            SandboxParams {
                limits: ResourceLimits {
                    cpus: Some(0.0),
                    ..ResourceLimits::default()
                },
                ..run_params(&["echo", "x"])
            },
        ),
        (
            SandboxAction::Run,
            SandboxParams {
                timeout: Some(Duration::ZERO),
                ..run_params(&["echo", "x"])
            },
        ),
        (
            SandboxAction::Run,
            SandboxParams {
                timeout: Some(Duration::from_secs(3600)),
                ..run_params(&["echo", "x"])
            },
        ),
        (SandboxAction::Exec, run_params(&["echo", "x"])),
        (
            SandboxAction::Stop,
            SandboxParams {
                container_id: Some("bad id; rm -rf /".into()),
                ..SandboxParams::default()
            },
        ),
    ];

    for (action, params) in cases {
        let err = sandbox
            .execute(action, params)
            .await
            .expect_err("out of policy");
        assert!(matches!(err, AppError::Validation(_)), "{action:?}: {err}");
    }
    assert_eq!(engine.created_count(), 0);
}

// ── Reconciliation ───────────────────────────────────────

#[tokio::test]
async fn reconcile_marks_stale_records_exited() {
    let engine = FakeEngine::new();
    let runner = test_runner(Arc::clone(&engine)).await;
    let registry = runner.registry();

    for (id, unit_id) in [
        ("gone", None),
        ("stopped", None),
        ("alive", None),
        ("orphan", Some("unit-x")),
    ] {
        registry
            .create(&NewContainer {
                container_id: id.into(),
                image: "test-image".into(),
                unit_id: unit_id.map(str::to_owned),
            })
            .await
            .expect("create record");
    }
    registry
        .update(
            "stopped",
            subagent_runtime::models::container::ContainerPatch::status(ContainerStatus::Running),
        )
        .await
        .expect("mark running");
    registry
        .update(
            "alive",
            subagent_runtime::models::container::ContainerPatch::status(ContainerStatus::Running),
        )
        .await
        .expect("mark running");
    registry
        .update(
            "orphan",
            subagent_runtime::models::container::ContainerPatch::status(ContainerStatus::Running),
        )
        .await
        .expect("mark running");
    engine.seed("stopped", false, Some(2));
    engine.seed("alive", true, None);
    engine.seed("orphan", true, None);

    let report = runner.reconcile().await.expect("reconcile");
    assert_eq!(report.inspected, 4);
    assert_eq!(report.marked_exited, 2);
    assert_eq!(report.torn_down, 1);
    assert_eq!(report.still_running, 1);

    let gone = registry.get("gone").await.expect("gone");
    assert_eq!(gone.status, ContainerStatus::Exited);
    assert_eq!(gone.exit_code, Some(UNKNOWN_EXIT_CODE));

    let stopped = registry.get("stopped").await.expect("stopped");
    assert_eq!(stopped.status, ContainerStatus::Exited);
    assert_eq!(stopped.exit_code, Some(2));

    let alive = registry.get("alive").await.expect("alive");
    assert_eq!(alive.status, ContainerStatus::Running);

    let orphan = registry.get("orphan").await.expect("orphan");
    assert_eq!(orphan.status, ContainerStatus::Removed);
    assert_eq!(orphan.exit_code, Some(137));
    assert_eq!(engine.running_ids(), vec!["alive".to_owned()]);
    assert_eq!(engine.removed_ids(), vec!["orphan".to_owned()]);
}

#[tokio::test]
async fn remove_unit_containers_only_touches_owned_records() {
    let engine = FakeEngine::new();
    let runner = test_runner(Arc::clone(&engine)).await;

    let owned = runner
        .start_container(&ResourceLimits::default(), None, Some("unit-a".into()))
        .await
        .expect("start owned");
    let other = runner
        .start_container(&ResourceLimits::default(), None, Some("unit-b".into()))
        .await
        .expect("start other");
    let owned_id = owned.container_id.clone();
    let other_id = other.container_id.clone();
    drop(owned);
    drop(other);

    let removed = runner.remove_unit_containers("unit-a").await.expect("remove");
    assert_eq!(removed, 1);
    assert_eq!(
        runner.registry().get(&owned_id).await.expect("owned").status,
        ContainerStatus::Removed
    );
    assert_eq!(
        runner.registry().get(&other_id).await.expect("other").status,
        ContainerStatus::Running
    );
    assert_eq!(engine.running_ids(), vec![other_id]);
}
