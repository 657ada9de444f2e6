//! Contract tests for how tool failures map onto MCP error codes.
//!
//! Runs the tools against real CLI adapters pointed at binaries that do not
//! exist, so every failure path is exercised without a container engine or
//! multiplexer installed.
//!
//! | Failure                               | Error code           |
//! |---------------------------------------|----------------------|
//! | Malformed or missing arguments        | `INVALID_PARAMS`     |
//! | Unavailable engine or multiplexer     | `INVALID_PARAMS`     |
//! | Unknown unit or container             | `RESOURCE_NOT_FOUND` |

use std::sync::Arc;

use rmcp::model::ErrorCode;
use serde_json::{json, Value};

use subagent_runtime::config::GlobalConfig;
use subagent_runtime::mcp::handler::AppState;
use subagent_runtime::mcp::tools::{
    cancel_subagent, query_subagent, sandbox, spawn_subagent, spawn_tmux_agent, util::Args,
    wait_for_subagent,
};
use subagent_runtime::multiplexer::TmuxCli;
use subagent_runtime::orchestrator::{
    ContainerLauncher, NullSink, PaneLauncher, SubAgentTracker, TrackerSettings,
};
use subagent_runtime::persistence::container_registry::ContainerRegistry;
use subagent_runtime::persistence::db;
use subagent_runtime::sandbox::cli::CliEngine;
use subagent_runtime::sandbox::{ContainerRunner, RunnerSettings, SandboxPolicy, SandboxTool};

async fn offline_state() -> AppState {
    let config = GlobalConfig::default();
    let pool = db::connect_memory().await.expect("db");
    let registry = ContainerRegistry::new(Arc::new(pool));
    let runner = ContainerRunner::new(
        Arc::new(CliEngine::new("nonexistent-engine-xyz")),
        registry,
        RunnerSettings::from_config(&config.sandbox),
    );
    let sandbox = SandboxTool::new(runner, SandboxPolicy::from_config(&config.sandbox))
        .expect("sandbox tool");
    let tracker = SubAgentTracker::new(TrackerSettings::from_config(&config), Arc::new(NullSink))
        .with_strategy(Arc::new(ContainerLauncher::new(sandbox.clone())))
        .with_strategy(Arc::new(PaneLauncher::new(
            Arc::new(TmuxCli::new("nonexistent-tmux-xyz")),
            &config.tmux,
            config.sandbox.max_output_bytes,
        )));

    AppState {
        config: Arc::new(config),
        sandbox,
        tracker: Arc::new(tracker),
    }
}

fn args(value: Value) -> Args {
    match value {
        Value::Object(map) => map,
        other => panic!("tool arguments must be an object, got {other}"),
    }
}

// ── spawn ────────────────────────────────────────────────

#[tokio::test]
async fn spawn_without_prompt_is_invalid_params() {
    let state = offline_state().await;
    let err = spawn_subagent::run(&state, args(json!({})))
        .await
        .expect_err("prompt is required");
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    assert!(err.message.contains("spawn_subagent"));
}

#[tokio::test]
async fn spawn_with_unknown_launch_mode_is_invalid_params() {
    let state = offline_state().await;
    let err = spawn_subagent::run(
        &state,
        args(json!({ "prompt": "hi", "launch_mode": "vm" })),
    )
    .await
    .expect_err("unknown launch mode");
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
}

#[tokio::test]
async fn spawn_without_engine_is_invalid_params() {
    let state = offline_state().await;
    let err = spawn_subagent::run(&state, args(json!({ "prompt": "hi" })))
        .await
        .expect_err("engine unavailable");
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    assert!(state.tracker.list().is_empty(), "no unit is registered");
}

#[tokio::test]
async fn spawn_with_excessive_limits_is_invalid_params() {
    let state = offline_state().await;
    let err = spawn_subagent::run(
        &state,
        args(json!({ "prompt": "hi", "resource_limits": { "memory_mb": 0 } })),
    )
    .await
    .expect_err("limits out of range");
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
}

#[tokio::test]
async fn spawn_tmux_without_multiplexer_is_invalid_params() {
    let state = offline_state().await;
    let err = spawn_tmux_agent::run(&state, args(json!({ "prompt": "hi" })))
        .await
        .expect_err("multiplexer unavailable");
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
}

// ── query / wait / cancel ────────────────────────────────

#[tokio::test]
async fn query_unknown_unit_is_resource_not_found() {
    let state = offline_state().await;
    let err = query_subagent::run(&state, args(json!({ "unit_id": "ghost" })))
        .expect_err("unknown unit");
    assert_eq!(err.code, ErrorCode::RESOURCE_NOT_FOUND);
}

#[tokio::test]
async fn query_with_bad_type_is_invalid_params() {
    let state = offline_state().await;
    let err = query_subagent::run(
        &state,
        args(json!({ "unit_id": "ghost", "query_type": "everything" })),
    )
    .expect_err("bad query type");
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
}

#[tokio::test]
async fn wait_requires_exactly_one_selector() {
    let state = offline_state().await;
    for input in [
        json!({}),
        json!({ "unit_id": "a", "unit_ids": ["b"] }),
    ] {
        let err = wait_for_subagent::run(&state, args(input))
            .await
            .expect_err("selector");
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }
}

#[tokio::test]
async fn wait_unknown_unit_is_resource_not_found() {
    let state = offline_state().await;
    let err = wait_for_subagent::run(
        &state,
        args(json!({ "unit_ids": ["ghost"], "timeout_ms": 10 })),
    )
    .await
    .expect_err("unknown unit");
    assert_eq!(err.code, ErrorCode::RESOURCE_NOT_FOUND);
}

#[tokio::test]
async fn cancel_unknown_unit_is_resource_not_found() {
    let state = offline_state().await;
    let err = cancel_subagent::run(&state, args(json!({ "unit_id": "ghost" })))
        .expect_err("unknown unit");
    assert_eq!(err.code, ErrorCode::RESOURCE_NOT_FOUND);
}

// ── sandbox ──────────────────────────────────────────────

#[tokio::test]
async fn sandbox_unknown_action_is_invalid_params() {
    let state = offline_state().await;
    let err = sandbox::run(&state, args(json!({ "action": "pause" })))
        .await
        .expect_err("unknown action");
    assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
}

#[tokio::test]
async fn sandbox_policy_violations_are_invalid_params() {
    let state = offline_state().await;
    for input in [
        json!({ "action": "run", "command": [] }),
        json!({ "action": "exec", "command": ["ls"] }),
        json!({ "action": "stop", "container_id": "../etc" }),
        json!({ "action": "run", "command": ["ls"], "timeout_ms": 999_999_999 }),
        json!({ "action": "run", "command": ["ls"], "resource_limits": { "pids": 0 } }),
    ] {
        let err = sandbox::run(&state, args(input.clone()))
            .await
            .expect_err("out of policy");
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS, "{input}");
    }
}

#[tokio::test]
async fn sandbox_stop_unknown_container_is_resource_not_found() {
    let state = offline_state().await;
    let err = sandbox::run(
        &state,
        args(json!({ "action": "stop", "container_id": "ghost-1" })),
    )
    .await
    .expect_err("unknown container");
    assert_eq!(err.code, ErrorCode::RESOURCE_NOT_FOUND);
}
