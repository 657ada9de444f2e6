//! `wait_for_subagent` MCP tool handler.
//!
//! Suspends until one or more units reach a terminal state. An elapsed
//! timeout is a successful result with `"status": "timeout"`; the units
//! keep running.

use std::sync::Arc;
use std::time::Duration;

use rmcp::handler::server::tool::ToolCallContext;
use rmcp::model::CallToolResult;
use serde_json::{json, Value};
use tracing::{info, info_span, Instrument};

use crate::mcp::handler::{AppState, SubagentServer};
use crate::models::unit::{WaitMode, WaitOutcome};

use super::util::{json_result, millis, parse_input, to_error_data, Args};

#[derive(Debug, serde::Deserialize)]
struct WaitForSubagentInput {
    unit_id: Option<String>,
    #[serde(default)]
    unit_ids: Vec<String>,
    #[serde(default)]
    mode: WaitMode,
    timeout_ms: Option<u64>,
}

/// Handle the `wait_for_subagent` tool call.
///
/// # Errors
///
/// Returns `rmcp::ErrorData` for malformed input or unknown units.
pub async fn handle(
    context: ToolCallContext<'_, SubagentServer>,
) -> Result<CallToolResult, rmcp::ErrorData> {
    let state = Arc::clone(context.service.state());
    let args = context.arguments.unwrap_or_default();
    run(&state, args).await.map(|value| json_result(&value))
}

/// Execute `wait_for_subagent` against `state`.
///
/// # Errors
///
/// Returns `invalid_params` unless exactly one of `unit_id` or `unit_ids`
/// is given, and `resource_not_found` for unknown units.
pub async fn run(state: &AppState, args: Args) -> Result<Value, rmcp::ErrorData> {
    let input: WaitForSubagentInput = parse_input("wait_for_subagent", args)?;
    let timeout = millis(input.timeout_ms)
        .unwrap_or_else(|| Duration::from_millis(state.config.tracker.wait_default_ms));

    match (input.unit_id, input.unit_ids.is_empty()) {
        (Some(unit_id), true) => {
            let span = info_span!("wait_for_subagent", unit_id = %unit_id, ?timeout);
            async move {
                let outcome = state
                    .tracker
                    .wait(&unit_id, timeout)
                    .await
                    .map_err(|err| to_error_data(&err))?;
                info!(finished = outcome.is_finished(), "wait_for_subagent returned");
                Ok(outcome_json(&outcome))
            }
            .instrument(span)
            .await
        }
        (None, false) => {
            let unit_ids = input.unit_ids;
            let mode = input.mode;
            let span = info_span!("wait_for_subagent", units = unit_ids.len(), ?mode, ?timeout);
            async move {
                let outcomes = state
                    .tracker
                    .wait_many(&unit_ids, mode, timeout)
                    .await
                    .map_err(|err| to_error_data(&err))?;
                let finished = outcomes.iter().filter(|o| o.is_finished()).count();
                let satisfied = match mode {
                    WaitMode::All => finished == outcomes.len(),
                    WaitMode::Any => finished > 0,
                };
                info!(finished, satisfied, "wait_for_subagent returned");
                let status = if satisfied { "completed" } else { "timeout" };
                Ok(json!({
                    "status": status,
                    "mode": mode,
                    "units": outcomes.iter().map(outcome_json).collect::<Vec<_>>(),
                }))
            }
            .instrument(span)
            .await
        }
        _ => Err(rmcp::ErrorData::invalid_params(
            "exactly one of unit_id or unit_ids is required",
            None,
        )),
    }
}

fn outcome_json(outcome: &WaitOutcome) -> Value {
    match outcome {
        WaitOutcome::Finished { unit_id, result } => json!({
            "unit_id": unit_id,
            "status": result.status,
            "result": result,
        }),
        WaitOutcome::TimedOut { unit_id, status } => json!({
            "unit_id": unit_id,
            "status": "timeout",
            "unit_status": status,
        }),
    }
}
