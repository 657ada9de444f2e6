//! `cancel_subagent` MCP tool handler.

use std::sync::Arc;

use rmcp::handler::server::tool::ToolCallContext;
use rmcp::model::CallToolResult;
use serde_json::{json, Value};
use tracing::info;

use crate::mcp::handler::{AppState, SubagentServer};

use super::util::{json_result, parse_input, to_error_data, Args};

#[derive(Debug, serde::Deserialize)]
struct CancelSubagentInput {
    unit_id: String,
}

/// Handle the `cancel_subagent` tool call.
///
/// # Errors
///
/// Returns `rmcp::ErrorData` for unknown units.
pub async fn handle(
    context: ToolCallContext<'_, SubagentServer>,
) -> Result<CallToolResult, rmcp::ErrorData> {
    let state = Arc::clone(context.service.state());
    let args = context.arguments.unwrap_or_default();
    run(&state, args).map(|value| json_result(&value))
}

/// Execute `cancel_subagent` against `state`.
///
/// The unit settles asynchronously; `status` is the state at request time.
///
/// # Errors
///
/// Returns `resource_not_found` for an unknown unit.
pub fn run(state: &AppState, args: Args) -> Result<Value, rmcp::ErrorData> {
    let input: CancelSubagentInput = parse_input("cancel_subagent", args)?;
    let status = state
        .tracker
        .cancel(&input.unit_id)
        .map_err(|err| to_error_data(&err))?;
    let cancel_requested = !status.is_terminal();
    info!(unit_id = %input.unit_id, %status, cancel_requested, "cancel_subagent handled");

    Ok(json!({
        "unit_id": input.unit_id,
        "status": status,
        "cancel_requested": cancel_requested,
    }))
}
