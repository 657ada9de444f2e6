//! `query_subagent` MCP tool handler.

use std::sync::Arc;

use rmcp::handler::server::tool::ToolCallContext;
use rmcp::model::CallToolResult;
use serde_json::{json, Value};

use crate::mcp::handler::{AppState, SubagentServer};
use crate::models::unit::{QueryType, UnitView};

use super::util::{json_result, parse_input, to_error_data, to_json, Args};

#[derive(Debug, serde::Deserialize)]
struct QuerySubagentInput {
    unit_id: String,
    #[serde(default = "default_query_type")]
    query_type: String,
    limit: Option<usize>,
}

fn default_query_type() -> String {
    "status".into()
}

/// Handle the `query_subagent` tool call.
///
/// # Errors
///
/// Returns `rmcp::ErrorData` for unknown units or query types.
pub async fn handle(
    context: ToolCallContext<'_, SubagentServer>,
) -> Result<CallToolResult, rmcp::ErrorData> {
    let state = Arc::clone(context.service.state());
    let args = context.arguments.unwrap_or_default();
    run(&state, args).map(|value| json_result(&value))
}

/// Execute `query_subagent` against `state`. Never blocks.
///
/// # Errors
///
/// Returns `invalid_params` for an unknown query type and
/// `resource_not_found` for an unknown unit.
pub fn run(state: &AppState, args: Args) -> Result<Value, rmcp::ErrorData> {
    let input: QuerySubagentInput = parse_input("query_subagent", args)?;
    let query_type = QueryType::parse(&input.query_type).map_err(|err| to_error_data(&err))?;
    let view = state
        .tracker
        .query(&input.unit_id, query_type, input.limit)
        .map_err(|err| to_error_data(&err))?;

    let value = match view {
        UnitView::Status(snapshot) => to_json(&snapshot)?,
        UnitView::Events(events) => json!({
            "unit_id": input.unit_id,
            "events": to_json(&events)?,
        }),
        UnitView::Logs(lines) => json!({
            "unit_id": input.unit_id,
            "lines": lines,
        }),
        UnitView::Output(output) => json!({
            "unit_id": input.unit_id,
            "terminal": output.is_some(),
            "output": output,
        }),
    };
    Ok(value)
}
