//! `sandbox` MCP tool handler.
//!
//! Direct access to the container lifecycle: run a command in a fresh
//! container, exec in a retained one, stop, or remove.

use std::sync::Arc;

use rmcp::handler::server::tool::ToolCallContext;
use rmcp::model::CallToolResult;
use serde_json::Value;
use tracing::{info, info_span, Instrument};

use crate::mcp::handler::{AppState, SubagentServer};
use crate::models::sandbox::ResourceLimits;
use crate::sandbox::{SandboxAction, SandboxParams};

use super::util::{json_result, millis, parse_input, to_error_data, to_json, Args};

#[derive(Debug, serde::Deserialize)]
struct SandboxInput {
    action: String,
    #[serde(default)]
    command: Vec<String>,
    container_id: Option<String>,
    #[serde(default)]
    resource_limits: ResourceLimits,
    timeout_ms: Option<u64>,
    working_dir: Option<String>,
    #[serde(default)]
    retain: bool,
}

/// Handle the `sandbox` tool call.
///
/// # Errors
///
/// Returns `rmcp::ErrorData` for out-of-policy requests or engine failures.
pub async fn handle(
    context: ToolCallContext<'_, SubagentServer>,
) -> Result<CallToolResult, rmcp::ErrorData> {
    let state = Arc::clone(context.service.state());
    let args = context.arguments.unwrap_or_default();
    run(&state, args).await.map(|value| json_result(&value))
}

/// Execute `sandbox` against `state` and return the `ContainerRunResult`.
///
/// # Errors
///
/// Returns `invalid_params` for out-of-policy requests,
/// `resource_not_found` for unknown containers, and `internal_error` for
/// engine failures.
pub async fn run(state: &AppState, args: Args) -> Result<Value, rmcp::ErrorData> {
    let input: SandboxInput = parse_input("sandbox", args)?;
    let action = SandboxAction::parse(&input.action).map_err(|err| to_error_data(&err))?;
    let span = info_span!(
        "sandbox_tool",
        ?action,
        container_id = input.container_id.as_deref().unwrap_or(""),
    );

    async move {
        let params = SandboxParams {
            command: input.command,
            container_id: input.container_id,
            limits: input.resource_limits,
            timeout: millis(input.timeout_ms),
            working_dir: input.working_dir,
            retain: input.retain,
            unit_id: None,
        };
        let result = state
            .sandbox
            .execute(action, params)
            .await
            .map_err(|err| to_error_data(&err))?;
        info!(
            container_id = %result.container_id,
            outcome = ?result.outcome,
            exit_code = result.exit_code,
            "sandbox action complete"
        );
        to_json(&result)
    }
    .instrument(span)
    .await
}
