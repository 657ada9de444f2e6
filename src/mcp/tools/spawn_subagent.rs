//! `spawn_subagent` MCP tool handler.
//!
//! Starts a child agent unit running the host agent CLI with the given
//! prompt, either in a sandbox container or in a terminal pane.

use std::sync::Arc;

use rmcp::handler::server::tool::ToolCallContext;
use rmcp::model::CallToolResult;
use serde_json::{json, Value};
use tracing::{info, info_span, Instrument};

use crate::mcp::handler::{AppState, SubagentServer};
use crate::models::sandbox::ResourceLimits;
use crate::models::unit::LaunchMode;
use crate::orchestrator::{LaunchSpec, PaneOptions};

use super::util::{json_result, millis, parse_input, to_error_data, truncate_text, Args};

/// Input parameters for `spawn_subagent`.
#[derive(Debug, serde::Deserialize)]
struct SpawnSubagentInput {
    /// Prompt handed to the child agent.
    prompt: String,
    /// `container` (default) or `terminal_pane`.
    #[serde(default)]
    launch_mode: Option<LaunchMode>,
    /// Container resource limits.
    #[serde(default)]
    resource_limits: ResourceLimits,
    /// Unit deadline; the launch mode's default applies when absent.
    timeout_ms: Option<u64>,
    /// Working directory of the child process.
    working_directory: Option<String>,
    /// Session of the spawning agent.
    parent_session_id: Option<String>,
}

/// Handle the `spawn_subagent` tool call.
///
/// # Errors
///
/// Returns `rmcp::ErrorData` on validation or launch failures.
pub async fn handle(
    context: ToolCallContext<'_, SubagentServer>,
) -> Result<CallToolResult, rmcp::ErrorData> {
    let state = Arc::clone(context.service.state());
    let args = context.arguments.unwrap_or_default();
    run(&state, args).await.map(|value| json_result(&value))
}

/// Execute `spawn_subagent` against `state`.
///
/// # Errors
///
/// Returns `invalid_params` for malformed or out-of-policy input and
/// `internal_error` if the unit failed to launch.
pub async fn run(state: &AppState, args: Args) -> Result<Value, rmcp::ErrorData> {
    let input: SpawnSubagentInput = parse_input("spawn_subagent", args)?;
    let mode = input.launch_mode.unwrap_or(LaunchMode::Container);
    let default_timeout = match mode {
        LaunchMode::Container => state.config.sandbox.default_timeout(),
        LaunchMode::TerminalPane => state.config.tmux.default_timeout(),
    };

    let span = info_span!(
        "spawn_subagent",
        %mode,
        prompt = %truncate_text(&input.prompt, 80),
    );

    async move {
        let spec = LaunchSpec {
            command: state.config.agent.command_for(&input.prompt),
            prompt: input.prompt,
            mode,
            limits: input.resource_limits,
            pane: PaneOptions::default(),
            working_directory: input.working_directory,
            timeout: millis(input.timeout_ms).unwrap_or(default_timeout),
            parent_session_id: input.parent_session_id,
        };

        let unit_id = state
            .tracker
            .spawn(spec)
            .await
            .map_err(|err| to_error_data(&err))?;
        let snapshot = state
            .tracker
            .status(&unit_id)
            .map_err(|err| to_error_data(&err))?;

        info!(unit_id, status = %snapshot.status, "subagent spawned");
        Ok(json!({
            "unit_id": unit_id,
            "status": snapshot.status,
            "launch_mode": snapshot.launch_mode,
            "backing_id": snapshot.backing_id,
        }))
    }
    .instrument(span)
    .await
}
