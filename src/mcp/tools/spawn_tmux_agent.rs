//! `spawn_tmux_agent` MCP tool handler.
//!
//! Terminal-pane flavour of `spawn_subagent` with explicit pane layout.

use std::sync::Arc;

use rmcp::handler::server::tool::ToolCallContext;
use rmcp::model::CallToolResult;
use serde_json::{json, Value};
use tracing::{info, info_span, Instrument};

use crate::mcp::handler::{AppState, SubagentServer};
use crate::models::sandbox::ResourceLimits;
use crate::models::unit::LaunchMode;
use crate::orchestrator::{LaunchSpec, PaneOptions};

use super::util::{json_result, millis, parse_input, to_error_data, Args};

/// Pane layout accepted by `spawn_tmux_agent`.
#[derive(Debug, Default, serde::Deserialize)]
struct PaneConfigInput {
    session_name: Option<String>,
    width: Option<u16>,
    height: Option<u16>,
}

/// Input parameters for `spawn_tmux_agent`.
#[derive(Debug, serde::Deserialize)]
struct SpawnTmuxAgentInput {
    prompt: String,
    #[serde(default)]
    pane_config: PaneConfigInput,
    timeout_ms: Option<u64>,
    working_directory: Option<String>,
    parent_session_id: Option<String>,
}

/// Handle the `spawn_tmux_agent` tool call.
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

/// Execute `spawn_tmux_agent` against `state`.
///
/// # Errors
///
/// Returns `invalid_params` for malformed input or an unavailable
/// multiplexer and `internal_error` if the pane failed to start.
pub async fn run(state: &AppState, args: Args) -> Result<Value, rmcp::ErrorData> {
    let input: SpawnTmuxAgentInput = parse_input("spawn_tmux_agent", args)?;
    let span = info_span!(
        "spawn_tmux_agent",
        session_name = input.pane_config.session_name.as_deref().unwrap_or(""),
    );

    async move {
        let spec = LaunchSpec {
            command: state.config.agent.command_for(&input.prompt),
            prompt: input.prompt,
            mode: LaunchMode::TerminalPane,
            limits: ResourceLimits::default(),
            pane: PaneOptions {
                session_name: input.pane_config.session_name,
                width: input.pane_config.width,
                height: input.pane_config.height,
            },
            working_directory: input.working_directory,
            timeout: millis(input.timeout_ms).unwrap_or_else(|| state.config.tmux.default_timeout()),
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

        info!(unit_id, pane_id = ?snapshot.backing_id, "tmux agent spawned");
        Ok(json!({
            "unit_id": unit_id,
            "status": snapshot.status,
            "pane_id": snapshot.backing_id,
        }))
    }
    .instrument(span)
    .await
}
