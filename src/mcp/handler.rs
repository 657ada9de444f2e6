//! MCP server handler, shared application state, and tool router.

use std::future::Future;
use std::sync::Arc;

use rmcp::handler::server::{
    tool::{ToolCallContext, ToolRoute, ToolRouter},
    ServerHandler,
};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use tracing::info_span;

use crate::config::GlobalConfig;
use crate::orchestrator::SubAgentTracker;
use crate::sandbox::SandboxTool;

use super::tools;

/// Shared application state accessible by all MCP tool handlers.
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Validating sandbox front end over the container runner.
    pub sandbox: SandboxTool,
    /// Tracker owning every spawned child unit.
    pub tracker: Arc<SubAgentTracker>,
}

/// MCP server implementation that exposes the subagent tool surface.
pub struct SubagentServer {
    state: Arc<AppState>,
}

impl SubagentServer {
    /// Create a new MCP server bound to shared application state.
    #[must_use]
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Access the shared application state.
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    fn tool_router() -> ToolRouter<Self> {
        let mut router = ToolRouter::new();

        for tool in Self::all_tools() {
            let name = tool.name.to_string();
            let route = match name.as_str() {
                "spawn_subagent" => ToolRoute::new_dyn(tool, |context| {
                    Box::pin(tools::spawn_subagent::handle(context))
                }),
                "spawn_tmux_agent" => ToolRoute::new_dyn(tool, |context| {
                    Box::pin(tools::spawn_tmux_agent::handle(context))
                }),
                "query_subagent" => ToolRoute::new_dyn(tool, |context| {
                    Box::pin(tools::query_subagent::handle(context))
                }),
                "wait_for_subagent" => ToolRoute::new_dyn(tool, |context| {
                    Box::pin(tools::wait_for_subagent::handle(context))
                }),
                "cancel_subagent" => ToolRoute::new_dyn(tool, |context| {
                    Box::pin(tools::cancel_subagent::handle(context))
                }),
                "sandbox" => ToolRoute::new_dyn(tool, |context| {
                    Box::pin(tools::sandbox::handle(context))
                }),
                _ => ToolRoute::new_dyn(tool, |_context| {
                    Box::pin(async {
                        Err(rmcp::ErrorData::internal_error(
                            "tool not implemented",
                            None,
                        ))
                    })
                }),
            };
            router.add_route(route);
        }

        router
    }

    /// Convert a `serde_json::Value::Object` into the `Arc<Map>` expected by `Tool`.
    fn schema(value: serde_json::Value) -> Arc<serde_json::Map<String, serde_json::Value>> {
        match value {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::default()),
        }
    }

    /// Definitions of every tool the server exposes.
    #[allow(clippy::too_many_lines)] // Tool definitions are intentionally verbose for clarity.
    #[must_use]
    pub fn all_tools() -> Vec<Tool> {
        let limits = serde_json::json!({
            "type": "object",
            "properties": {
                "memory_mb": { "type": "integer", "minimum": 1 },
                "cpus": { "type": "number", "exclusiveMinimum": 0 },
                "pids": { "type": "integer", "minimum": 1 }
            }
        });

        vec![
            Tool::new(
                "spawn_subagent",
                "Spawn a child agent that runs the given prompt in a sandbox container \
                 or a terminal pane. Returns once the child has started.",
                Self::schema(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "prompt": { "type": "string" },
                        "launch_mode": { "type": "string", "enum": ["container", "terminal_pane"], "default": "container" },
                        "resource_limits": limits.clone(),
                        "timeout_ms": { "type": "integer", "minimum": 1 },
                        "working_directory": { "type": "string" },
                        "parent_session_id": { "type": "string" }
                    },
                    "required": ["prompt"]
                })),
            ),
            Tool::new(
                "spawn_tmux_agent",
                "Spawn a child agent in its own tmux session so an operator can watch it.",
                Self::schema(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "prompt": { "type": "string" },
                        "pane_config": {
                            "type": "object",
                            "properties": {
                                "session_name": { "type": "string" },
                                "width": { "type": "integer", "minimum": 1 },
                                "height": { "type": "integer", "minimum": 1 }
                            }
                        },
                        "timeout_ms": { "type": "integer", "minimum": 1 },
                        "working_directory": { "type": "string" },
                        "parent_session_id": { "type": "string" }
                    },
                    "required": ["prompt"]
                })),
            ),
            Tool::new(
                "query_subagent",
                "Read a child agent's status, lifecycle events, captured log lines, or \
                 final output. Never blocks.",
                Self::schema(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "unit_id": { "type": "string" },
                        "query_type": { "type": "string", "enum": ["status", "events", "logs", "output"], "default": "status" },
                        "limit": { "type": "integer", "minimum": 0 }
                    },
                    "required": ["unit_id"]
                })),
            ),
            Tool::new(
                "wait_for_subagent",
                "Wait for one or more child agents to finish. A timeout returns \
                 status \"timeout\" and leaves the children running.",
                Self::schema(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "unit_id": { "type": "string" },
                        "unit_ids": { "type": "array", "items": { "type": "string" } },
                        "mode": { "type": "string", "enum": ["all", "any"], "default": "all" },
                        "timeout_ms": { "type": "integer", "minimum": 1 }
                    }
                })),
            ),
            Tool::new(
                "cancel_subagent",
                "Request termination of a running child agent. No-op once it has finished.",
                Self::schema(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "unit_id": { "type": "string" }
                    },
                    "required": ["unit_id"]
                })),
            ),
            Tool::new(
                "sandbox",
                "Run a command in an isolated container, exec in a retained one, or \
                 stop/remove a container.",
                Self::schema(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "action": { "type": "string", "enum": ["run", "exec", "stop", "remove"] },
                        "command": { "type": "array", "items": { "type": "string" } },
                        "container_id": { "type": "string" },
                        "resource_limits": limits,
                        "timeout_ms": { "type": "integer", "minimum": 1 },
                        "working_dir": { "type": "string" },
                        "retain": { "type": "boolean", "default": false }
                    },
                    "required": ["action"]
                })),
            ),
        ]
    }
}

impl ServerHandler for SubagentServer {
    fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, rmcp::ErrorData>> + Send + '_ {
        let router = Self::tool_router();
        let _span = info_span!("call_tool", tool = %request.name).entered();

        async move {
            router
                .call(ToolCallContext::new(self, request, context))
                .await
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, rmcp::ErrorData>> + Send + '_ {
        let tools = Self::all_tools();

        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }
}
