//! MCP tool handlers.

pub mod cancel_subagent;
pub mod query_subagent;
pub mod sandbox;
pub mod spawn_subagent;
pub mod spawn_tmux_agent;
pub mod util;
pub mod wait_for_subagent;
