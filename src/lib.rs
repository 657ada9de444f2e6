#![forbid(unsafe_code)]

//! Subagent lifecycle orchestration with sandboxed execution.
//!
//! A calling agent spawns child agent units through MCP tools. Each unit
//! runs either inside a sandbox container or in a terminal multiplexer
//! pane, and is tracked until it reaches a terminal state.

pub mod audit;
pub mod config;
pub mod errors;
pub mod mcp;
pub mod models;
pub mod multiplexer;
pub mod orchestrator;
pub mod persistence;
pub mod process;
pub mod sandbox;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
