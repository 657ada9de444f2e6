//! Container sandbox: engine abstraction, lifecycle runner, and the
//! validating tool surface.

pub mod cli;
pub mod engine;
pub mod output;
pub mod runner;
pub mod tool;

pub use engine::{BoxFuture, ContainerEngine, ContainerSpec, EngineState};
pub use output::{OutputCapture, Stream};
pub use runner::{ContainerRunner, RunRequest, RunnerSettings};
pub use tool::{SandboxAction, SandboxParams, SandboxPolicy, SandboxTool};
