//! Container engine abstraction.
//!
//! The runner drives containers exclusively through [`ContainerEngine`],
//! keyed by the engine-assigned container id. [`super::cli::CliEngine`]
//! is the production implementation; tests supply scripted fakes.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::models::sandbox::ResourceLimits;
use crate::Result;

use super::output::OutputCapture;

/// Boxed future returned by engine and launcher trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Label carrying the owning unit id on containers created for a unit.
pub const UNIT_LABEL: &str = "subagent-runtime.unit";

/// Everything the engine needs to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image, which must already be present locally.
    pub image: String,
    /// Long-lived command that keeps the container idle between execs.
    pub entrypoint: Vec<String>,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Labels attached to the container.
    pub labels: Vec<(String, String)>,
}

/// Engine-reported state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineState {
    /// Whether the container's main process is running.
    pub running: bool,
    /// Exit code of the main process once it stopped.
    pub exit_code: Option<i32>,
}

/// Create/start/exec/stop/remove primitives of a container engine.
pub trait ContainerEngine: Send + Sync {
    /// Engine name, for logs.
    fn name(&self) -> &str;

    /// Whether the engine is installed and its daemon reachable.
    fn is_available(&self) -> BoxFuture<'_, bool>;

    /// Create a container and return its engine-assigned id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Container` if the engine rejects the request.
    fn create(&self, spec: ContainerSpec) -> BoxFuture<'_, Result<String>>;

    /// Start a created container.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Container` if the engine cannot start it.
    fn start(&self, container_id: String) -> BoxFuture<'_, Result<()>>;

    /// Run `command` inside a running container, streaming its output into
    /// `output`, and return the command's exit code.
    ///
    /// Dropping the returned future must abandon the exec.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Container` if the exec cannot be started.
    fn exec(
        &self,
        container_id: String,
        command: Vec<String>,
        output: OutputCapture,
    ) -> BoxFuture<'_, Result<i32>>;

    /// Send the stop signal, waiting up to `grace` before the engine kills.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Container` if the engine reports a failure other
    /// than the container being already gone.
    fn stop(&self, container_id: String, grace: Duration) -> BoxFuture<'_, Result<()>>;

    /// Force-remove a container. Removing a missing container succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Container` if the engine refuses removal.
    fn remove(&self, container_id: String) -> BoxFuture<'_, Result<()>>;

    /// Current state, or `None` if the engine no longer knows the container.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Container` if the engine cannot be queried.
    fn inspect(&self, container_id: String) -> BoxFuture<'_, Result<Option<EngineState>>>;
}
