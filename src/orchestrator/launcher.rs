//! Launch strategy contract shared by the container and pane launchers.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::models::sandbox::{ContainerRunResult, ResourceLimits};
use crate::models::unit::LaunchMode;
use crate::multiplexer::PaneHandle;
use crate::sandbox::engine::BoxFuture;
use crate::sandbox::output::OutputCapture;
use crate::{AppError, Result};

/// Terminal pane layout options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaneOptions {
    /// Session name; derived from the unit id when absent.
    pub session_name: Option<String>,
    /// Width in columns.
    pub width: Option<u16>,
    /// Height in rows.
    pub height: Option<u16>,
}

/// Everything needed to launch one unit.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Prompt handed to the child agent.
    pub prompt: String,
    /// Full argv executed for the unit.
    pub command: Vec<String>,
    /// Launch strategy to use.
    pub mode: LaunchMode,
    /// Container resource limits; ignored for panes.
    pub limits: ResourceLimits,
    /// Pane layout; ignored for containers.
    pub pane: PaneOptions,
    /// Working directory for the unit's process.
    pub working_directory: Option<String>,
    /// Execution deadline measured from launch.
    pub timeout: Duration,
    /// Owning session of the spawning agent.
    pub parent_session_id: Option<String>,
}

impl LaunchSpec {
    /// Reject specs that could never launch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty prompt or command, or a
    /// zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(AppError::Validation("prompt must not be empty".into()));
        }
        if self.command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(AppError::Validation("command must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(AppError::Validation(
                "timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Result slot filled by a container unit's background exec task.
pub type ContainerOutcome = Option<std::result::Result<ContainerRunResult, String>>;

/// Strategy-specific state behind a [`LaunchHandle`].
#[derive(Debug, Clone)]
pub enum Backing {
    /// A container whose command is executing in a background task.
    Container {
        /// Filled once the runner returns.
        outcome: watch::Receiver<ContainerOutcome>,
        /// Requests teardown from the runner.
        cancel: CancellationToken,
    },
    /// A terminal multiplexer pane.
    Pane(PaneHandle),
    /// State kept by the strategy itself, keyed by `backing_id`.
    External,
}

/// Reference to a launched unit's backing resource.
#[derive(Debug, Clone)]
pub struct LaunchHandle {
    /// Unit the resource belongs to.
    pub unit_id: String,
    /// Container id or pane id.
    pub backing_id: String,
    /// Live output of the unit.
    pub output: OutputCapture,
    /// Strategy-specific state.
    pub backing: Backing,
}

/// Status reported by [`LaunchStrategy::poll_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackingStatus {
    /// Still running.
    Running,
    /// The process exited on its own.
    Exited {
        /// Exit code, when known.
        exit_code: Option<i32>,
    },
    /// The backing layer enforced its own execution timeout.
    TimedOut,
    /// The backing layer confirmed termination after a cancel request.
    Cancelled,
    /// The backing layer failed.
    Failed {
        /// Diagnostic detail.
        error: String,
    },
    /// The backing resource no longer exists.
    Gone,
}

/// One way of running a unit's process.
pub trait LaunchStrategy: Send + Sync {
    /// Which launch mode this strategy serves.
    fn mode(&self) -> LaunchMode;

    /// Strategy-specific validation run before a unit is allocated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for out-of-policy specs.
    fn validate(&self, _spec: &LaunchSpec) -> Result<()> {
        Ok(())
    }

    /// Check that the strategy's prerequisites are met.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` when, for example, the engine or
    /// multiplexer binary is unavailable.
    fn check_available(&self) -> BoxFuture<'_, Result<()>>;

    /// Start the unit's process and return once it reports started.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the process could not be started.
    fn launch(&self, unit_id: String, spec: LaunchSpec) -> BoxFuture<'_, Result<LaunchHandle>>;

    /// Observe the backing resource without blocking on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing layer cannot be queried.
    fn poll_status(&self, handle: LaunchHandle) -> BoxFuture<'_, Result<BackingStatus>>;

    /// Request termination. Confirmation arrives through `poll_status`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be delivered.
    fn terminate(&self, handle: LaunchHandle) -> BoxFuture<'_, Result<()>>;

    /// Release every resource held for `unit_id`. Runs on every exit path,
    /// including when launch never produced a handle.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup could not complete.
    fn cleanup(&self, unit_id: String, handle: Option<LaunchHandle>)
        -> BoxFuture<'_, Result<()>>;
}
