//! Terminal multiplexer abstraction used by the pane launch strategy.

pub mod tmux;

use crate::sandbox::engine::BoxFuture;
use crate::Result;

pub use tmux::TmuxCli;

/// Observed state of a pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    /// The pane's process is still running.
    Alive,
    /// The process exited; the pane is held open for inspection.
    Dead {
        /// Exit status, when the multiplexer reported one.
        exit_code: Option<i32>,
    },
    /// The multiplexer no longer knows the pane.
    Missing,
}

/// Parameters for a new pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneRequest {
    /// Session name that will hold the pane.
    pub session_name: String,
    /// Working directory of the pane's shell.
    pub working_directory: Option<String>,
    /// Width in columns.
    pub width: u16,
    /// Height in rows.
    pub height: u16,
}

/// Identifier of a created pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneHandle {
    /// Session holding the pane.
    pub session_name: String,
    /// Multiplexer pane id (e.g. `%3`).
    pub pane_id: String,
}

/// Create-pane/send-keys/capture-pane/kill-pane primitives.
pub trait Multiplexer: Send + Sync {
    /// Multiplexer name, for logs.
    fn name(&self) -> &str;

    /// Whether the multiplexer binary is installed and usable.
    fn is_available(&self) -> BoxFuture<'_, bool>;

    /// Create a detached session with one pane that is kept after its
    /// process exits, so the exit status can be read.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Multiplexer` if the session cannot be created.
    fn create_pane(&self, request: PaneRequest) -> BoxFuture<'_, Result<PaneHandle>>;

    /// Type `keys` literally into the pane and press Enter.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Multiplexer` if the pane rejects the input.
    fn send_keys(&self, pane_id: String, keys: String) -> BoxFuture<'_, Result<()>>;

    /// Current visible contents plus scrollback of the pane.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Multiplexer` if the pane cannot be read.
    fn capture_pane(&self, pane_id: String) -> BoxFuture<'_, Result<String>>;

    /// Whether the pane's process is alive, dead, or the pane is gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Multiplexer` if the multiplexer cannot be queried.
    fn pane_state(&self, pane_id: String) -> BoxFuture<'_, Result<PaneState>>;

    /// Kill the pane and its session. Killing a missing pane succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Multiplexer` if the multiplexer refuses.
    fn kill_pane(&self, handle: PaneHandle) -> BoxFuture<'_, Result<()>>;
}
