//! Tracked child agent unit model and lifecycle helpers.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status for a tracked child agent unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Registered but the backing process has not reported started.
    Pending,
    /// Backing container or pane is running.
    Running,
    /// Backing process exited with status zero.
    Completed,
    /// Launch failed, the process exited non-zero, or the monitor faulted.
    Failed,
    /// The unit exceeded its execution deadline and was force-cleaned.
    TimedOut,
    /// Termination was requested and the backing resource confirmed it.
    Cancelled,
}

impl UnitStatus {
    /// Whether no further transition may occur from this status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (
                    Self::Running,
                    Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
                )
        )
    }

    /// Stable wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for UnitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mechanism used to run a unit's process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// Isolated inside a sandbox container.
    Container,
    /// Inside a terminal multiplexer pane on the host.
    TerminalPane,
}

impl LaunchMode {
    /// Stable wire name of the launch mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::TerminalPane => "terminal_pane",
        }
    }
}

impl Display for LaunchMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit summary recorded exactly once when a unit reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct UnitResult {
    /// Terminal status the unit settled in.
    pub status: UnitStatus,
    /// `true` only for [`UnitStatus::Completed`].
    pub success: bool,
    /// Process exit code, when the backing resource reported one.
    pub exit_code: Option<i32>,
    /// Captured output, bounded; carries a truncation marker when cut.
    pub output: String,
    /// Whether `output` was truncated.
    pub output_truncated: bool,
    /// Diagnostic detail for failed, timed-out, or cancelled units.
    pub error: Option<String>,
    /// Wall-clock time from spawn to terminal transition.
    pub duration_ms: u64,
}

impl UnitResult {
    /// Build a result for a unit that ended in `status`.
    #[must_use]
    pub fn new(status: UnitStatus, exit_code: Option<i32>, error: Option<String>) -> Self {
        Self {
            status,
            success: status == UnitStatus::Completed,
            exit_code,
            output: String::new(),
            output_truncated: false,
            error,
            duration_ms: 0,
        }
    }

    /// Attach captured output.
    #[must_use]
    pub fn with_output(mut self, output: String, truncated: bool) -> Self {
        self.output = output;
        self.output_truncated = truncated;
        self
    }

    /// Attach the measured duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Lifecycle event payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitEventKind {
    /// Unit registered by `spawn`.
    Spawned {
        /// How the unit is launched.
        launch_mode: LaunchMode,
        /// Owning session of the spawning agent, if any.
        parent_session_id: Option<String>,
    },
    /// Committed status transition.
    StatusChanged {
        /// Previous status.
        from: UnitStatus,
        /// New status.
        to: UnitStatus,
    },
    /// Termination was requested and observed by the monitor.
    CancelRequested,
    /// One line of captured output.
    Log {
        /// Output line without trailing newline.
        line: String,
    },
    /// Final event appended on the terminal transition.
    Finished {
        /// Terminal status.
        status: UnitStatus,
        /// Whether the unit succeeded.
        success: bool,
        /// Diagnostic detail, if any.
        error: Option<String>,
    },
}

/// Ordered lifecycle event belonging to one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct UnitEvent {
    /// Position in the unit's event log, starting at zero.
    pub seq: u64,
    /// Unit the event belongs to.
    pub unit_id: String,
    /// Time the event was appended.
    pub at: DateTime<Utc>,
    /// Event payload.
    #[serde(flatten)]
    pub kind: UnitEventKind,
}

/// Read-only view of a tracked unit returned by status queries.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct UnitSnapshot {
    /// Unit identifier.
    pub unit_id: String,
    /// How the unit was launched.
    pub launch_mode: LaunchMode,
    /// Most recently committed status.
    pub status: UnitStatus,
    /// Prompt the unit was spawned with.
    pub prompt: String,
    /// Owning session of the spawning agent, if any.
    pub parent_session_id: Option<String>,
    /// Container or pane identifier once launched.
    pub backing_id: Option<String>,
    /// Spawn timestamp.
    pub started_at: DateTime<Utc>,
    /// Terminal transition timestamp.
    pub ended_at: Option<DateTime<Utc>>,
    /// Whether cancellation has been requested.
    pub cancel_requested: bool,
    /// Number of events appended so far.
    pub event_count: usize,
    /// Exit summary, present only in terminal states.
    pub result: Option<UnitResult>,
}

/// View requested from `query`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Status snapshot.
    Status,
    /// Lifecycle event log.
    Events,
    /// Captured output lines.
    Logs,
    /// Final output text; empty until the unit is terminal.
    Output,
}

impl QueryType {
    /// Parse a wire query type.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unknown names.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        match raw {
            "status" => Ok(Self::Status),
            "events" => Ok(Self::Events),
            "logs" => Ok(Self::Logs),
            "output" => Ok(Self::Output),
            other => Err(crate::AppError::Validation(format!(
                "invalid query type '{other}'; expected one of: status, events, logs, output"
            ))),
        }
    }
}

/// Result of a `query` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitView {
    /// Status snapshot.
    Status(UnitSnapshot),
    /// Event log in append order.
    Events(Vec<UnitEvent>),
    /// Captured output lines.
    Logs(Vec<String>),
    /// Final output text, or `None` while the unit is still live.
    Output(Option<String>),
}

/// Outcome of a `wait` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The unit reached a terminal state before the deadline.
    Finished {
        /// Unit identifier.
        unit_id: String,
        /// Terminal result.
        result: UnitResult,
    },
    /// The caller-side deadline elapsed; the unit keeps running.
    TimedOut {
        /// Unit identifier.
        unit_id: String,
        /// Status observed when the deadline elapsed.
        status: UnitStatus,
    },
}

impl WaitOutcome {
    /// Identifier of the unit this outcome refers to.
    #[must_use]
    pub fn unit_id(&self) -> &str {
        match self {
            Self::Finished { unit_id, .. } | Self::TimedOut { unit_id, .. } => unit_id,
        }
    }

    /// Whether the unit finished before the deadline.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// How `wait_many` combines multiple units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Wait until every unit is terminal.
    #[default]
    All,
    /// Wait until the first unit is terminal.
    Any,
}
