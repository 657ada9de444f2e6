//! Sandbox execution inputs and results.

use serde::{Deserialize, Serialize};

use crate::config::SandboxCeilings;
use crate::{AppError, Result};

/// Resource limits applied to a sandbox container.
///
/// Unset fields fall back to the engine default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ResourceLimits {
    /// Memory ceiling in MiB.
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// CPU quota, in cores.
    #[serde(default)]
    pub cpus: Option<f64>,
    /// Maximum number of processes.
    #[serde(default)]
    pub pids: Option<u32>,
}

impl ResourceLimits {
    /// Reject limits that are zero, non-finite, or above the policy ceilings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` naming the first offending limit.
    pub fn validate(&self, ceilings: &SandboxCeilings) -> Result<()> {
        if let Some(memory) = self.memory_mb {
            if memory == 0 || memory > ceilings.max_memory_mb {
                return Err(AppError::Validation(format!(
                    "memory_mb must be between 1 and {}, got {memory}",
                    ceilings.max_memory_mb
                )));
            }
        }

        if let Some(cpus) = self.cpus {
            if !cpus.is_finite() || cpus <= 0.0 || cpus > ceilings.max_cpus {
                return Err(AppError::Validation(format!(
                    "cpus must be greater than 0 and at most {}, got {cpus}",
                    ceilings.max_cpus
                )));
            }
        }

        if let Some(pids) = self.pids {
            if pids == 0 || pids > ceilings.max_pids {
                return Err(AppError::Validation(format!(
                    "pids must be between 1 and {}, got {pids}",
                    ceilings.max_pids
                )));
            }
        }

        Ok(())
    }
}

/// How a sandbox action ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The command exited on its own.
    Exited,
    /// The command outlived its timeout and the container was force-cleaned.
    TimedOut,
    /// Cancellation was requested and the container was torn down.
    Cancelled,
    /// A `stop` action completed.
    Stopped,
    /// A `remove` action completed.
    Removed,
}

/// Definite result of one sandbox action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ContainerRunResult {
    /// Container the action ran against.
    pub container_id: String,
    /// How the action ended.
    pub outcome: RunOutcome,
    /// Exit code of the command or container, when known.
    pub exit_code: Option<i32>,
    /// Captured stdout, bounded.
    pub stdout: String,
    /// Captured stderr, bounded.
    pub stderr: String,
    /// Whether either stream was truncated.
    pub truncated: bool,
    /// Whether the container is still alive after the action.
    pub retained: bool,
    /// Wall-clock duration of the action.
    pub duration_ms: u64,
}

impl ContainerRunResult {
    /// Result for a lifecycle action that produced no output.
    #[must_use]
    pub fn lifecycle(container_id: impl Into<String>, outcome: RunOutcome) -> Self {
        Self {
            container_id: container_id.into(),
            outcome,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            retained: false,
            duration_ms: 0,
        }
    }

    /// Whether the command exited on its own with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.outcome == RunOutcome::Exited && self.exit_code == Some(0)
    }
}
