//! Container record model persisted by the container registry.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code recorded when the real exit status of a container is unknown,
/// for example when reconciliation finds the container gone.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Lifecycle status for a sandbox container record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// Created by the engine but not started.
    Created,
    /// Started and owned by a runner invocation.
    Running,
    /// Stopped; exit code recorded when known.
    Exited,
    /// Removed from the engine. Never reused.
    Removed,
}

impl ContainerStatus {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running | Self::Exited | Self::Removed)
                | (Self::Running, Self::Exited | Self::Removed)
                | (Self::Exited, Self::Removed)
        )
    }

    /// Stable storage name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Removed => "removed",
        }
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one sandbox container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ContainerRecord {
    /// Engine-assigned identifier.
    pub container_id: String,
    /// Image the container was created from.
    pub image: String,
    /// Tracked unit that owns the container, if any.
    pub unit_id: Option<String>,
    /// Current lifecycle status.
    pub status: ContainerStatus,
    /// Exit code, set once the container has exited.
    pub exit_code: Option<i32>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time the record was touched by a lifecycle action.
    pub last_activity_at: DateTime<Utc>,
}

/// Input for registering a freshly created container.
#[derive(Debug, Clone)]
pub struct NewContainer {
    /// Engine-assigned identifier.
    pub container_id: String,
    /// Image the container was created from.
    pub image: String,
    /// Owning unit, if any.
    pub unit_id: Option<String>,
}

/// Partial update applied by [`crate::persistence::container_registry::ContainerRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct ContainerPatch {
    /// New status; validated against the transition table.
    pub status: Option<ContainerStatus>,
    /// New exit code.
    pub exit_code: Option<i32>,
}

impl ContainerPatch {
    /// Patch that only moves the record to `status`.
    #[must_use]
    pub fn status(status: ContainerStatus) -> Self {
        Self {
            status: Some(status),
            exit_code: None,
        }
    }

    /// Patch that marks the record exited with `exit_code`.
    #[must_use]
    pub fn exited(exit_code: i32) -> Self {
        Self {
            status: Some(ContainerStatus::Exited),
            exit_code: Some(exit_code),
        }
    }
}

/// Filter for listing container records; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Match only records in this status.
    pub status: Option<ContainerStatus>,
    /// Match only records owned by this unit.
    pub unit_id: Option<String>,
}

impl ContainerFilter {
    /// Filter matching one status.
    #[must_use]
    pub fn with_status(status: ContainerStatus) -> Self {
        Self {
            status: Some(status),
            unit_id: None,
        }
    }

    /// Filter matching one owning unit.
    #[must_use]
    pub fn for_unit(unit_id: impl Into<String>) -> Self {
        Self {
            status: None,
            unit_id: Some(unit_id.into()),
        }
    }
}
