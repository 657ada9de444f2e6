//! Child agent orchestration.
//!
//! Covers the launch strategies (container and terminal pane), the unit
//! tracker and its per-unit monitors, and lifecycle event fan-out.

pub mod container_launcher;
pub mod events;
pub mod launcher;
mod monitor;
pub mod pane_launcher;
pub mod tracker;

pub use container_launcher::ContainerLauncher;
pub use events::{ChannelSink, EventSink, NullSink, RecordingSink};
pub use launcher::{
    Backing, BackingStatus, LaunchHandle, LaunchSpec, LaunchStrategy, PaneOptions,
};
pub use pane_launcher::PaneLauncher;
pub use tracker::{CompletionCallback, SubAgentTracker, TrackerSettings};
