//! Durable lifecycle event log.
//!
//! Provides the [`EventLogger`] trait. The primary implementation,
//! [`JsonlEventWriter`], appends one JSON object per unit event to
//! daily-rotating files under the configured events directory.

pub mod writer;

use crate::models::unit::UnitEvent;
use crate::Result;

pub use writer::JsonlEventWriter;

/// Persists lifecycle events.
pub trait EventLogger: Send + Sync {
    /// Persist one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or written.
    fn log_event(&self, event: &UnitEvent) -> Result<()>;
}
