//! JSONL event log writer with daily file rotation.

use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{NaiveDate, Utc};
use tracing::warn;

use super::EventLogger;
use crate::models::unit::UnitEvent;
use crate::{AppError, Result};

/// Internal state protected by a mutex.
struct WriterState {
    current_date: NaiveDate,
    writer: BufWriter<fs::File>,
}

/// A daily-rotating JSONL event writer.
///
/// Appends one JSON object per line to `<log_dir>/events-YYYY-MM-DD.jsonl`
/// and opens a new file when the calendar date changes between writes.
pub struct JsonlEventWriter {
    log_dir: PathBuf,
    state: Mutex<Option<WriterState>>,
}

impl JsonlEventWriter {
    /// Construct a writer that stores logs in `log_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&log_dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create event log directory {}: {e}",
                log_dir.display()
            ))
        })?;
        Ok(Self {
            log_dir,
            state: Mutex::new(None),
        })
    }

    /// Path of the file that receives events written on `date`.
    #[must_use]
    pub fn path_for_date(&self, date: NaiveDate) -> PathBuf {
        self.log_dir.join(format!("events-{date}.jsonl"))
    }

    fn open_for_date(log_dir: &Path, date: NaiveDate) -> Result<BufWriter<fs::File>> {
        let path = log_dir.join(format!("events-{date}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("failed to open event log {}: {e}", path.display())))?;
        Ok(BufWriter::new(file))
    }
}

impl EventLogger for JsonlEventWriter {
    fn log_event(&self, event: &UnitEvent) -> Result<()> {
        let today = Utc::now().date_naive();

        let mut guard = self
            .state
            .lock()
            .map_err(|_| AppError::Internal("event writer mutex poisoned".to_owned()))?;

        if guard.as_ref().is_none_or(|s| s.current_date != today) {
            *guard = Some(WriterState {
                current_date: today,
                writer: Self::open_for_date(&self.log_dir, today)?,
            });
        }

        if let Some(state) = guard.as_mut() {
            let line = serde_json::to_string(event)
                .map_err(|e| AppError::Internal(format!("failed to serialize event: {e}")))?;
            if let Err(e) = writeln!(state.writer, "{line}") {
                warn!(%e, "failed to write event log entry");
                return Err(AppError::Io(format!("event write failed: {e}")));
            }
            if let Err(e) = state.writer.flush() {
                warn!(%e, "failed to flush event log");
                return Err(AppError::Io(format!("event flush failed: {e}")));
            }
        }

        Ok(())
    }
}
