//! Launch strategy that runs a unit in a terminal multiplexer pane.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::TmuxConfig;
use crate::models::unit::LaunchMode;
use crate::multiplexer::{Multiplexer, PaneHandle, PaneRequest, PaneState};
use crate::process::shell_join;
use crate::sandbox::engine::BoxFuture;
use crate::sandbox::output::OutputCapture;
use crate::{AppError, Result};

use super::launcher::{Backing, BackingStatus, LaunchHandle, LaunchSpec, LaunchStrategy};

/// Characters of the unit id used in generated session names.
const SESSION_ID_CHARS: usize = 8;

/// Runs each unit's command in its own detached multiplexer session.
#[derive(Clone)]
pub struct PaneLauncher {
    mux: Arc<dyn Multiplexer>,
    session_prefix: String,
    default_width: u16,
    default_height: u16,
    max_output_bytes: usize,
}

impl PaneLauncher {
    /// Create a launcher over `mux` using the pane defaults in `config`.
    #[must_use]
    pub fn new(mux: Arc<dyn Multiplexer>, config: &TmuxConfig, max_output_bytes: usize) -> Self {
        Self {
            mux,
            session_prefix: config.session_prefix.clone(),
            default_width: config.default_width,
            default_height: config.default_height,
            max_output_bytes,
        }
    }

    /// Session name used for `unit_id` when the caller supplies none.
    #[must_use]
    pub fn session_name_for(&self, unit_id: &str) -> String {
        let short: String = unit_id.chars().take(SESSION_ID_CHARS).collect();
        format!("{}-{short}", self.session_prefix)
    }

    async fn capture_into(&self, pane_id: &str, output: &OutputCapture) {
        match self.mux.capture_pane(pane_id.to_owned()).await {
            Ok(snapshot) => output.replace_stdout(&snapshot),
            Err(err) => warn!(pane_id, %err, "failed to capture pane output"),
        }
    }
}

impl LaunchStrategy for PaneLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::TerminalPane
    }

    fn validate(&self, spec: &LaunchSpec) -> Result<()> {
        if let Some(ref name) = spec.pane.session_name {
            if name.trim().is_empty() || name.contains([':', '.']) {
                return Err(AppError::Validation(format!(
                    "session_name '{name}' must be non-empty and must not contain ':' or '.'"
                )));
            }
        }
        if spec.pane.width == Some(0) || spec.pane.height == Some(0) {
            return Err(AppError::Validation(
                "pane width and height must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    fn check_available(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.mux.is_available().await {
                Ok(())
            } else {
                Err(AppError::Validation(format!(
                    "terminal multiplexer '{}' is not available",
                    self.mux.name()
                )))
            }
        })
    }

    fn launch(&self, unit_id: String, spec: LaunchSpec) -> BoxFuture<'_, Result<LaunchHandle>> {
        Box::pin(async move {
            let request = PaneRequest {
                session_name: spec
                    .pane
                    .session_name
                    .clone()
                    .unwrap_or_else(|| self.session_name_for(&unit_id)),
                working_directory: spec.working_directory.clone(),
                width: spec.pane.width.unwrap_or(self.default_width),
                height: spec.pane.height.unwrap_or(self.default_height),
            };

            let pane = self
                .mux
                .create_pane(request)
                .await
                .map_err(|err| AppError::Launch(format!("pane creation failed: {err}")))?;

            let keys = format!("exec {}", shell_join(&spec.command));
            if let Err(err) = self.mux.send_keys(pane.pane_id.clone(), keys).await {
                if let Err(kill_err) = self.mux.kill_pane(pane.clone()).await {
                    warn!(unit_id, pane_id = %pane.pane_id, %kill_err, "failed to kill pane after launch failure");
                }
                return Err(AppError::Launch(format!(
                    "failed to start command in pane {}: {err}",
                    pane.pane_id
                )));
            }

            info!(unit_id, session = %pane.session_name, pane_id = %pane.pane_id, "unit pane launched");
            Ok(LaunchHandle {
                unit_id,
                backing_id: pane.pane_id.clone(),
                output: OutputCapture::new(self.max_output_bytes),
                backing: Backing::Pane(pane),
            })
        })
    }

    fn poll_status(&self, handle: LaunchHandle) -> BoxFuture<'_, Result<BackingStatus>> {
        Box::pin(async move {
            let Backing::Pane(ref pane) = handle.backing else {
                return Err(AppError::Internal(format!(
                    "unit {} has no pane backing",
                    handle.unit_id
                )));
            };

            match self.mux.pane_state(pane.pane_id.clone()).await? {
                PaneState::Alive => {
                    self.capture_into(&pane.pane_id, &handle.output).await;
                    Ok(BackingStatus::Running)
                }
                PaneState::Dead { exit_code } => {
                    self.capture_into(&pane.pane_id, &handle.output).await;
                    Ok(BackingStatus::Exited { exit_code })
                }
                PaneState::Missing => Ok(BackingStatus::Gone),
            }
        })
    }

    fn terminate(&self, handle: LaunchHandle) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match handle.backing {
                Backing::Pane(pane) => self.mux.kill_pane(pane).await,
                _ => Ok(()),
            }
        })
    }

    fn cleanup(
        &self,
        unit_id: String,
        handle: Option<LaunchHandle>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let pane = match handle {
                Some(LaunchHandle {
                    backing: Backing::Pane(pane),
                    ..
                }) => pane,
                _ => PaneHandle {
                    session_name: self.session_name_for(&unit_id),
                    pane_id: String::new(),
                },
            };
            self.mux.kill_pane(pane).await
        })
    }
}
