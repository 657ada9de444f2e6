//! `tmux` implementation of [`Multiplexer`].

use tracing::{debug, warn};

use crate::process::{run_cli, CliOutput};
use crate::sandbox::engine::BoxFuture;
use crate::{AppError, Result};

use super::{Multiplexer, PaneHandle, PaneRequest, PaneState};

/// Lines of scrollback included in captures.
const CAPTURE_HISTORY_LINES: &str = "-2000";

/// [`Multiplexer`] that shells out to the `tmux` CLI.
#[derive(Debug, Clone)]
pub struct TmuxCli {
    binary: String,
}

impl TmuxCli {
    /// Create a multiplexer driving `binary`.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn invoke(&self, args: Vec<String>) -> Result<CliOutput> {
        run_cli(&self.binary, &args).await.map_err(|err| {
            AppError::Multiplexer(format!("failed to invoke {}: {err}", self.binary))
        })
    }

    async fn invoke_ok(&self, what: &str, args: Vec<String>) -> Result<CliOutput> {
        let out = self.invoke(args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(AppError::Multiplexer(format!(
                "{what} failed: {}",
                out.diagnostic()
            )))
        }
    }

    /// Check the new pane id and keep the pane after its process exits.
    async fn prepare_session(&self, handle: &PaneHandle) -> Result<()> {
        if handle.pane_id.is_empty() {
            return Err(AppError::Multiplexer(
                "new-session returned no pane id".into(),
            ));
        }
        self.invoke_ok(
            "set remain-on-exit",
            vec![
                "set-window-option".into(),
                "-t".into(),
                handle.session_name.clone(),
                "remain-on-exit".into(),
                "on".into(),
            ],
        )
        .await?;
        Ok(())
    }
}

/// Whether tmux stderr says the target does not exist.
fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("can't find") || lower.contains("no server running") || lower.contains("session not found")
}

/// Parse `#{pane_dead} #{pane_dead_status}` output.
#[must_use]
pub fn parse_pane_state(raw: &str) -> Option<PaneState> {
    let mut parts = raw.split_whitespace();
    match parts.next()? {
        "0" => Some(PaneState::Alive),
        "1" => Some(PaneState::Dead {
            exit_code: parts.next().and_then(|code| code.parse().ok()),
        }),
        _ => None,
    }
}

impl Multiplexer for TmuxCli {
    fn name(&self) -> &str {
        &self.binary
    }

    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match run_cli(&self.binary, ["-V"]).await {
                Ok(out) => out.success(),
                Err(err) => {
                    debug!(binary = %self.binary, %err, "multiplexer not available");
                    false
                }
            }
        })
    }

    fn create_pane(&self, request: PaneRequest) -> BoxFuture<'_, Result<PaneHandle>> {
        Box::pin(async move {
            let mut args = vec![
                "new-session".to_owned(),
                "-d".into(),
                "-s".into(),
                request.session_name.clone(),
                "-x".into(),
                request.width.to_string(),
                "-y".into(),
                request.height.to_string(),
            ];
            if let Some(dir) = request.working_directory {
                args.push("-c".into());
                args.push(dir);
            }
            args.extend(["-P".into(), "-F".into(), "#{pane_id}".into()]);

            let out = self.invoke_ok("new-session", args).await?;
            let handle = PaneHandle {
                session_name: request.session_name,
                pane_id: out.stdout.trim().to_owned(),
            };
            if let Err(err) = self.prepare_session(&handle).await {
                if let Err(kill_err) = self.kill_pane(handle.clone()).await {
                    warn!(session = %handle.session_name, %kill_err, "failed to kill half-created session");
                }
                return Err(err);
            }
            Ok(handle)
        })
    }

    fn send_keys(&self, pane_id: String, keys: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.invoke_ok(
                "send-keys",
                vec!["send-keys".into(), "-t".into(), pane_id.clone(), "-l".into(), keys],
            )
            .await?;
            self.invoke_ok(
                "send-keys",
                vec!["send-keys".into(), "-t".into(), pane_id, "Enter".into()],
            )
            .await?;
            Ok(())
        })
    }

    fn capture_pane(&self, pane_id: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let out = self
                .invoke_ok(
                    "capture-pane",
                    vec![
                        "capture-pane".into(),
                        "-p".into(),
                        "-J".into(),
                        "-t".into(),
                        pane_id,
                        "-S".into(),
                        CAPTURE_HISTORY_LINES.into(),
                    ],
                )
                .await?;
            Ok(out.stdout)
        })
    }

    fn pane_state(&self, pane_id: String) -> BoxFuture<'_, Result<PaneState>> {
        Box::pin(async move {
            let out = self
                .invoke(vec![
                    "display-message".into(),
                    "-p".into(),
                    "-t".into(),
                    pane_id,
                    "#{pane_dead} #{pane_dead_status}".into(),
                ])
                .await?;
            if !out.success() {
                if is_missing(&out.stderr) {
                    return Ok(PaneState::Missing);
                }
                return Err(AppError::Multiplexer(format!(
                    "display-message failed: {}",
                    out.diagnostic()
                )));
            }
            parse_pane_state(&out.stdout).ok_or_else(|| {
                AppError::Multiplexer(format!("unexpected pane state output: {}", out.stdout))
            })
        })
    }

    fn kill_pane(&self, handle: PaneHandle) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let out = self
                .invoke(vec![
                    "kill-session".into(),
                    "-t".into(),
                    handle.session_name,
                ])
                .await?;
            if out.success() || is_missing(&out.stderr) {
                Ok(())
            } else {
                Err(AppError::Multiplexer(format!(
                    "kill-session failed: {}",
                    out.diagnostic()
                )))
            }
        })
    }
}
