//! Container engine backed by the `docker` or `podman` CLI.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::models::container::UNKNOWN_EXIT_CODE;
use crate::process::run_cli;
use crate::{AppError, Result};

use super::engine::{BoxFuture, ContainerEngine, ContainerSpec, EngineState};
use super::output::{OutputCapture, Stream};

/// [`ContainerEngine`] that shells out to a Docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct CliEngine {
    binary: String,
}

impl CliEngine {
    /// Create an engine driving `binary` (e.g. `docker` or `podman`).
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn invoke(&self, args: Vec<String>) -> Result<crate::process::CliOutput> {
        run_cli(&self.binary, &args).await.map_err(|err| {
            AppError::Container(format!("failed to invoke {}: {err}", self.binary))
        })
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("no such container")
}

/// Arguments for `create`, excluding the binary.
#[must_use]
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_owned()];
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    if let Some(memory) = spec.limits.memory_mb {
        args.push("--memory".into());
        args.push(format!("{memory}m"));
    }
    if let Some(cpus) = spec.limits.cpus {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }
    if let Some(pids) = spec.limits.pids {
        args.push("--pids-limit".into());
        args.push(pids.to_string());
    }
    if let Some(ref dir) = spec.working_dir {
        args.push("--workdir".into());
        args.push(dir.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.entrypoint.iter().cloned());
    args
}

/// Parse `inspect --format '{{.State.Running}} {{.State.ExitCode}}'` output.
#[must_use]
pub fn parse_inspect(raw: &str) -> Option<EngineState> {
    let mut parts = raw.split_whitespace();
    let running = match parts.next()? {
        "true" => true,
        "false" => false,
        _ => return None,
    };
    let exit_code = parts.next().and_then(|code| code.parse().ok());
    Some(EngineState {
        running,
        exit_code: if running { None } else { exit_code },
    })
}

async fn pump<R>(reader: Option<R>, output: OutputCapture, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => output.push_line(stream, &line),
            Ok(None) => break,
            Err(err) => {
                warn!(%err, ?stream, "failed to read exec output");
                break;
            }
        }
    }
}

impl ContainerEngine for CliEngine {
    fn name(&self) -> &str {
        &self.binary
    }

    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match run_cli(&self.binary, ["info", "--format", "{{.ServerVersion}}"]).await {
                Ok(out) => out.success(),
                Err(err) => {
                    debug!(binary = %self.binary, %err, "container engine not available");
                    false
                }
            }
        })
    }

    fn create(&self, spec: ContainerSpec) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let out = self.invoke(create_args(&spec)).await?;
            if !out.success() {
                return Err(AppError::Container(format!(
                    "create failed: {}",
                    out.diagnostic()
                )));
            }
            let id = out.stdout.lines().last().unwrap_or_default().trim().to_owned();
            if id.is_empty() {
                return Err(AppError::Container(
                    "create returned no container id".into(),
                ));
            }
            Ok(id)
        })
    }

    fn start(&self, container_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let out = self.invoke(vec!["start".into(), container_id]).await?;
            if out.success() {
                Ok(())
            } else {
                Err(AppError::Container(format!(
                    "start failed: {}",
                    out.diagnostic()
                )))
            }
        })
    }

    fn exec(
        &self,
        container_id: String,
        command: Vec<String>,
        output: OutputCapture,
    ) -> BoxFuture<'_, Result<i32>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.binary);
            cmd.arg("exec")
                .arg(&container_id)
                .args(&command)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd
                .spawn()
                .map_err(|err| AppError::Container(format!("failed to spawn exec: {err}")))?;

            let stdout = pump(child.stdout.take(), output.clone(), Stream::Stdout);
            let stderr = pump(child.stderr.take(), output, Stream::Stderr);
            let (status, (), ()) = tokio::join!(child.wait(), stdout, stderr);

            let status =
                status.map_err(|err| AppError::Container(format!("exec wait failed: {err}")))?;
            Ok(status.code().unwrap_or(UNKNOWN_EXIT_CODE))
        })
    }

    fn stop(&self, container_id: String, grace: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let out = self
                .invoke(vec![
                    "stop".into(),
                    "--time".into(),
                    grace.as_secs().to_string(),
                    container_id,
                ])
                .await?;
            if out.success() || is_missing(&out.stderr) {
                Ok(())
            } else {
                Err(AppError::Container(format!("stop failed: {}", out.diagnostic())))
            }
        })
    }

    fn remove(&self, container_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let out = self
                .invoke(vec!["rm".into(), "--force".into(), container_id])
                .await?;
            if out.success() || is_missing(&out.stderr) {
                Ok(())
            } else {
                Err(AppError::Container(format!(
                    "remove failed: {}",
                    out.diagnostic()
                )))
            }
        })
    }

    fn inspect(&self, container_id: String) -> BoxFuture<'_, Result<Option<EngineState>>> {
        Box::pin(async move {
            let out = self
                .invoke(vec![
                    "inspect".into(),
                    "--format".into(),
                    "{{.State.Running}} {{.State.ExitCode}}".into(),
                    container_id,
                ])
                .await?;
            if !out.success() {
                if is_missing(&out.stderr) {
                    return Ok(None);
                }
                return Err(AppError::Container(format!(
                    "inspect failed: {}",
                    out.diagnostic()
                )));
            }
            parse_inspect(&out.stdout).map(Some).ok_or_else(|| {
                AppError::Container(format!("unexpected inspect output: {}", out.stdout))
            })
        })
    }
}
