//! Public "run a command in isolation" surface.
//!
//! [`SandboxTool`] validates every request against the sandbox policy
//! before delegating to [`ContainerRunner`]. Out-of-policy requests are
//! rejected with `AppError::Validation` and cause no side effect.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::config::{SandboxCeilings, SandboxConfig};
use crate::models::sandbox::{ContainerRunResult, ResourceLimits};
use crate::{AppError, Result};

use super::output::OutputCapture;
use super::runner::{ContainerRunner, RunRequest};

const CONTAINER_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$";

/// Sandbox lifecycle action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxAction {
    /// Run a command in a fresh container.
    Run,
    /// Run a command in an existing running container.
    Exec,
    /// Stop a container.
    Stop,
    /// Force-remove a container.
    Remove,
}

impl SandboxAction {
    /// Parse a wire action name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unknown names.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "run" => Ok(Self::Run),
            "exec" | "exec_in_existing" => Ok(Self::Exec),
            "stop" => Ok(Self::Stop),
            "remove" => Ok(Self::Remove),
            other => Err(AppError::Validation(format!(
                "invalid sandbox action '{other}'; expected one of: run, exec, stop, remove"
            ))),
        }
    }
}

/// Parameters for [`SandboxTool::execute`]. Which fields apply depends on
/// the action.
#[derive(Debug, Clone, Default)]
pub struct SandboxParams {
    /// Command argv for `run` and `exec`.
    pub command: Vec<String>,
    /// Target container for `exec`, `stop`, and `remove`.
    pub container_id: Option<String>,
    /// Resource limits for `run`.
    pub limits: ResourceLimits,
    /// Execution timeout; the policy default applies when absent.
    pub timeout: Option<Duration>,
    /// Working directory inside the container for `run`.
    pub working_dir: Option<String>,
    /// Keep the container after a normal exit (`run` only).
    pub retain: bool,
    /// Owning unit recorded on the container (`run` only).
    pub unit_id: Option<String>,
}

/// Ceilings enforced on sandbox requests.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    /// Resource limit ceilings.
    pub ceilings: SandboxCeilings,
    /// Timeout used when the caller supplies none.
    pub default_timeout: Duration,
    /// Largest timeout a caller may request.
    pub max_timeout: Duration,
}

impl SandboxPolicy {
    /// Derive the policy from sandbox configuration.
    #[must_use]
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            ceilings: config.ceilings.clone(),
            default_timeout: config.default_timeout(),
            max_timeout: config.max_timeout(),
        }
    }

    /// Resolve and bound a caller-supplied timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for a zero timeout or one above the
    /// ceiling.
    pub fn resolve_timeout(&self, requested: Option<Duration>) -> Result<Duration> {
        let timeout = requested.unwrap_or(self.default_timeout);
        if timeout.is_zero() {
            return Err(AppError::Validation(
                "timeout must be greater than zero".into(),
            ));
        }
        if timeout > self.max_timeout {
            return Err(AppError::Validation(format!(
                "timeout of {}ms exceeds the maximum of {}ms",
                timeout.as_millis(),
                self.max_timeout.as_millis()
            )));
        }
        Ok(timeout)
    }
}

/// Validating front end over [`ContainerRunner`].
#[derive(Clone)]
pub struct SandboxTool {
    runner: ContainerRunner,
    policy: SandboxPolicy,
    id_pattern: Regex,
}

impl SandboxTool {
    /// Create the tool.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the container id pattern fails to compile.
    pub fn new(runner: ContainerRunner, policy: SandboxPolicy) -> Result<Self> {
        let id_pattern = Regex::new(CONTAINER_ID_PATTERN)
            .map_err(|err| AppError::Config(format!("invalid container id pattern: {err}")))?;
        Ok(Self {
            runner,
            policy,
            id_pattern,
        })
    }

    /// The runner requests are delegated to.
    #[must_use]
    pub fn runner(&self) -> &ContainerRunner {
        &self.runner
    }

    /// The enforced policy.
    #[must_use]
    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Validate `params` for `action` and return the effective timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` describing the first violation.
    pub fn validate(&self, action: SandboxAction, params: &SandboxParams) -> Result<Duration> {
        match action {
            SandboxAction::Run => {
                validate_command(&params.command)?;
                params.limits.validate(&self.policy.ceilings)?;
            }
            SandboxAction::Exec => {
                validate_command(&params.command)?;
                self.require_container_id(params)?;
            }
            SandboxAction::Stop | SandboxAction::Remove => {
                self.require_container_id(params)?;
            }
        }
        self.policy.resolve_timeout(params.timeout)
    }

    fn require_container_id<'a>(&self, params: &'a SandboxParams) -> Result<&'a str> {
        let id = params
            .container_id
            .as_deref()
            .ok_or_else(|| AppError::Validation("container_id is required".into()))?;
        if !self.id_pattern.is_match(id) {
            return Err(AppError::Validation(format!(
                "container_id '{id}' is not a valid container identifier"
            )));
        }
        Ok(id)
    }

    /// Validate and execute `action`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for out-of-policy requests, otherwise
    /// whatever the runner reports.
    pub async fn execute(
        &self,
        action: SandboxAction,
        params: SandboxParams,
    ) -> Result<ContainerRunResult> {
        self.execute_with(
            action,
            params,
            self.runner.new_capture(),
            CancellationToken::new(),
        )
        .await
    }

    /// Validate and execute `action`, streaming output into `output` and
    /// honouring `cancel` for `run` and `exec`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for out-of-policy requests, otherwise
    /// whatever the runner reports.
    pub async fn execute_with(
        &self,
        action: SandboxAction,
        params: SandboxParams,
        output: OutputCapture,
        cancel: CancellationToken,
    ) -> Result<ContainerRunResult> {
        let timeout = self.validate(action, &params)?;
        let span = info_span!("sandbox_execute", ?action, ?timeout);

        async move {
            match action {
                SandboxAction::Run => {
                    let request = RunRequest {
                        command: params.command,
                        limits: params.limits,
                        timeout,
                        working_dir: params.working_dir,
                        unit_id: params.unit_id,
                        retain: params.retain,
                    };
                    self.runner.run_with(request, output, cancel).await
                }
                SandboxAction::Exec => {
                    let id = self.require_container_id(&params)?.to_owned();
                    self.runner
                        .exec_existing(&id, params.command, timeout, output, cancel)
                        .await
                }
                SandboxAction::Stop => {
                    let id = self.require_container_id(&params)?;
                    self.runner.stop(id).await
                }
                SandboxAction::Remove => {
                    let id = self.require_container_id(&params)?;
                    self.runner.remove(id).await
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn validate_command(command: &[String]) -> Result<()> {
    match command.first() {
        None => Err(AppError::Validation("command must not be empty".into())),
        Some(program) if program.trim().is_empty() => Err(AppError::Validation(
            "command program must not be blank".into(),
        )),
        Some(_) => Ok(()),
    }
}
