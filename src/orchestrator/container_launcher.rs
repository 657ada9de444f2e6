//! Launch strategy that runs a unit inside a sandbox container.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::models::sandbox::RunOutcome;
use crate::models::unit::LaunchMode;
use crate::sandbox::engine::BoxFuture;
use crate::sandbox::{SandboxAction, SandboxParams, SandboxTool};
use crate::{AppError, Result};

use super::launcher::{
    Backing, BackingStatus, ContainerOutcome, LaunchHandle, LaunchSpec, LaunchStrategy,
};

/// Runs each unit's command in a fresh container through [`SandboxTool`].
///
/// `launch` returns once the container is started; the command itself
/// executes in a background task whose result is picked up by
/// [`LaunchStrategy::poll_status`].
#[derive(Clone)]
pub struct ContainerLauncher {
    sandbox: SandboxTool,
}

impl ContainerLauncher {
    /// Create a launcher that validates and runs through `sandbox`.
    #[must_use]
    pub fn new(sandbox: SandboxTool) -> Self {
        Self { sandbox }
    }

    fn params_for(spec: &LaunchSpec, unit_id: Option<String>) -> SandboxParams {
        SandboxParams {
            command: spec.command.clone(),
            container_id: None,
            limits: spec.limits.clone(),
            timeout: Some(spec.timeout),
            working_dir: spec.working_directory.clone(),
            retain: false,
            unit_id,
        }
    }
}

impl LaunchStrategy for ContainerLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Container
    }

    fn validate(&self, spec: &LaunchSpec) -> Result<()> {
        self.sandbox
            .validate(SandboxAction::Run, &Self::params_for(spec, None))
            .map(|_| ())
    }

    fn check_available(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let engine = self.sandbox.runner().engine();
            if engine.is_available().await {
                Ok(())
            } else {
                Err(AppError::Validation(format!(
                    "container engine '{}' is not available",
                    engine.name()
                )))
            }
        })
    }

    fn launch(&self, unit_id: String, spec: LaunchSpec) -> BoxFuture<'_, Result<LaunchHandle>> {
        Box::pin(async move {
            let runner = self.sandbox.runner().clone();
            let container = runner
                .start_container(
                    &spec.limits,
                    spec.working_directory.clone(),
                    Some(unit_id.clone()),
                )
                .await?;
            let container_id = container.container_id.clone();

            let output = runner.new_capture();
            let cancel = CancellationToken::new();
            let (tx, rx) = watch::channel::<ContainerOutcome>(None);

            let task_output = output.clone();
            let task_cancel = cancel.clone();
            let span = tracing::info_span!("unit_container_exec", unit_id = %unit_id, container_id = %container_id);
            tokio::spawn(
                async move {
                    let result = runner
                        .run_started(
                            container,
                            spec.command,
                            spec.timeout,
                            false,
                            task_output,
                            task_cancel,
                        )
                        .await
                        .map_err(|err| err.to_string());
                    tx.send_replace(Some(result));
                }
                .instrument(span),
            );

            info!(unit_id, container_id, "unit container launched");
            Ok(LaunchHandle {
                unit_id,
                backing_id: container_id,
                output,
                backing: Backing::Container {
                    outcome: rx,
                    cancel,
                },
            })
        })
    }

    fn poll_status(&self, handle: LaunchHandle) -> BoxFuture<'_, Result<BackingStatus>> {
        Box::pin(async move {
            let Backing::Container { outcome, .. } = handle.backing else {
                return Err(AppError::Internal(format!(
                    "unit {} has no container backing",
                    handle.unit_id
                )));
            };

            // Closed is read first: the task publishes before dropping the sender.
            let closed = outcome.has_changed().is_err();
            let current = outcome.borrow().clone();
            let status = match current {
                None if closed => BackingStatus::Failed {
                    error: "container exec task ended without a result".into(),
                },
                None => BackingStatus::Running,
                Some(Ok(result)) => match result.outcome {
                    RunOutcome::Exited => BackingStatus::Exited {
                        exit_code: result.exit_code,
                    },
                    RunOutcome::TimedOut => BackingStatus::TimedOut,
                    RunOutcome::Cancelled => BackingStatus::Cancelled,
                    RunOutcome::Stopped | RunOutcome::Removed => BackingStatus::Gone,
                },
                Some(Err(error)) => BackingStatus::Failed { error },
            };
            Ok(status)
        })
    }

    fn terminate(&self, handle: LaunchHandle) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Backing::Container { cancel, .. } = handle.backing {
                cancel.cancel();
            }
            Ok(())
        })
    }

    fn cleanup(
        &self,
        unit_id: String,
        handle: Option<LaunchHandle>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(LaunchHandle {
                backing: Backing::Container { cancel, .. },
                ..
            }) = handle
            {
                cancel.cancel();
            }
            let removed = self
                .sandbox
                .runner()
                .remove_unit_containers(&unit_id)
                .await?;
            if removed > 0 {
                warn!(unit_id, removed, "removed leftover unit containers");
            }
            Ok(())
        })
    }
}
