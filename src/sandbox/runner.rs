//! Container lifecycle execution.
//!
//! A run creates a container around an idle entrypoint, starts it, execs the
//! requested command under a timeout, and tears the container down again.
//! Every path resolves to either a [`ContainerRunResult`] or an error, and
//! no path leaves a registry record in `running` for a container that was
//! torn down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{SandboxConfig, STOP_SLACK_SECONDS};
use crate::models::container::{
    ContainerFilter, ContainerPatch, ContainerStatus, NewContainer, UNKNOWN_EXIT_CODE,
};
use crate::models::sandbox::{ContainerRunResult, ResourceLimits, RunOutcome};
use crate::persistence::container_registry::ContainerRegistry;
use crate::{AppError, Result};

use super::engine::{ContainerEngine, ContainerSpec, UNIT_LABEL};
use super::output::OutputCapture;

/// Extra time allowed for the engine to honour a stop before giving up on it.
const STOP_SLACK: Duration = Duration::from_secs(STOP_SLACK_SECONDS);

/// Static settings applied to every container the runner creates.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Image for new containers.
    pub image: String,
    /// Idle entrypoint for new containers.
    pub idle_command: Vec<String>,
    /// Grace period between stop and force removal.
    pub stop_grace: Duration,
    /// Per-stream output capture limit.
    pub max_output_bytes: usize,
}

impl RunnerSettings {
    /// Derive runner settings from the sandbox configuration.
    #[must_use]
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            image: config.image.clone(),
            idle_command: config.idle_command.clone(),
            stop_grace: config.stop_grace(),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// One `run` invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Command executed inside the container.
    pub command: Vec<String>,
    /// Resource limits for the new container.
    pub limits: ResourceLimits,
    /// Execution timeout for the command.
    pub timeout: Duration,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Owning unit, recorded on the container and its registry record.
    pub unit_id: Option<String>,
    /// Keep the container alive after a normal exit.
    pub retain: bool,
}

/// Outcome counts from startup reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records in `created` or `running` that were checked.
    pub inspected: usize,
    /// Records moved to `exited` because the container was gone or stopped.
    pub marked_exited: usize,
    /// Unit containers found running and torn down.
    pub torn_down: usize,
    /// Containers without an owning unit that are still running and were
    /// left for a later `exec`, `stop`, or `remove`.
    pub still_running: usize,
}

/// Exclusive claim on a container id, released on drop.
#[derive(Debug)]
pub struct Lease {
    leases: Arc<DashMap<String, ()>>,
    container_id: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leases.remove(&self.container_id);
    }
}

/// A container that has been created, registered, and started, together
/// with the lease that keeps other invocations away from it.
#[derive(Debug)]
pub struct StartedContainer {
    /// Engine-assigned identifier.
    pub container_id: String,
    lease: Lease,
    started: Instant,
}

/// Executes lifecycle actions against a [`ContainerEngine`] and persists the
/// resulting state in the [`ContainerRegistry`].
#[derive(Clone)]
pub struct ContainerRunner {
    engine: Arc<dyn ContainerEngine>,
    registry: ContainerRegistry,
    settings: RunnerSettings,
    leases: Arc<DashMap<String, ()>>,
}

impl ContainerRunner {
    /// Create a runner.
    #[must_use]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: ContainerRegistry,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            engine,
            registry,
            settings,
            leases: Arc::new(DashMap::new()),
        }
    }

    /// The engine this runner drives.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// The registry this runner records into.
    #[must_use]
    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    /// A fresh output capture sized by the runner settings.
    #[must_use]
    pub fn new_capture(&self) -> OutputCapture {
        OutputCapture::new(self.settings.max_output_bytes)
    }

    /// Whether some invocation currently holds `container_id`.
    #[must_use]
    pub fn is_leased(&self, container_id: &str) -> bool {
        self.leases.contains_key(container_id)
    }

    /// Claim exclusive use of `container_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if another invocation holds it.
    pub fn acquire(&self, container_id: &str) -> Result<Lease> {
        match self.leases.entry(container_id.to_owned()) {
            Entry::Occupied(_) => Err(AppError::Validation(format!(
                "container {container_id} is in use by another invocation"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Lease {
                    leases: Arc::clone(&self.leases),
                    container_id: container_id.to_owned(),
                })
            }
        }
    }

    /// Create, register, and start a container.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the engine cannot create or start the
    /// container. A container that was created but failed to start is
    /// removed on a best-effort basis and never left `running`.
    pub async fn start_container(
        &self,
        limits: &ResourceLimits,
        working_dir: Option<String>,
        unit_id: Option<String>,
    ) -> Result<StartedContainer> {
        let started = Instant::now();
        let mut labels = Vec::new();
        if let Some(ref unit) = unit_id {
            labels.push((UNIT_LABEL.to_owned(), unit.clone()));
        }
        let spec = ContainerSpec {
            image: self.settings.image.clone(),
            entrypoint: self.settings.idle_command.clone(),
            limits: limits.clone(),
            working_dir,
            labels,
        };

        let container_id = self
            .engine
            .create(spec)
            .await
            .map_err(|err| AppError::Launch(format!("container create failed: {err}")))?;
        let lease = self.acquire(&container_id)?;

        let registered = self
            .registry
            .create(&NewContainer {
                container_id: container_id.clone(),
                image: self.settings.image.clone(),
                unit_id,
            })
            .await;
        if let Err(err) = registered {
            if let Err(remove_err) = self.engine.remove(container_id.clone()).await {
                warn!(container_id, %remove_err, "failed to remove unregistered container");
            }
            return Err(AppError::Launch(format!(
                "failed to register container {container_id}: {err}"
            )));
        }

        if let Err(err) = self.engine.start(container_id.clone()).await {
            self.discard(&container_id).await;
            return Err(AppError::Launch(format!(
                "container {container_id} failed to start: {err}"
            )));
        }

        if let Err(err) = self
            .registry
            .update(&container_id, ContainerPatch::status(ContainerStatus::Running))
            .await
        {
            self.discard(&container_id).await;
            return Err(AppError::Launch(format!(
                "failed to record container {container_id} as running: {err}"
            )));
        }

        info!(container_id, engine = self.engine.name(), "container started");
        Ok(StartedContainer {
            container_id,
            lease,
            started,
        })
    }

    /// Run a command in a fresh container with its own capture and no
    /// external cancellation.
    ///
    /// # Errors
    ///
    /// See [`Self::run_with`].
    pub async fn run(&self, request: RunRequest) -> Result<ContainerRunResult> {
        self.run_with(request, self.new_capture(), CancellationToken::new())
            .await
    }

    /// Run a command in a fresh container, streaming output into `output`
    /// and honouring `cancel`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty command,
    /// `AppError::Launch` if the container cannot be started, or
    /// `AppError::Container` if the exec itself fails.
    pub async fn run_with(
        &self,
        request: RunRequest,
        output: OutputCapture,
        cancel: CancellationToken,
    ) -> Result<ContainerRunResult> {
        if request.command.is_empty() {
            return Err(AppError::Validation("command must not be empty".into()));
        }

        let container = self
            .start_container(
                &request.limits,
                request.working_dir.clone(),
                request.unit_id.clone(),
            )
            .await?;
        self.run_started(
            container,
            request.command,
            request.timeout,
            request.retain,
            output,
            cancel,
        )
        .await
    }

    /// Exec `command` in a container returned by [`Self::start_container`]
    /// and tear it down afterwards unless `retain` is set and the command
    /// exited on its own. The lease is released when this returns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Container` if the exec itself fails; the
    /// container is torn down first.
    pub async fn run_started(
        &self,
        container: StartedContainer,
        command: Vec<String>,
        timeout: Duration,
        retain: bool,
        output: OutputCapture,
        cancel: CancellationToken,
    ) -> Result<ContainerRunResult> {
        let StartedContainer {
            container_id,
            lease,
            started,
        } = container;
        let span = info_span!("container_run", container_id = %container_id);
        let result = self
            .execute(
                &container_id,
                command,
                timeout,
                retain,
                output,
                cancel,
                started,
            )
            .instrument(span)
            .await;
        drop(lease);
        result
    }

    /// Run a command in an existing running container. The container is
    /// kept after a normal exit and torn down on timeout or cancellation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids, `AppError::Validation`
    /// if the container is not running or is held by another invocation,
    /// or `AppError::Container` if the exec fails.
    pub async fn exec_existing(
        &self,
        container_id: &str,
        command: Vec<String>,
        timeout: Duration,
        output: OutputCapture,
        cancel: CancellationToken,
    ) -> Result<ContainerRunResult> {
        if command.is_empty() {
            return Err(AppError::Validation("command must not be empty".into()));
        }

        let lease = self.acquire(container_id)?;
        let record = self.registry.get(container_id).await?;
        if record.status != ContainerStatus::Running {
            return Err(AppError::Validation(format!(
                "container {container_id} is {}, not running",
                record.status
            )));
        }

        let span = info_span!("container_exec", container_id = %container_id);
        let result = self
            .execute(
                container_id,
                command,
                timeout,
                true,
                output,
                cancel,
                Instant::now(),
            )
            .instrument(span)
            .await;
        drop(lease);
        result
    }

    #[allow(clippy::too_many_arguments)] // Internal helper shared by run and exec paths.
    async fn execute(
        &self,
        container_id: &str,
        command: Vec<String>,
        timeout: Duration,
        retain: bool,
        output: OutputCapture,
        cancel: CancellationToken,
        started: Instant,
    ) -> Result<ContainerRunResult> {
        let exec = self
            .engine
            .exec(container_id.to_owned(), command, output.clone());

        let (outcome, exit_code) = tokio::select! {
            res = tokio::time::timeout(timeout, exec) => match res {
                Ok(Ok(code)) => (RunOutcome::Exited, Some(code)),
                Ok(Err(err)) => {
                    self.teardown(container_id, None).await;
                    return Err(AppError::Container(format!(
                        "exec in container {container_id} failed: {err}"
                    )));
                }
                Err(_) => (RunOutcome::TimedOut, None),
            },
            () = cancel.cancelled() => (RunOutcome::Cancelled, None),
        };

        let retained = retain && outcome == RunOutcome::Exited;
        if retained {
            if let Err(err) = self.registry.touch(container_id).await {
                warn!(container_id, %err, "failed to touch retained container");
            }
        } else {
            self.teardown(container_id, exit_code).await;
        }

        match outcome {
            RunOutcome::TimedOut => warn!(container_id, ?timeout, "container command timed out"),
            RunOutcome::Cancelled => info!(container_id, "container command cancelled"),
            _ => info!(container_id, exit_code, "container command exited"),
        }

        Ok(ContainerRunResult {
            container_id: container_id.to_owned(),
            outcome,
            exit_code,
            stdout: output.stdout(),
            stderr: output.stderr(),
            truncated: output.is_truncated(),
            retained,
            duration_ms: elapsed_ms(started),
        })
    }

    /// Stop a container without removing it.
    ///
    /// Stopping an already exited container succeeds and reports its
    /// recorded exit code.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids, `AppError::Validation`
    /// for removed or leased containers, or `AppError::Container` if the
    /// engine refuses.
    pub async fn stop(&self, container_id: &str) -> Result<ContainerRunResult> {
        let record = self.registry.get(container_id).await?;
        match record.status {
            ContainerStatus::Removed => {
                return Err(AppError::Validation(format!(
                    "container {container_id} has been removed"
                )));
            }
            ContainerStatus::Exited => {
                let mut result = ContainerRunResult::lifecycle(container_id, RunOutcome::Stopped);
                result.exit_code = record.exit_code;
                return Ok(result);
            }
            ContainerStatus::Created | ContainerStatus::Running => {}
        }

        let _lease = self.acquire(container_id)?;
        let started = Instant::now();
        self.engine
            .stop(container_id.to_owned(), self.settings.stop_grace)
            .await?;
        let exit_code = self.probe_exit_code(container_id).await;
        self.registry
            .update(container_id, ContainerPatch::exited(exit_code))
            .await?;
        info!(container_id, exit_code, "container stopped");

        let mut result = ContainerRunResult::lifecycle(container_id, RunOutcome::Stopped);
        result.exit_code = Some(exit_code);
        result.duration_ms = elapsed_ms(started);
        Ok(result)
    }

    /// Force-remove a container. Removing an already removed container
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids, `AppError::Validation`
    /// for leased containers, or `AppError::Container` if the engine refuses.
    pub async fn remove(&self, container_id: &str) -> Result<ContainerRunResult> {
        let record = self.registry.get(container_id).await?;
        let mut result = ContainerRunResult::lifecycle(container_id, RunOutcome::Removed);
        result.exit_code = record.exit_code;
        if record.status == ContainerStatus::Removed {
            return Ok(result);
        }

        let _lease = self.acquire(container_id)?;
        let started = Instant::now();
        self.engine.remove(container_id.to_owned()).await?;
        self.registry.remove(container_id).await?;
        info!(container_id, "container removed");

        result.duration_ms = elapsed_ms(started);
        Ok(result)
    }

    /// Force-remove every non-removed container owned by `unit_id`.
    ///
    /// Returns the number of containers removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be listed.
    pub async fn remove_unit_containers(&self, unit_id: &str) -> Result<usize> {
        let records = self.registry.list(&ContainerFilter::for_unit(unit_id)).await?;
        let mut removed = 0;
        for record in records
            .into_iter()
            .filter(|r| r.status != ContainerStatus::Removed)
        {
            self.discard(&record.container_id).await;
            removed += 1;
        }
        Ok(removed)
    }

    /// Align `created`/`running` records with the engine after a restart.
    ///
    /// Records whose container no longer exists are marked `exited` with
    /// [`UNKNOWN_EXIT_CODE`]; stopped containers get their real exit code.
    /// Units never outlive the process that spawned them, so a running
    /// container owned by a unit is torn down. Running containers with no
    /// owning unit are left in place.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be listed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for status in [ContainerStatus::Created, ContainerStatus::Running] {
            let records = self
                .registry
                .list(&ContainerFilter::with_status(status))
                .await?;
            for record in records {
                report.inspected += 1;
                let id = record.container_id;
                match self.engine.inspect(id.clone()).await {
                    Ok(Some(state)) if state.running && record.unit_id.is_some() => {
                        warn!(container_id = %id, unit_id = ?record.unit_id, "tearing down orphaned unit container");
                        self.teardown(&id, None).await;
                        report.torn_down += 1;
                    }
                    Ok(Some(state)) if state.running => report.still_running += 1,
                    Ok(state) => {
                        let code = state
                            .and_then(|s| s.exit_code)
                            .unwrap_or(UNKNOWN_EXIT_CODE);
                        match self.registry.update(&id, ContainerPatch::exited(code)).await {
                            Ok(_) => report.marked_exited += 1,
                            Err(err) => warn!(container_id = %id, %err, "failed to reconcile record"),
                        }
                    }
                    Err(err) => warn!(container_id = %id, %err, "failed to inspect during reconcile"),
                }
            }
        }
        info!(
            inspected = report.inspected,
            marked_exited = report.marked_exited,
            torn_down = report.torn_down,
            still_running = report.still_running,
            "container reconciliation complete"
        );
        Ok(report)
    }

    /// Stop, mark exited, force-remove, mark removed. Errors are logged; the
    /// record never stays `running`.
    async fn teardown(&self, container_id: &str, exit_code: Option<i32>) {
        let grace = self.settings.stop_grace;
        match tokio::time::timeout(
            grace + STOP_SLACK,
            self.engine.stop(container_id.to_owned(), grace),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(container_id, %err, "stop failed, forcing removal"),
            Err(_) => warn!(container_id, "stop did not finish in time, forcing removal"),
        }

        let code = match exit_code {
            Some(code) => code,
            None => self.probe_exit_code(container_id).await,
        };
        if let Err(err) = self
            .registry
            .update(container_id, ContainerPatch::exited(code))
            .await
        {
            warn!(container_id, %err, "failed to record container exit");
        }

        match self.engine.remove(container_id.to_owned()).await {
            Ok(()) => {
                if let Err(err) = self.registry.remove(container_id).await {
                    warn!(container_id, %err, "failed to record container removal");
                }
            }
            Err(err) => warn!(container_id, %err, "force removal failed, record left exited"),
        }
    }

    /// Best-effort removal of a container that never reached a usable state.
    async fn discard(&self, container_id: &str) {
        match self.engine.remove(container_id.to_owned()).await {
            Ok(()) => {
                if let Err(err) = self.registry.remove(container_id).await {
                    warn!(container_id, %err, "failed to record discarded container");
                }
            }
            Err(err) => {
                warn!(container_id, %err, "failed to remove discarded container");
                if let Err(err) = self
                    .registry
                    .update(container_id, ContainerPatch::exited(UNKNOWN_EXIT_CODE))
                    .await
                {
                    warn!(container_id, %err, "failed to record discarded container");
                }
            }
        }
    }

    async fn probe_exit_code(&self, container_id: &str) -> i32 {
        match self.engine.inspect(container_id.to_owned()).await {
            Ok(Some(state)) => state.exit_code.unwrap_or(UNKNOWN_EXIT_CODE),
            Ok(None) => UNKNOWN_EXIT_CODE,
            Err(err) => {
                warn!(container_id, %err, "failed to inspect container exit code");
                UNKNOWN_EXIT_CODE
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
