//! Per-unit monitor task.
//!
//! Each unit gets exactly one monitor. An inner task launches the backing
//! process under `launch_timeout`, polls it, enforces the unit deadline, and
//! relays cancel requests. An outer supervisor runs the inner task under a
//! watchdog that starts when launch settles and commits `failed` if the
//! inner task panics or overruns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use crate::models::unit::{UnitEventKind, UnitResult, UnitStatus};
use crate::{AppError, Result};

use super::events::EventSink;
use super::launcher::{BackingStatus, LaunchHandle, LaunchSpec, LaunchStrategy};
use super::tracker::{TrackerSettings, UnitCell};

/// Consecutive poll errors tolerated before the unit is failed.
const MAX_POLL_FAILURES: u32 = 5;

/// Everything a monitor needs from the tracker.
pub(crate) struct MonitorContext {
    pub(crate) cell: Arc<UnitCell>,
    pub(crate) strategy: Arc<dyn LaunchStrategy>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) live: Arc<AtomicUsize>,
    pub(crate) settings: TrackerSettings,
}

impl MonitorContext {
    fn emit(&self, kind: UnitEventKind) {
        self.sink.emit(self.cell.append_event(kind));
    }
}

/// Reports whether the launch succeeded back to `spawn`.
pub(crate) type LaunchAck = oneshot::Sender<Result<()>>;

/// Tells the supervisor that `launch` returned, successfully or not.
type LaunchSettled = oneshot::Sender<()>;

/// Start the supervised monitor for a freshly registered unit.
pub(crate) fn spawn_monitor(
    ctx: MonitorContext,
    spec: LaunchSpec,
    ack: LaunchAck,
) -> JoinHandle<()> {
    let span = info_span!("unit_monitor", unit_id = %ctx.cell.unit_id, mode = %spec.mode);
    tokio::spawn(supervise(Arc::new(ctx), spec, ack).instrument(span))
}

async fn supervise(ctx: Arc<MonitorContext>, spec: LaunchSpec, ack: LaunchAck) {
    let watchdog = spec.timeout + ctx.settings.watchdog_grace;
    let launch_bound = ctx.settings.launch_timeout + ctx.settings.watchdog_grace;
    let (settled_tx, settled_rx) = oneshot::channel();
    let mut inner =
        tokio::spawn(run_unit(Arc::clone(&ctx), spec, ack, settled_tx).in_current_span());

    // The watchdog clock starts once launch settles, the same base as the
    // unit deadline. Launch itself is bounded by `launch_timeout`.
    let diagnostic = match tokio::time::timeout(launch_bound, settled_rx).await {
        Ok(Ok(())) => match tokio::time::timeout(watchdog, &mut inner).await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => describe_join_error(err),
            Err(_) => {
                inner.abort();
                format!("unit monitor watchdog expired after {}ms", watchdog.as_millis())
            }
        },
        // The inner task dropped its signal without sending: it panicked
        // before launch settled.
        Ok(Err(_)) => match inner.await {
            Ok(()) => return,
            Err(err) => describe_join_error(err),
        },
        Err(_) => {
            inner.abort();
            format!("unit launch did not settle within {}ms", launch_bound.as_millis())
        }
    };

    error!(%diagnostic, "recovering unit after monitor fault");
    recover(&ctx, diagnostic).await;
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("unit monitor aborted: {err}");
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned());
    format!("unit monitor panicked: {message}")
}

/// Clean up after a faulted monitor and commit `failed`.
async fn recover(ctx: &MonitorContext, diagnostic: String) {
    let handle = ctx.cell.handle();
    if let Some(ref handle) = handle {
        let terminate = ctx.strategy.terminate(handle.clone());
        match tokio::time::timeout(ctx.settings.watchdog_grace, terminate).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "terminate failed during recovery"),
            Err(_) => warn!("terminate did not finish during recovery"),
        }
    }
    let output = handle
        .as_ref()
        .map(|h| (h.output.combined(), h.output.is_truncated()));
    cleanup(ctx, handle).await;

    let mut result = UnitResult::new(UnitStatus::Failed, None, Some(diagnostic));
    if let Some((text, truncated)) = output {
        result = result.with_output(text, truncated);
    }
    finish(ctx, result);
}

async fn run_unit(
    ctx: Arc<MonitorContext>,
    spec: LaunchSpec,
    ack: LaunchAck,
    settled: LaunchSettled,
) {
    let unit_id = ctx.cell.unit_id.clone();
    let launch_timeout = ctx.settings.launch_timeout;
    let launched = tokio::time::timeout(launch_timeout, ctx.strategy.launch(unit_id, spec.clone()))
        .await
        .unwrap_or_else(|_| {
            Err(AppError::Launch(format!(
                "launch did not finish within {}ms",
                launch_timeout.as_millis()
            )))
        });
    let _ = settled.send(());

    let handle = match launched {
        Ok(handle) => handle,
        Err(err) => {
            warn!(%err, "unit launch failed");
            cleanup(&ctx, None).await;
            finish(
                &ctx,
                UnitResult::new(UnitStatus::Failed, None, Some(err.to_string())),
            );
            // A dropped receiver only means spawn is no longer listening.
            let _ = ack.send(Err(err));
            return;
        }
    };

    let deadline = Instant::now() + spec.timeout;
    if let Some(event) = ctx.cell.mark_running(handle.clone()) {
        ctx.sink.emit(event);
    }
    info!(backing_id = %handle.backing_id, "unit running");
    let _ = ack.send(Ok(()));

    let (status, timed_out) = observe(&ctx, &handle, deadline).await;
    let result = classify(
        status,
        timed_out,
        ctx.cell.cancel.is_cancelled(),
        spec.timeout,
    );

    cleanup(&ctx, Some(handle.clone())).await;
    for line in handle.output.tail_lines(ctx.settings.max_log_lines) {
        ctx.emit(UnitEventKind::Log { line });
    }
    finish(
        &ctx,
        result.with_output(handle.output.combined(), handle.output.is_truncated()),
    );
}

/// Poll until the backing resource reports something other than running.
///
/// Returns that status and whether the unit deadline triggered termination.
async fn observe(
    ctx: &MonitorContext,
    handle: &LaunchHandle,
    deadline: Instant,
) -> (BackingStatus, bool) {
    let poll = ctx.settings.poll_interval;
    let mut timed_out = false;
    let mut terminating = false;
    let mut failures = 0_u32;

    loop {
        if terminating {
            tokio::time::sleep(poll).await;
        } else {
            tokio::select! {
                biased;
                () = ctx.cell.cancel.cancelled() => {
                    info!("unit cancel requested");
                    ctx.emit(UnitEventKind::CancelRequested);
                    terminating = true;
                    request_termination(ctx, handle).await;
                }
                () = tokio::time::sleep_until(deadline) => {
                    warn!("unit deadline elapsed, terminating");
                    timed_out = true;
                    terminating = true;
                    request_termination(ctx, handle).await;
                }
                () = tokio::time::sleep(poll) => {}
            }
        }

        match ctx.strategy.poll_status(handle.clone()).await {
            Ok(BackingStatus::Running) => failures = 0,
            Ok(status) => return (status, timed_out),
            Err(err) => {
                failures += 1;
                warn!(%err, failures, "failed to poll unit backing resource");
                if failures >= MAX_POLL_FAILURES {
                    return (
                        BackingStatus::Failed {
                            error: format!("lost track of backing resource: {err}"),
                        },
                        timed_out,
                    );
                }
            }
        }
    }
}

async fn request_termination(ctx: &MonitorContext, handle: &LaunchHandle) {
    if let Err(err) = ctx.strategy.terminate(handle.clone()).await {
        warn!(%err, "failed to request unit termination");
    }
}

/// Map the final backing status to the unit's terminal result.
pub(crate) fn classify(
    status: BackingStatus,
    timed_out: bool,
    cancel_requested: bool,
    timeout: Duration,
) -> UnitResult {
    let timed_out_result = |exit_code| {
        UnitResult::new(
            UnitStatus::TimedOut,
            exit_code,
            Some(format!("unit exceeded its timeout of {}ms", timeout.as_millis())),
        )
    };
    let cancelled_result =
        |exit_code| UnitResult::new(UnitStatus::Cancelled, exit_code, Some("cancelled by request".into()));

    match status {
        BackingStatus::Running => UnitResult::new(
            UnitStatus::Failed,
            None,
            Some("monitor stopped while the unit was running".into()),
        ),
        BackingStatus::Exited { exit_code: Some(0) } => {
            UnitResult::new(UnitStatus::Completed, Some(0), None)
        }
        BackingStatus::Exited { exit_code } if timed_out => timed_out_result(exit_code),
        BackingStatus::Exited { exit_code } if cancel_requested => cancelled_result(exit_code),
        BackingStatus::Exited { exit_code } => {
            let error = exit_code.map_or_else(
                || "process exited with unknown status".to_owned(),
                |code| format!("process exited with code {code}"),
            );
            UnitResult::new(UnitStatus::Failed, exit_code, Some(error))
        }
        BackingStatus::TimedOut => timed_out_result(None),
        BackingStatus::Cancelled if timed_out => timed_out_result(None),
        BackingStatus::Cancelled => cancelled_result(None),
        BackingStatus::Failed { error } => UnitResult::new(UnitStatus::Failed, None, Some(error)),
        BackingStatus::Gone if timed_out => timed_out_result(None),
        BackingStatus::Gone if cancel_requested => cancelled_result(None),
        BackingStatus::Gone => UnitResult::new(
            UnitStatus::Failed,
            None,
            Some("backing resource disappeared".into()),
        ),
    }
}

async fn cleanup(ctx: &MonitorContext, handle: Option<LaunchHandle>) {
    let unit_id = ctx.cell.unit_id.clone();
    let cleanup = ctx.strategy.cleanup(unit_id, handle);
    match tokio::time::timeout(ctx.settings.watchdog_grace, cleanup).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "unit cleanup failed"),
        Err(_) => warn!("unit cleanup did not finish in time"),
    }
}

/// Commit, release the live slot, run the callback, then wake waiters.
pub(crate) fn finish(ctx: &MonitorContext, result: UnitResult) {
    let cell = &ctx.cell;
    match cell.commit_terminal(result) {
        Some((result, events)) => {
            for event in events {
                ctx.sink.emit(event);
            }
            ctx.live.fetch_sub(1, Ordering::SeqCst);
            info!(
                status = %result.status,
                success = result.success,
                exit_code = result.exit_code,
                duration_ms = result.duration_ms,
                "unit finished"
            );
            cell.invoke_callback(&result);
            cell.publish(result);
        }
        None => {
            if !cell.is_published() {
                if let Some(result) = cell.result() {
                    cell.publish(result);
                }
            }
        }
    }
}
