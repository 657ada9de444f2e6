//! Tracked child agent units and their lifecycle state.
//!
//! [`SubAgentTracker`] owns the live map of units. Each unit is a
//! `UnitCell` whose state is written only by that unit's monitor task
//! (see [`super::monitor`]); every other operation reads committed state
//! and never blocks except `wait`, which suspends on the unit's own
//! completion channel.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::{join_all, select_all};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::unit::{
    LaunchMode, QueryType, UnitEvent, UnitEventKind, UnitResult, UnitSnapshot, UnitStatus,
    UnitView, WaitMode, WaitOutcome,
};
use crate::{AppError, Result};

use super::events::EventSink;
use super::launcher::{LaunchHandle, LaunchSpec, LaunchStrategy};
use super::monitor::{self, MonitorContext};

/// Callback invoked once with the unit's result at its terminal transition.
pub type CompletionCallback = Box<dyn FnOnce(&UnitResult) + Send>;

/// Tracker tuning derived from configuration.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Interval between monitor polls.
    pub poll_interval: Duration,
    /// Slack on top of a unit's timeout before the watchdog fires.
    pub watchdog_grace: Duration,
    /// Upper bound on a strategy's `launch`.
    pub launch_timeout: Duration,
    /// Maximum number of pending or running units.
    pub max_live_units: usize,
    /// Output lines appended as log events on completion, and the default
    /// `logs` query limit.
    pub max_log_lines: usize,
}

impl TrackerSettings {
    /// Derive settings from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.tracker.poll_interval_ms),
            watchdog_grace: Duration::from_secs(config.tracker.watchdog_grace_seconds),
            launch_timeout: Duration::from_secs(config.tracker.launch_timeout_seconds),
            max_live_units: usize::try_from(config.max_live_units).unwrap_or(usize::MAX),
            max_log_lines: config.tracker.max_log_lines,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from_config(&GlobalConfig::default())
    }
}

// ── Unit cell ───────────────────────────────────────────

#[derive(Debug)]
struct UnitState {
    status: UnitStatus,
    backing_id: Option<String>,
    ended_at: Option<DateTime<Utc>>,
    events: Arc<Vec<UnitEvent>>,
    result: Option<UnitResult>,
}

/// One tracked unit. Immutable identity plus lock-guarded lifecycle state.
pub(crate) struct UnitCell {
    pub(crate) unit_id: String,
    pub(crate) launch_mode: LaunchMode,
    prompt: String,
    parent_session_id: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    state: RwLock<UnitState>,
    completion: watch::Sender<Option<UnitResult>>,
    pub(crate) cancel: CancellationToken,
    callback: Mutex<Option<CompletionCallback>>,
    handle: Mutex<Option<LaunchHandle>>,
}

impl UnitCell {
    fn new(unit_id: String, spec: &LaunchSpec, callback: Option<CompletionCallback>) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            unit_id,
            launch_mode: spec.mode,
            prompt: spec.prompt.clone(),
            parent_session_id: spec.parent_session_id.clone(),
            started_at: Utc::now(),
            started: Instant::now(),
            state: RwLock::new(UnitState {
                status: UnitStatus::Pending,
                backing_id: None,
                ended_at: None,
                events: Arc::new(Vec::new()),
                result: None,
            }),
            completion,
            cancel: CancellationToken::new(),
            callback: Mutex::new(callback),
            handle: Mutex::new(None),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&UnitState) -> R) -> R {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut UnitState) -> R) -> R {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn status(&self) -> UnitStatus {
        self.read(|s| s.status)
    }

    pub(crate) fn result(&self) -> Option<UnitResult> {
        self.read(|s| s.result.clone())
    }

    fn events(&self) -> Arc<Vec<UnitEvent>> {
        self.read(|s| Arc::clone(&s.events))
    }

    fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.read(|s| s.ended_at)
    }

    fn snapshot(&self) -> UnitSnapshot {
        self.read(|s| UnitSnapshot {
            unit_id: self.unit_id.clone(),
            launch_mode: self.launch_mode,
            status: s.status,
            prompt: self.prompt.clone(),
            parent_session_id: self.parent_session_id.clone(),
            backing_id: s.backing_id.clone(),
            started_at: self.started_at,
            ended_at: s.ended_at,
            cancel_requested: self.cancel.is_cancelled(),
            event_count: s.events.len(),
            result: s.result.clone(),
        })
    }

    fn push_event(&self, state: &mut UnitState, kind: UnitEventKind) -> UnitEvent {
        let event = UnitEvent {
            seq: u64::try_from(state.events.len()).unwrap_or(u64::MAX),
            unit_id: self.unit_id.clone(),
            at: Utc::now(),
            kind,
        };
        Arc::make_mut(&mut state.events).push(event.clone());
        event
    }

    /// Append one event and return it for emission.
    pub(crate) fn append_event(&self, kind: UnitEventKind) -> UnitEvent {
        self.write(|state| self.push_event(state, kind))
    }

    /// Record the launch handle and move `pending → running`.
    pub(crate) fn mark_running(&self, handle: LaunchHandle) -> Option<UnitEvent> {
        let backing_id = handle.backing_id.clone();
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.write(|state| {
            state.backing_id = Some(backing_id);
            if !state.status.can_transition_to(UnitStatus::Running) {
                return None;
            }
            let from = state.status;
            state.status = UnitStatus::Running;
            Some(self.push_event(
                state,
                UnitEventKind::StatusChanged {
                    from,
                    to: UnitStatus::Running,
                },
            ))
        })
    }

    pub(crate) fn handle(&self) -> Option<LaunchHandle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Commit the terminal transition exactly once.
    ///
    /// A target status not reachable from the current one is coerced to
    /// `failed`. Returns the committed result and the events appended, or
    /// `None` if the unit was already terminal.
    pub(crate) fn commit_terminal(
        &self,
        mut result: UnitResult,
    ) -> Option<(UnitResult, Vec<UnitEvent>)> {
        self.write(|state| {
            if state.status.is_terminal() {
                return None;
            }
            if !state.status.can_transition_to(result.status) {
                let detail = format!(
                    "{} unit cannot become {}",
                    state.status, result.status
                );
                result.error = Some(match result.error.take() {
                    Some(err) => format!("{err} ({detail})"),
                    None => detail,
                });
                result.status = UnitStatus::Failed;
            }
            result.success = result.status == UnitStatus::Completed;
            result.duration_ms =
                u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let from = state.status;
            state.status = result.status;
            state.ended_at = Some(Utc::now());
            state.result = Some(result.clone());
            let changed = self.push_event(
                state,
                UnitEventKind::StatusChanged {
                    from,
                    to: result.status,
                },
            );
            let finished = self.push_event(
                state,
                UnitEventKind::Finished {
                    status: result.status,
                    success: result.success,
                    error: result.error.clone(),
                },
            );
            Some((result, vec![changed, finished]))
        })
    }

    /// Take and run the completion callback, containing any panic.
    pub(crate) fn invoke_callback(&self, result: &UnitResult) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                error!(unit_id = %self.unit_id, "completion callback panicked");
            }
        }
    }

    /// Wake every waiter with the committed result.
    pub(crate) fn publish(&self, result: UnitResult) {
        self.completion.send_replace(Some(result));
    }

    pub(crate) fn is_published(&self) -> bool {
        self.completion.borrow().is_some()
    }

    /// Suspend until the result is published.
    async fn wait_result(&self) -> Result<UnitResult> {
        let mut rx = self.completion.subscribe();
        let guard = rx.wait_for(Option::is_some).await.map_err(|_| {
            AppError::Internal(format!("completion channel closed for unit {}", self.unit_id))
        })?;
        let published = guard.clone();
        drop(guard);
        published.ok_or_else(|| {
            AppError::Internal(format!("unit {} published no result", self.unit_id))
        })
    }

    /// Outcome as of now, without waiting.
    fn current_outcome(&self) -> WaitOutcome {
        match self.completion.borrow().clone() {
            Some(result) => WaitOutcome::Finished {
                unit_id: self.unit_id.clone(),
                result,
            },
            None => WaitOutcome::TimedOut {
                unit_id: self.unit_id.clone(),
                status: self.status(),
            },
        }
    }
}

// ── Tracker ─────────────────────────────────────────────

/// Registry and lifecycle owner of every spawned child unit.
pub struct SubAgentTracker {
    units: Arc<DashMap<String, Arc<UnitCell>>>,
    strategies: HashMap<LaunchMode, Arc<dyn LaunchStrategy>>,
    sink: Arc<dyn EventSink>,
    settings: TrackerSettings,
    live: Arc<AtomicUsize>,
}

impl SubAgentTracker {
    /// Create a tracker with no launch strategies.
    #[must_use]
    pub fn new(settings: TrackerSettings, sink: Arc<dyn EventSink>) -> Self {
        Self {
            units: Arc::new(DashMap::new()),
            strategies: HashMap::new(),
            sink,
            settings,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register `strategy` for its launch mode, replacing any previous one.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn LaunchStrategy>) -> Self {
        self.strategies.insert(strategy.mode(), strategy);
        self
    }

    /// Tracker settings.
    #[must_use]
    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    fn cell(&self, unit_id: &str) -> Result<Arc<UnitCell>> {
        self.units
            .get(unit_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| AppError::NotFound(format!("unit {unit_id} not found")))
    }

    fn reserve_slot(&self) -> Result<()> {
        let max = self.settings.max_live_units;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|live| {
                AppError::Validation(format!(
                    "max_live_units reached: {live} of {max} units are live"
                ))
            })
    }

    /// Spawn a unit without a completion callback.
    ///
    /// # Errors
    ///
    /// See [`Self::spawn_with_callback`].
    pub async fn spawn(&self, spec: LaunchSpec) -> Result<String> {
        self.spawn_with_callback(spec, None).await
    }

    /// Validate `spec`, register a new unit, start its monitor, and return
    /// once the backing process reports started.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for invalid specs, unmet launch
    /// prerequisites, or a full live-unit budget; nothing is registered in
    /// that case. Returns `AppError::Launch` naming the unit id if the
    /// launch fails; the unit stays queryable as `failed`.
    pub async fn spawn_with_callback(
        &self,
        spec: LaunchSpec,
        callback: Option<CompletionCallback>,
    ) -> Result<String> {
        spec.validate()?;
        let strategy = self.strategies.get(&spec.mode).cloned().ok_or_else(|| {
            AppError::Validation(format!("launch mode {} is not configured", spec.mode))
        })?;
        strategy.validate(&spec)?;
        strategy.check_available().await?;
        self.reserve_slot()?;

        let unit_id = Uuid::new_v4().to_string();
        let cell = Arc::new(UnitCell::new(unit_id.clone(), &spec, callback));
        let spawned = cell.append_event(UnitEventKind::Spawned {
            launch_mode: spec.mode,
            parent_session_id: spec.parent_session_id.clone(),
        });
        self.units.insert(unit_id.clone(), Arc::clone(&cell));
        self.sink.emit(spawned);

        let (ack_tx, ack_rx) = oneshot::channel();
        let mode = spec.mode;
        monitor::spawn_monitor(
            MonitorContext {
                cell,
                strategy,
                sink: Arc::clone(&self.sink),
                live: Arc::clone(&self.live),
                settings: self.settings.clone(),
            },
            spec,
            ack_tx,
        );

        match ack_rx.await {
            Ok(Ok(())) => {
                info!(unit_id, %mode, "unit spawned");
                Ok(unit_id)
            }
            Ok(Err(AppError::Launch(reason))) => {
                Err(AppError::Launch(format!("unit {unit_id}: {reason}")))
            }
            Ok(Err(err)) => Err(AppError::Launch(format!("unit {unit_id}: {err}"))),
            Err(_) => Err(AppError::Launch(format!(
                "unit {unit_id}: monitor ended before launch completed"
            ))),
        }
    }

    /// Read a view of a unit's committed state.
    ///
    /// `limit` keeps only the most recent entries of `events` and `logs`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids.
    pub fn query(
        &self,
        unit_id: &str,
        query_type: QueryType,
        limit: Option<usize>,
    ) -> Result<UnitView> {
        let cell = self.cell(unit_id)?;
        let view = match query_type {
            QueryType::Status => UnitView::Status(cell.snapshot()),
            QueryType::Events => {
                let events = cell.events();
                let skip = limit.map_or(0, |n| events.len().saturating_sub(n));
                UnitView::Events(events.iter().skip(skip).cloned().collect())
            }
            QueryType::Logs => UnitView::Logs(self.log_lines(&cell, limit)),
            QueryType::Output => UnitView::Output(cell.result().map(|r| r.output)),
        };
        Ok(view)
    }

    fn log_lines(&self, cell: &UnitCell, limit: Option<usize>) -> Vec<String> {
        let max = limit.unwrap_or(self.settings.max_log_lines);
        if let Some(handle) = cell.handle() {
            return handle.output.tail_lines(max);
        }
        let lines: Vec<String> = cell
            .events()
            .iter()
            .filter_map(|event| match event.kind {
                UnitEventKind::Log { ref line } => Some(line.clone()),
                _ => None,
            })
            .collect();
        let skip = lines.len().saturating_sub(max);
        lines.into_iter().skip(skip).collect()
    }

    /// Status snapshot of one unit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids.
    pub fn status(&self, unit_id: &str) -> Result<UnitSnapshot> {
        Ok(self.cell(unit_id)?.snapshot())
    }

    /// Snapshots of every tracked unit, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<UnitSnapshot> {
        let mut snapshots: Vec<UnitSnapshot> =
            self.units.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    /// Number of pending or running units.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Wait for a unit to reach a terminal state.
    ///
    /// An elapsed `timeout` yields [`WaitOutcome::TimedOut`] and leaves the
    /// unit untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids.
    pub async fn wait(&self, unit_id: &str, timeout: Duration) -> Result<WaitOutcome> {
        let cell = self.cell(unit_id)?;
        match tokio::time::timeout(timeout, cell.wait_result()).await {
            Ok(result) => Ok(WaitOutcome::Finished {
                unit_id: cell.unit_id.clone(),
                result: result?,
            }),
            Err(_) => Ok(WaitOutcome::TimedOut {
                unit_id: cell.unit_id.clone(),
                status: cell.status(),
            }),
        }
    }

    /// Wait for several units under one shared deadline.
    ///
    /// `All` returns once every unit is terminal, `Any` once the first one
    /// is. Either way the result holds one outcome per id, in input order,
    /// reflecting each unit's state when the wait ended.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty id list and
    /// `AppError::NotFound` if any id is unknown.
    pub async fn wait_many(
        &self,
        unit_ids: &[String],
        mode: WaitMode,
        timeout: Duration,
    ) -> Result<Vec<WaitOutcome>> {
        if unit_ids.is_empty() {
            return Err(AppError::Validation("unit_ids must not be empty".into()));
        }
        let cells = unit_ids
            .iter()
            .map(|id| self.cell(id))
            .collect::<Result<Vec<_>>>()?;

        let waits = cells.iter().map(|cell| Box::pin(cell.wait_result()));
        match mode {
            WaitMode::All => {
                let _ = tokio::time::timeout(timeout, join_all(waits)).await;
            }
            WaitMode::Any => {
                let _ = tokio::time::timeout(timeout, select_all(waits)).await;
            }
        }
        Ok(cells.iter().map(|cell| cell.current_outcome()).collect())
    }

    /// Request termination of a unit and return its status at the time of
    /// the request. A no-op for terminal units.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids.
    pub fn cancel(&self, unit_id: &str) -> Result<UnitStatus> {
        let cell = self.cell(unit_id)?;
        let status = cell.status();
        if !status.is_terminal() && !cell.cancel.is_cancelled() {
            info!(unit_id, %status, "unit cancellation requested");
            cell.cancel.cancel();
        }
        Ok(status)
    }

    /// Drop a terminal unit from the tracker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids and
    /// `AppError::Validation` if the unit is still live.
    pub fn evict(&self, unit_id: &str) -> Result<()> {
        if self
            .units
            .remove_if(unit_id, |_, cell| cell.status().is_terminal())
            .is_some()
        {
            return Ok(());
        }
        let status = self.cell(unit_id)?.status();
        Err(AppError::Validation(format!(
            "unit {unit_id} is {status}; only terminal units can be evicted"
        )))
    }

    /// Drop terminal units that ended more than `retention` ago and return
    /// how many were dropped.
    pub fn evict_expired(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let mut evicted = 0;
        self.units.retain(|_, cell| {
            let expired = cell.status().is_terminal()
                && cell
                    .ended_at()
                    .zip(cutoff)
                    .is_some_and(|(ended, cutoff)| ended <= cutoff);
            if expired {
                evicted += 1;
            }
            !expired
        });
        evicted
    }

    /// Spawn the background task that periodically evicts expired units.
    #[must_use]
    pub fn spawn_eviction_task(
        self: &Arc<Self>,
        retention: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let period = retention.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; skip it.
            interval.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("unit eviction task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let evicted = tracker.evict_expired(retention);
                        if evicted > 0 {
                            info!(evicted, "evicted expired units");
                        }
                    }
                }
            }
        })
    }

    /// Cancel every live unit and wait up to `grace` for them to settle.
    ///
    /// Returns the number of units still live when the grace period ended.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let live: Vec<Arc<UnitCell>> = self
            .units
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if live.is_empty() {
            return 0;
        }

        info!(units = live.len(), "cancelling live units for shutdown");
        for cell in &live {
            cell.cancel.cancel();
        }
        let waits = live.iter().map(|cell| cell.wait_result());
        if tokio::time::timeout(grace, join_all(waits)).await.is_err() {
            warn!(?grace, "shutdown grace elapsed with units still live");
        }
        live.iter()
            .filter(|cell| !cell.status().is_terminal())
            .count()
    }
}
