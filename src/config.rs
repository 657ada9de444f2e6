//! Global configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Environment variable that overrides `data_dir` from the config file.
pub const DATA_DIR_ENV: &str = "SUBAGENT_RUNTIME_DATA_DIR";

/// Seconds allowed on top of a container's stop grace for the engine to
/// confirm the stop.
///
/// `tracker.watchdog_grace_seconds` must exceed `sandbox.stop_grace_seconds`
/// plus this slack so a timed-out unit finishes teardown under its watchdog.
pub const STOP_SLACK_SECONDS: u64 = 5;

/// Host agent CLI used to run a child unit's prompt.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent binary (e.g., `claude`).
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Arguments placed before the prompt.
    #[serde(default = "default_host_cli_args")]
    pub host_cli_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host_cli: default_host_cli(),
            host_cli_args: default_host_cli_args(),
        }
    }
}

impl AgentConfig {
    /// Full argv that runs `prompt` through the host agent CLI.
    #[must_use]
    pub fn command_for(&self, prompt: &str) -> Vec<String> {
        let mut command = Vec::with_capacity(self.host_cli_args.len() + 2);
        command.push(self.host_cli.clone());
        command.extend(self.host_cli_args.iter().cloned());
        command.push(prompt.to_owned());
        command
    }
}

fn default_host_cli() -> String {
    "claude".into()
}

fn default_host_cli_args() -> Vec<String> {
    vec!["--print".into()]
}

/// Upper bounds that caller-supplied resource limits may not exceed.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SandboxCeilings {
    /// Maximum memory per container in MiB.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Maximum CPU quota per container.
    #[serde(default = "default_max_cpus")]
    pub max_cpus: f64,
    /// Maximum process count per container.
    #[serde(default = "default_max_pids")]
    pub max_pids: u32,
}

impl Default for SandboxCeilings {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_cpus: default_max_cpus(),
            max_pids: default_max_pids(),
        }
    }
}

fn default_max_memory_mb() -> u64 {
    8192
}

fn default_max_cpus() -> f64 {
    4.0
}

fn default_max_pids() -> u32 {
    1024
}

/// Container engine settings and sandbox policy.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SandboxConfig {
    /// Container engine CLI (`docker` or `podman`).
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Image used for sandbox containers. Must already be present locally.
    #[serde(default = "default_image")]
    pub image: String,
    /// Entrypoint that keeps a container alive between `exec` calls.
    #[serde(default = "default_idle_command")]
    pub idle_command: Vec<String>,
    /// Timeout applied when a caller does not supply one.
    #[serde(default = "default_sandbox_timeout")]
    pub default_timeout_seconds: u64,
    /// Largest timeout a caller may request.
    #[serde(default = "default_max_timeout")]
    pub max_timeout_seconds: u64,
    /// Grace period between the stop signal and force removal.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
    /// Per-stream capture limit for stdout and stderr.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Resource limit ceilings.
    #[serde(default)]
    pub ceilings: SandboxCeilings,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            image: default_image(),
            idle_command: default_idle_command(),
            default_timeout_seconds: default_sandbox_timeout(),
            max_timeout_seconds: default_max_timeout(),
            stop_grace_seconds: default_stop_grace(),
            max_output_bytes: default_max_output_bytes(),
            ceilings: SandboxCeilings::default(),
        }
    }
}

impl SandboxConfig {
    /// Grace period between stop and force removal.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }

    /// Largest timeout a caller may request.
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_seconds)
    }

    /// Timeout used when the caller does not supply one.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

fn default_engine() -> String {
    "docker".into()
}

fn default_image() -> String {
    "ubuntu:24.04".into()
}

fn default_idle_command() -> Vec<String> {
    vec!["sleep".into(), "infinity".into()]
}

fn default_sandbox_timeout() -> u64 {
    1800
}

fn default_max_timeout() -> u64 {
    7200
}

fn default_stop_grace() -> u64 {
    5
}

fn default_max_output_bytes() -> usize {
    256 * 1024
}

/// Terminal multiplexer settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TmuxConfig {
    /// Multiplexer binary.
    #[serde(default = "default_tmux_binary")]
    pub binary: String,
    /// Prefix for generated session names.
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// Default pane width in columns.
    #[serde(default = "default_width")]
    pub default_width: u16,
    /// Default pane height in rows.
    #[serde(default = "default_height")]
    pub default_height: u16,
    /// Timeout applied when a caller does not supply one.
    #[serde(default = "default_tmux_timeout")]
    pub default_timeout_seconds: u64,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: default_tmux_binary(),
            session_prefix: default_session_prefix(),
            default_width: default_width(),
            default_height: default_height(),
            default_timeout_seconds: default_tmux_timeout(),
        }
    }
}

impl TmuxConfig {
    /// Timeout used when the caller does not supply one.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

fn default_tmux_binary() -> String {
    "tmux".into()
}

fn default_session_prefix() -> String {
    "subagent".into()
}

fn default_width() -> u16 {
    200
}

fn default_height() -> u16 {
    50
}

fn default_tmux_timeout() -> u64 {
    3600
}

/// Tracker monitor and retention settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TrackerConfig {
    /// Interval between monitor polls of the backing resource.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Slack added on top of a unit's timeout before its watchdog fires.
    #[serde(default = "default_watchdog_grace")]
    pub watchdog_grace_seconds: u64,
    /// Upper bound on starting a unit's backing resource.
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_seconds: u64,
    /// How long terminal units stay queryable before eviction.
    #[serde(default = "default_unit_retention")]
    pub unit_retention_seconds: u64,
    /// Captured output lines appended as log events on completion.
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Wait timeout used when a caller does not supply one.
    #[serde(default = "default_wait_ms")]
    pub wait_default_ms: u64,
    /// How long shutdown waits for cancelled units to confirm termination.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            watchdog_grace_seconds: default_watchdog_grace(),
            launch_timeout_seconds: default_launch_timeout(),
            unit_retention_seconds: default_unit_retention(),
            max_log_lines: default_max_log_lines(),
            event_channel_capacity: default_event_channel_capacity(),
            wait_default_ms: default_wait_ms(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_watchdog_grace() -> u64 {
    30
}

fn default_launch_timeout() -> u64 {
    300
}

fn default_unit_retention() -> u64 {
    3600
}

fn default_max_log_lines() -> usize {
    200
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_wait_ms() -> u64 {
    300_000
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".subagent-runtime")
}

fn default_max_live_units() -> u32 {
    8
}

fn default_retention_days() -> u32 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the container registry database and event logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Maximum number of units that may be pending or running at once.
    #[serde(default = "default_max_live_units")]
    pub max_live_units: u32,
    /// Days a removed container record is kept before pruning.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Host agent CLI.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Container engine and sandbox policy.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Terminal multiplexer.
    #[serde(default)]
    pub tmux: TmuxConfig,
    /// Tracker monitor and retention.
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_live_units: default_max_live_units(),
            retention_days: default_retention_days(),
            agent: AgentConfig::default(),
            sandbox: SandboxConfig::default(),
            tmux: TmuxConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string, apply environment overrides,
    /// and validate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Path of the `SQLite` container registry database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("subagent.db")
    }

    /// Directory receiving daily JSONL lifecycle event logs.
    #[must_use]
    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    fn validate(&self) -> Result<()> {
        if self.max_live_units == 0 {
            return Err(AppError::Config(
                "max_live_units must be greater than zero".into(),
            ));
        }

        if self.agent.host_cli.trim().is_empty() {
            return Err(AppError::Config("agent.host_cli must not be empty".into()));
        }

        let sandbox = &self.sandbox;
        if sandbox.engine.trim().is_empty() {
            return Err(AppError::Config("sandbox.engine must not be empty".into()));
        }
        if sandbox.image.trim().is_empty() {
            return Err(AppError::Config("sandbox.image must not be empty".into()));
        }
        if sandbox.idle_command.is_empty() {
            return Err(AppError::Config(
                "sandbox.idle_command must not be empty".into(),
            ));
        }
        if sandbox.default_timeout_seconds == 0 || sandbox.max_timeout_seconds == 0 {
            return Err(AppError::Config(
                "sandbox timeouts must be greater than zero".into(),
            ));
        }
        if sandbox.default_timeout_seconds > sandbox.max_timeout_seconds {
            return Err(AppError::Config(
                "sandbox.default_timeout_seconds exceeds max_timeout_seconds".into(),
            ));
        }
        if sandbox.max_output_bytes == 0 {
            return Err(AppError::Config(
                "sandbox.max_output_bytes must be greater than zero".into(),
            ));
        }
        if sandbox.ceilings.max_memory_mb == 0
            || sandbox.ceilings.max_pids == 0
            || sandbox.ceilings.max_cpus <= 0.0
        {
            return Err(AppError::Config(
                "sandbox.ceilings must be greater than zero".into(),
            ));
        }

        if self.tmux.binary.trim().is_empty() {
            return Err(AppError::Config("tmux.binary must not be empty".into()));
        }
        if self.tmux.default_timeout_seconds == 0 {
            return Err(AppError::Config(
                "tmux.default_timeout_seconds must be greater than zero".into(),
            ));
        }

        let tracker = &self.tracker;
        if tracker.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "tracker.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if tracker.event_channel_capacity == 0 {
            return Err(AppError::Config(
                "tracker.event_channel_capacity must be greater than zero".into(),
            ));
        }
        if tracker.launch_timeout_seconds == 0 {
            return Err(AppError::Config(
                "tracker.launch_timeout_seconds must be greater than zero".into(),
            ));
        }
        if tracker.unit_retention_seconds == 0 {
            return Err(AppError::Config(
                "tracker.unit_retention_seconds must be greater than zero".into(),
            ));
        }
        if tracker.watchdog_grace_seconds <= sandbox.stop_grace_seconds + STOP_SLACK_SECONDS {
            return Err(AppError::Config(format!(
                "tracker.watchdog_grace_seconds must exceed sandbox.stop_grace_seconds + {STOP_SLACK_SECONDS}"
            )));
        }

        Ok(())
    }
}
