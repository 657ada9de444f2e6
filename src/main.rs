#![forbid(unsafe_code)]

//! `subagent-runtime`: MCP server for spawning and supervising child agents.
//!
//! Bootstraps configuration, the container registry, the sandbox runner,
//! the unit tracker with its launch strategies, and the stdio MCP
//! transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use subagent_runtime::audit::{EventLogger, JsonlEventWriter};
use subagent_runtime::config::GlobalConfig;
use subagent_runtime::mcp::handler::AppState;
use subagent_runtime::mcp::transport;
use subagent_runtime::multiplexer::TmuxCli;
use subagent_runtime::orchestrator::events::spawn_event_writer;
use subagent_runtime::orchestrator::{
    ChannelSink, ContainerLauncher, PaneLauncher, SubAgentTracker, TrackerSettings,
};
use subagent_runtime::persistence::container_registry::ContainerRegistry;
use subagent_runtime::persistence::{db, retention};
use subagent_runtime::sandbox::cli::CliEngine;
use subagent_runtime::sandbox::{ContainerRunner, RunnerSettings, SandboxPolicy, SandboxTool};
use subagent_runtime::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "subagent-runtime", about = "Subagent orchestration MCP server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Built-in defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("subagent-runtime server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match args.config {
        Some(ref path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::from_toml_str("")?,
    };
    let config = Arc::new(config);
    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path()).await?);
    let registry = ContainerRegistry::new(Arc::clone(&db));
    info!("database connected");

    // ── Sandbox ─────────────────────────────────────────
    let engine = Arc::new(CliEngine::new(config.sandbox.engine.clone()));
    let runner = ContainerRunner::new(
        engine,
        registry.clone(),
        RunnerSettings::from_config(&config.sandbox),
    );
    if let Err(err) = runner.reconcile().await {
        warn!(%err, "container reconciliation failed");
    }
    let sandbox = SandboxTool::new(runner, SandboxPolicy::from_config(&config.sandbox))?;

    // ── Event log ───────────────────────────────────────
    let ct = CancellationToken::new();
    let (sink, events_rx) = ChannelSink::new(config.tracker.event_channel_capacity);
    let logger: Arc<dyn EventLogger> = Arc::new(JsonlEventWriter::new(config.events_dir())?);
    let writer_ct = CancellationToken::new();
    let writer_handle = spawn_event_writer(events_rx, logger, writer_ct.clone());

    // ── Tracker ─────────────────────────────────────────
    let mux = Arc::new(TmuxCli::new(config.tmux.binary.clone()));
    let tracker = Arc::new(
        SubAgentTracker::new(TrackerSettings::from_config(&config), Arc::new(sink))
            .with_strategy(Arc::new(ContainerLauncher::new(sandbox.clone())))
            .with_strategy(Arc::new(PaneLauncher::new(
                mux,
                &config.tmux,
                config.sandbox.max_output_bytes,
            ))),
    );

    // ── Background tasks ────────────────────────────────
    let retention_handle =
        retention::spawn_retention_task(registry, config.retention_days, ct.clone());
    let eviction_handle = tracker.spawn_eviction_task(
        Duration::from_secs(config.tracker.unit_retention_seconds),
        ct.clone(),
    );
    info!("background tasks started");

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        sandbox,
        tracker: Arc::clone(&tracker),
    });

    // ── Serve until the client leaves or a signal arrives ──
    let stdio_ct = ct.clone();
    let mut stdio_handle = tokio::spawn(transport::serve_stdio(state, stdio_ct));
    info!("MCP server ready");

    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            ct.cancel();
            match stdio_handle.await {
                Ok(Err(err)) => error!(%err, "stdio transport failed"),
                Err(err) => error!(%err, "stdio transport task failed"),
                Ok(Ok(())) => {}
            }
        }
        joined = &mut stdio_handle => {
            match joined {
                Ok(Err(err)) => error!(%err, "stdio transport failed"),
                Err(err) => error!(%err, "stdio transport task failed"),
                Ok(Ok(())) => info!("MCP client disconnected"),
            }
            ct.cancel();
        }
    }

    // ── Graceful shutdown ───────────────────────────────
    let grace = Duration::from_secs(config.tracker.shutdown_grace_seconds);
    let remaining = tracker.shutdown(grace).await;
    if remaining > 0 {
        warn!(remaining, "units still live at shutdown");
    }
    writer_ct.cancel();

    let _ = tokio::join!(writer_handle, retention_handle, eviction_handle);
    info!("subagent-runtime shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout carries the MCP stream; logs go to stderr.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
