//! Unit tests for `GlobalConfig` parsing, defaults, and validation.
//!
//! Every test is `#[serial]`: `from_toml_str` reads the data-dir override
//! from the process environment.

use std::path::PathBuf;
use std::time::Duration;

use serial_test::serial;

use subagent_runtime::config::{AgentConfig, GlobalConfig, DATA_DIR_ENV};
use subagent_runtime::AppError;

fn sample_toml(data_dir: &str) -> String {
    format!(
        r#"
data_dir = '{data_dir}'
max_live_units = 3
retention_days = 7

[agent]
host_cli = "claude"
host_cli_args = ["--print", "--verbose"]

[sandbox]
engine = "podman"
image = "sandbox:latest"
default_timeout_seconds = 60
max_timeout_seconds = 600
stop_grace_seconds = 2
max_output_bytes = 1024

[sandbox.ceilings]
max_memory_mb = 2048
max_cpus = 2.0
max_pids = 256

[tmux]
session_prefix = "agents"
default_width = 160
default_height = 40

[tracker]
poll_interval_ms = 100
watchdog_grace_seconds = 10
wait_default_ms = 1000
"#
    )
}

#[test]
#[serial]
fn parses_full_config() {
    let config = GlobalConfig::from_toml_str(&sample_toml("/var/lib/subagents"))
        .expect("valid config");

    assert_eq!(config.data_dir, PathBuf::from("/var/lib/subagents"));
    assert_eq!(config.max_live_units, 3);
    assert_eq!(config.retention_days, 7);
    assert_eq!(config.agent.host_cli_args, vec!["--print", "--verbose"]);
    assert_eq!(config.sandbox.engine, "podman");
    assert_eq!(config.sandbox.default_timeout(), Duration::from_secs(60));
    assert_eq!(config.sandbox.max_timeout(), Duration::from_secs(600));
    assert_eq!(config.sandbox.stop_grace(), Duration::from_secs(2));
    assert_eq!(config.sandbox.ceilings.max_pids, 256);
    assert_eq!(config.tmux.session_prefix, "agents");
    assert_eq!((config.tmux.default_width, config.tmux.default_height), (160, 40));
    assert_eq!(config.tracker.poll_interval_ms, 100);
    // Unset keys keep their defaults.
    assert_eq!(config.tmux.binary, "tmux");
    assert_eq!(config.tracker.max_log_lines, 200);
}

#[test]
#[serial]
fn empty_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("defaults are valid");
    let defaults = GlobalConfig::default();
    assert_eq!(config.max_live_units, defaults.max_live_units);
    assert_eq!(config.sandbox, defaults.sandbox);
    assert_eq!(config.tmux, defaults.tmux);
    assert_eq!(config.tracker, defaults.tracker);
    assert_eq!(config.sandbox.idle_command, vec!["sleep", "infinity"]);
}

#[test]
#[serial]
fn derived_paths_live_under_data_dir() {
    let config = GlobalConfig::from_toml_str("data_dir = '/srv/runtime'").expect("config");
    assert_eq!(config.db_path(), PathBuf::from("/srv/runtime/subagent.db"));
    assert_eq!(config.events_dir(), PathBuf::from("/srv/runtime/events"));
}

#[test]
#[serial]
fn data_dir_env_overrides_file() {
    std::env::set_var(DATA_DIR_ENV, "/tmp/override");
    let result = GlobalConfig::from_toml_str("data_dir = '/srv/runtime'");
    std::env::remove_var(DATA_DIR_ENV);

    let config = result.expect("config");
    assert_eq!(config.data_dir, PathBuf::from("/tmp/override"));
}

#[test]
#[serial]
fn empty_data_dir_env_is_ignored() {
    std::env::set_var(DATA_DIR_ENV, "");
    let result = GlobalConfig::from_toml_str("data_dir = '/srv/runtime'");
    std::env::remove_var(DATA_DIR_ENV);

    assert_eq!(result.expect("config").data_dir, PathBuf::from("/srv/runtime"));
}

#[test]
#[serial]
fn load_from_path_reads_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(&path, sample_toml("/data")).expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("load");
    assert_eq!(config.sandbox.image, "sandbox:latest");
}

#[test]
#[serial]
fn missing_file_is_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::load_from_path(temp.path().join("absent.toml"))
        .expect_err("missing file");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
#[serial]
fn malformed_toml_is_config_error() {
    let err = GlobalConfig::from_toml_str("max_live_units = \"many\"").expect_err("bad type");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
#[serial]
fn invalid_values_are_rejected() {
    let cases = [
        "max_live_units = 0",
        "[agent]\nhost_cli = \"  \"",
        "[sandbox]\nengine = \"\"",
        "[sandbox]\nidle_command = []",
        "[sandbox]\ndefault_timeout_seconds = 0",
        "[sandbox]\ndefault_timeout_seconds = 100\nmax_timeout_seconds = 50",
        "[sandbox]\nmax_output_bytes = 0",
        "[sandbox.ceilings]\nmax_cpus = 0.0",
        "[tmux]\ndefault_timeout_seconds = 0",
        "[tracker]\npoll_interval_ms = 0",
        "[tracker]\nevent_channel_capacity = 0",
        "[tracker]\nwatchdog_grace_seconds = 0",
        "[tracker]\nunit_retention_seconds = 0",
        "[tracker]\nlaunch_timeout_seconds = 0",
        "[sandbox]\nstop_grace_seconds = 10\n[tracker]\nwatchdog_grace_seconds = 11",
    ];
    for raw in cases {
        let err = GlobalConfig::from_toml_str(raw).expect_err(raw);
        assert!(matches!(err, AppError::Config(_)), "{raw}: {err}");
    }
}

#[test]
#[serial]
fn watchdog_grace_must_cover_stop_grace_and_slack() {
    let raw = "[sandbox]\nstop_grace_seconds = 10\n[tracker]\nwatchdog_grace_seconds = 16";
    let config = GlobalConfig::from_toml_str(raw).expect("grace covers teardown");
    assert_eq!(config.tracker.watchdog_grace_seconds, 16);

    let err = GlobalConfig::from_toml_str(
        "[sandbox]\nstop_grace_seconds = 10\n[tracker]\nwatchdog_grace_seconds = 15",
    )
    .expect_err("grace shorter than teardown");
    assert!(err.to_string().contains("watchdog_grace_seconds"), "{err}");
}

#[test]
fn command_for_appends_prompt_after_args() {
    let agent = AgentConfig {
        host_cli: "claude".into(),
        host_cli_args: vec!["--print".into()],
    };
    assert_eq!(
        agent.command_for("fix the tests"),
        vec!["claude", "--print", "fix the tests"]
    );
}
