//! Integration tests for the `tmux` CLI adapter against a scripted binary.
//!
//! Validates:
//! - A session whose setup fails after `new-session` is killed before the
//!   error is returned, including caller-named sessions
//! - A `new-session` that reports no pane id is cleaned up the same way

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use subagent_runtime::multiplexer::{Multiplexer, PaneRequest, TmuxCli};
use subagent_runtime::AppError;

/// Write an executable stand-in for `tmux` that logs every invocation.
///
/// `new-session` prints `pane_id`; `set-window-option` fails.
fn scripted_tmux(dir: &Path, pane_id: &str) -> (PathBuf, PathBuf) {
    let log = dir.join("calls.log");
    let script = dir.join("tmux");
    let body = format!(
        "#!/bin/sh\n\
         echo \"$*\" >> '{log}'\n\
         case \"$1\" in\n\
         \x20 new-session) echo '{pane_id}' ;;\n\
         \x20 set-window-option) echo 'server exited unexpectedly' >&2; exit 1 ;;\n\
         esac\n\
         exit 0\n",
        log = log.display(),
    );
    fs::write(&script, body).expect("write script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
    (script, log)
}

fn calls(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .expect("read log")
        .lines()
        .map(str::to_owned)
        .collect()
}

fn request(session_name: &str) -> PaneRequest {
    PaneRequest {
        session_name: session_name.into(),
        working_directory: None,
        width: 80,
        height: 24,
    }
}

#[tokio::test]
async fn failed_remain_on_exit_kills_new_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (script, log) = scripted_tmux(dir.path(), "%7");
    let mux = TmuxCli::new(script.to_string_lossy());

    let err = mux
        .create_pane(request("planner"))
        .await
        .expect_err("setup must fail");
    assert!(matches!(err, AppError::Multiplexer(_)), "got {err}");
    assert!(err.to_string().contains("set remain-on-exit failed"), "{err}");

    let calls = calls(&log);
    assert_eq!(calls.len(), 3, "{calls:?}");
    assert!(calls[0].starts_with("new-session -d -s planner"));
    assert!(calls[1].starts_with("set-window-option -t planner"));
    assert_eq!(calls[2], "kill-session -t planner");
}

#[tokio::test]
async fn missing_pane_id_kills_new_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (script, log) = scripted_tmux(dir.path(), "");
    let mux = TmuxCli::new(script.to_string_lossy());

    let err = mux
        .create_pane(request("observer"))
        .await
        .expect_err("no pane id");
    assert!(err.to_string().contains("no pane id"), "{err}");
    assert_eq!(
        calls(&log).last().map(String::as_str),
        Some("kill-session -t observer")
    );
}
