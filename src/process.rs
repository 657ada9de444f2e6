//! Thin wrapper for invoking engine and multiplexer CLIs.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// Captured result of one CLI invocation.
#[derive(Debug, Clone)]
pub struct CliOutput {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

impl CliOutput {
    /// Whether the process exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stderr if present, otherwise stdout; used in error messages.
    #[must_use]
    pub fn diagnostic(&self) -> &str {
        if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Run `binary` with `args` to completion, capturing both streams.
///
/// # Errors
///
/// Returns the spawn error when the binary cannot be started, e.g. when it
/// is not installed.
pub async fn run_cli<I, S>(binary: &str, args: I) -> std::io::Result<CliOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = cmd.output().await?;
    let result = CliOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    };
    debug!(binary, code = ?result.code, "cli invocation finished");
    Ok(result)
}

/// Quote `arg` for a POSIX shell command line.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ','))
    {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Join `argv` into a single shell command line.
#[must_use]
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}
