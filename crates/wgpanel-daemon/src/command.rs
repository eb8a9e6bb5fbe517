//! External command invocation with full capture.
//!
//! Every call records the command line, exit code, stdout, stderr and wall
//! clock duration so failures surface with everything an operator needs.

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug)]
pub struct CommandError {
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub source: Option<std::io::Error>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command failed: {}", self.command)?;
        if !self.args.is_empty() {
            write!(f, " {}", self.args.join(" "))?;
        }
        match self.exit_code {
            Some(code) => write!(f, " (exit code: {code})")?,
            None => write!(f, " (no exit code)")?,
        }
        write!(f, " [took {:?}]", self.duration)?;
        if !self.stdout.trim().is_empty() {
            write!(f, "\n  stdout: {}", self.stdout.trim())?;
        }
        if !self.stderr.trim().is_empty() {
            write!(f, "\n  stderr: {}", self.stderr.trim())?;
        }
        if let Some(source) = &self.source {
            write!(f, "\n  system error: {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as _)
    }
}

impl CommandError {
    fn spawn(name: &str, args: &[&str], err: std::io::Error, started: Instant) -> Self {
        CommandError {
            command: name.to_owned(),
            args: args.iter().map(|s| s.to_string()).collect(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: started.elapsed(),
            source: Some(err),
        }
    }
}

fn finish(
    name: &str,
    args: &[&str],
    output: std::process::Output,
    started: Instant,
) -> Result<String, CommandError> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }
    Err(CommandError {
        command: name.to_owned(),
        args: args.iter().map(|s| s.to_string()).collect(),
        exit_code: output.status.code(),
        stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: started.elapsed(),
        source: None,
    })
}

/// Run a command, discarding stdout on success.
pub async fn run(name: &str, args: &[&str]) -> Result<(), CommandError> {
    run_with_output(name, args).await.map(drop)
}

/// Run a command and return its stdout. Failures carry the captured output.
pub async fn run_with_output(name: &str, args: &[&str]) -> Result<String, CommandError> {
    let started = Instant::now();
    let output = Command::new(name)
        .args(args)
        .output()
        .await
        .map_err(|e| CommandError::spawn(name, args, e, started))?;
    finish(name, args, output, started)
}

/// Run a command for its side effects only; failures are logged, not
/// propagated. Cleanup paths use this so a missing rule or device never
/// aborts a teardown.
pub async fn run_ignore_error(name: &str, args: &[&str]) -> String {
    match run_with_output(name, args).await {
        Ok(stdout) => stdout,
        Err(e) => {
            debug!(error = %e, "ignoring command failure");
            e.stdout
        }
    }
}

/// Run a command, killing the child when `timeout` elapses. A timeout is
/// reported as a synthesized error with no exit code.
pub async fn run_with_timeout(
    timeout: Duration,
    name: &str,
    args: &[&str],
) -> Result<String, CommandError> {
    let started = Instant::now();
    let mut command = Command::new(name);
    command.args(args).kill_on_drop(true);
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => finish(name, args, output, started),
        Ok(Err(e)) => Err(CommandError::spawn(name, args, e, started)),
        Err(_) => Err(CommandError {
            command: name.to_owned(),
            args: args.iter().map(|s| s.to_string()).collect(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: timeout,
            source: Some(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("command timed out after {timeout:?}"),
            )),
        }),
    }
}

/// Run a command feeding `input` to its stdin (`wg syncconf … /dev/stdin`).
pub async fn run_with_stdin(
    name: &str,
    args: &[&str],
    input: &str,
) -> Result<String, CommandError> {
    let started = Instant::now();
    let mut child = Command::new(name)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CommandError::spawn(name, args, e, started))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| CommandError::spawn(name, args, e, started))?;
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| CommandError::spawn(name, args, e, started))?;
    finish(name, args, output, started)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_with_output("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn failure_carries_exit_code_and_output() {
        let err = run("sh", &["-c", "echo out; echo err >&2; exit 3"])
            .await
            .unwrap_err();
        assert_eq!(err.exit_code, Some(3));
        assert_eq!(err.stdout.trim(), "out");
        assert_eq!(err.stderr.trim(), "err");
        let text = err.to_string();
        assert!(text.contains("exit code: 3"));
        assert!(text.contains("stderr: err"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = run("definitely-not-a-real-binary", &[]).await.unwrap_err();
        assert!(err.exit_code.is_none());
        assert!(err.source.is_some());
    }

    #[tokio::test]
    async fn ignore_error_swallows_failures() {
        let out = run_ignore_error("sh", &["-c", "echo partial; exit 1"]).await;
        assert_eq!(out.trim(), "partial");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let err = run_with_timeout(Duration::from_millis(100), "sleep", &["5"])
            .await
            .unwrap_err();
        assert!(err.exit_code.is_none());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn stdin_is_fed_to_the_child() {
        let out = run_with_stdin("cat", &[], "line one\nline two\n").await.unwrap();
        assert_eq!(out, "line one\nline two\n");
    }
}
