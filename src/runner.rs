//! External command execution with captured output.
//!
//! Commands are always argument lists handed straight to the OS; nothing is
//! ever assembled into a shell string. A nonzero exit is an ordinary result.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, warn};

/// Exit code reported when the command never produced one (spawn failure,
/// timeout, killed by signal).
pub const NO_EXIT_CODE: i32 = -1;

/// One command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    /// Substrings masked when the invocation is displayed.
    secrets: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            current_dir: None,
            secrets: Vec::new(),
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn redacting(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, arg) in self.args.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            let mut shown = arg.clone();
            for secret in &self.secrets {
                shown = shown.replace(secret.as_str(), "***");
            }
            f.write_str(&shown)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn failed_to_run(message: impl Into<String>) -> Self {
        let mut stderr = message.into().into_bytes();
        stderr.push(b'\n');
        Self {
            stdout: Vec::new(),
            stderr,
            exit_code: NO_EXIT_CODE,
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs the command to completion. Never fails: spawn errors and
    /// timeouts come back as [`NO_EXIT_CODE`] with a note on stderr.
    async fn run(&self, invocation: &Invocation) -> ProcessOutput;
}

/// Runs commands as tokio child processes with a per-command timeout.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    timeout: Duration,
}

impl TokioProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: &Invocation) -> ProcessOutput {
        let Some(program) = invocation.program() else {
            return ProcessOutput::failed_to_run("empty command");
        };

        let mut command = Command::new(program);
        command
            .args(&invocation.args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => ProcessOutput {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.status.code().unwrap_or(NO_EXIT_CODE),
            },
            Ok(Err(e)) => {
                error!("{} failed to start: {}", invocation, e);
                ProcessOutput::failed_to_run(format!("failed to start {}: {}", program, e))
            }
            Err(_) => {
                warn!("{} timed out after {}s", invocation, self.timeout.as_secs());
                ProcessOutput::failed_to_run(format!(
                    "{} timed out after {}s",
                    program,
                    self.timeout.as_secs()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_masks_credentials() {
        let invocation = Invocation::new(["dpl", "--api-key=secret", "--app=demo"])
            .redacting("secret")
            .redacting("");
        assert_eq!(invocation.to_string(), "dpl --api-key=*** --app=demo");

        let clone = Invocation::new(["git", "clone", "https://tok3n@github.com/org/app.git"])
            .redacting("tok3n");
        assert_eq!(clone.to_string(), "git clone https://***@github.com/org/app.git");
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = TokioProcessRunner::new(Duration::from_secs(10));
        let output = runner.run(&Invocation::new(["echo", "hello"])).await;
        assert!(output.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let runner = TokioProcessRunner::new(Duration::from_secs(10));
        let output = runner.run(&Invocation::new(["false"])).await;
        assert!(!output.success());
        assert_eq!(output.exit_code, 1);
    }

    #[tokio::test]
    async fn missing_program_reports_no_exit_code() {
        let runner = TokioProcessRunner::new(Duration::from_secs(10));
        let output = runner
            .run(&Invocation::new(["definitely-not-a-real-binary-xyz"]))
            .await;
        assert_eq!(output.exit_code, NO_EXIT_CODE);
        assert!(String::from_utf8_lossy(&output.stderr).contains("failed to start"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let runner = TokioProcessRunner::new(Duration::from_millis(100));
        let output = runner.run(&Invocation::new(["sleep", "5"])).await;
        assert_eq!(output.exit_code, NO_EXIT_CODE);
        assert!(String::from_utf8_lossy(&output.stderr).contains("timed out"));
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TokioProcessRunner::new(Duration::from_secs(10));
        let output = runner
            .run(&Invocation::new(["pwd"]).in_dir(dir.path()))
            .await;
        let printed = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(&printed).canonicalize().unwrap(), expected);
    }
}
