//! Runs one deployment request: checkout, deploy, publish logs, report.
//!
//! The pending status (with a link to the log artifact) goes out before any
//! local work starts. From then on every path, including configuration
//! errors, failed commands and timeouts, ends in exactly one terminal
//! status. Step failures never escape as errors; they become a failed
//! deployment with its output attached.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{DeployConfig, HerokuConfig};
use crate::error::{DeployError, Result};
use crate::event::{CommitSha, DeploymentRequestFacts};
use crate::output::{LogHandle, OutputLogStore};
use crate::runner::{Invocation, ProcessOutput, ProcessRunner};
use crate::status::{DeployStatus, StatusReporter};
use crate::workspace::{ExecutionLogs, WorkingDirectory, WorkspaceLocks};

/// Command used in place of the deploy when running dry.
pub const DRY_RUN_COMMAND: &str = "true";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Started,
    Cloning,
    Fetching,
    Deploying,
    Succeeded,
    Failed,
}

/// State of one deployment attempt. Dropped once the terminal status is out.
#[derive(Debug)]
pub struct DeploymentExecution {
    pub working_dir: WorkingDirectory,
    pub checkout_dir: PathBuf,
    pub logs: ExecutionLogs,
    pub status: ExecutionStatus,
}

impl DeploymentExecution {
    fn new(working_dir: WorkingDirectory, guid: &str) -> Self {
        Self {
            checkout_dir: working_dir.checkout_dir(),
            logs: working_dir.logs_for(guid),
            working_dir,
            status: ExecutionStatus::Started,
        }
    }

    fn transition(&mut self, status: ExecutionStatus) {
        info!(from = ?self.status, to = ?status, "Deployment state change");
        self.status = status;
    }
}

/// What happened to one deployment request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub guid: String,
    pub repository: String,
    pub environment: String,
    pub sha: String,
    pub status: ExecutionStatus,
    pub log_url: Option<String>,
    pub failure: Option<String>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub scratch_root: PathBuf,
    pub heroku: HerokuConfig,
    pub dpl_path: PathBuf,
    pub dry_run: bool,
    pub execution_timeout: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            scratch_root: config.deploy.scratch_root.clone(),
            heroku: config.heroku.clone(),
            dpl_path: config.deploy.resolve_dpl_path(),
            dry_run: config.deploy.dry_run,
            execution_timeout: config.deploy.execution_timeout(),
        }
    }
}

pub struct DeploymentExecutor {
    settings: ExecutorSettings,
    runner: Arc<dyn ProcessRunner>,
    reporter: Arc<dyn StatusReporter>,
    output: Arc<dyn OutputLogStore>,
    locks: Arc<WorkspaceLocks>,
}

impl DeploymentExecutor {
    pub fn new(
        settings: ExecutorSettings,
        runner: Arc<dyn ProcessRunner>,
        reporter: Arc<dyn StatusReporter>,
        output: Arc<dyn OutputLogStore>,
        locks: Arc<WorkspaceLocks>,
    ) -> Self {
        Self {
            settings,
            runner,
            reporter,
            output,
            locks,
        }
    }

    pub fn working_directory(&self, repo_full_name: &str, token: &str) -> WorkingDirectory {
        WorkingDirectory::derive(&self.settings.scratch_root, repo_full_name, token)
    }

    /// Runs the request with `token` as the source-control credential.
    pub async fn execute(
        &self,
        facts: &DeploymentRequestFacts,
        guid: &str,
        token: &str,
    ) -> ExecutionReport {
        let span = info_span!(
            "deploy",
            guid,
            repo = %facts.repo_full_name,
            environment = %facts.environment,
            sha = %facts.sha,
        );
        self.execute_inner(facts, guid, token).instrument(span).await
    }

    async fn execute_inner(
        &self,
        facts: &DeploymentRequestFacts,
        guid: &str,
        token: &str,
    ) -> ExecutionReport {
        let mut execution =
            DeploymentExecution::new(self.working_directory(&facts.repo_full_name, token), guid);
        let app_name = facts.app_name();

        let (status, handle) = self.deploy_started(facts, app_name, guid).await;

        let outcome = match app_name {
            None => Err(DeployError::Configuration(format!(
                "no app name configured for environment '{}'",
                facts.environment
            ))),
            Some(app_name) => {
                let steps = self.run_steps(&mut execution, facts, app_name, token);
                match tokio::time::timeout(self.settings.execution_timeout, steps).await {
                    Ok(result) => result,
                    Err(_) => Err(DeployError::Execution {
                        operation: "deployment".to_string(),
                        message: format!(
                            "timed out after {:?}",
                            self.settings.execution_timeout
                        ),
                    }),
                }
            }
        };

        self.deploy_completed(execution, status, handle, outcome, facts, guid)
            .await
    }

    async fn deploy_started(
        &self,
        facts: &DeploymentRequestFacts,
        app_name: Option<&str>,
        guid: &str,
    ) -> (DeployStatus<'_>, Option<LogHandle>) {
        let handle = match self.output.create(app_name, facts.id, guid).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Could not create output log: {}", e);
                None
            }
        };

        let mut status = DeployStatus::new(
            self.reporter.as_ref(),
            &facts.repo_full_name,
            &facts.sha,
            &facts.environment,
        );
        status.set_output(handle.as_ref().map(|h| h.url().to_string()));
        if let Err(e) = status.pending().await {
            warn!("Could not report pending status: {}", e);
        }
        info!(app = app_name.unwrap_or("-"), "Deployment started");
        (status, handle)
    }

    async fn run_steps(
        &self,
        execution: &mut DeploymentExecution,
        facts: &DeploymentRequestFacts,
        app_name: &str,
        token: &str,
    ) -> Result<()> {
        let _lock = self.locks.acquire(&execution.working_dir).await;
        execution.working_dir.ensure().await?;

        if execution.working_dir.has_checkout().await {
            info!("Reusing checkout at {}", execution.checkout_dir.display());
        } else {
            execution.transition(ExecutionStatus::Cloning);
            self.clone_repository(execution, facts, token).await?;
        }

        execution.transition(ExecutionStatus::Fetching);
        info!("Fetching the latest code");
        let fetch = Invocation::new(["git", "fetch"]).in_dir(&execution.checkout_dir);
        self.run_checked(execution, "git fetch", fetch).await?;
        let reset = Invocation::new(["git", "reset", "--hard", facts.sha.as_str()])
            .in_dir(&execution.checkout_dir);
        self.run_checked(execution, "git reset", reset).await?;

        execution.transition(ExecutionStatus::Deploying);
        info!("Pushing to heroku");
        let deploy = self
            .deploy_invocation(app_name)
            .in_dir(&execution.checkout_dir);
        self.run_checked(execution, "deploy", deploy).await?;
        Ok(())
    }

    async fn clone_repository(
        &self,
        execution: &DeploymentExecution,
        facts: &DeploymentRequestFacts,
        token: &str,
    ) -> Result<()> {
        info!(
            "Cloning {} into {}",
            facts.clone_url,
            execution.checkout_dir.display()
        );
        let url = facts.authenticated_clone_url(token)?;
        // Leftover from a clone that was cut short by the deadline.
        let partial = execution.working_dir.partial_checkout_dir();
        remove_dir_if_present(&partial).await?;

        let clone = Invocation::new([
            "git".to_string(),
            "clone".to_string(),
            url,
            partial.to_string_lossy().into_owned(),
        ])
        .redacting(token);

        match self.run_checked(execution, "git clone", clone).await {
            Ok(_) => {
                tokio::fs::rename(&partial, &execution.checkout_dir).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = remove_dir_if_present(&partial).await {
                    warn!("Could not remove failed checkout: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn deploy_invocation(&self, app_name: &str) -> Invocation {
        if self.settings.dry_run {
            return Invocation::new([DRY_RUN_COMMAND]);
        }
        let heroku = &self.settings.heroku;
        Invocation::new([
            self.settings.dpl_path.to_string_lossy().into_owned(),
            "--provider=heroku".to_string(),
            "--strategy=git".to_string(),
            format!("--api-key={}", heroku.api_key),
            format!("--username={}", heroku.username),
            format!("--password={}", heroku.password),
            format!("--app={}", app_name),
        ])
        .redacting(heroku.api_key.as_str())
        .redacting(heroku.password.as_str())
    }

    /// Runs a command, appends its output to the execution logs whatever the
    /// exit code, and returns the output.
    async fn run_logged(
        &self,
        execution: &DeploymentExecution,
        invocation: &Invocation,
    ) -> Result<ProcessOutput> {
        info!("Running: {}", invocation);
        let output = self.runner.run(invocation).await;
        let header = format!("$ {}\n", invocation);
        execution.logs.append(header.as_bytes(), b"").await?;
        execution.logs.append(&output.stdout, &output.stderr).await?;
        Ok(output)
    }

    async fn run_checked(
        &self,
        execution: &DeploymentExecution,
        operation: &str,
        invocation: Invocation,
    ) -> Result<ProcessOutput> {
        let output = self.run_logged(execution, &invocation).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(DeployError::Execution {
                operation: operation.to_string(),
                message: format!("exit code {}", output.exit_code),
            })
        }
    }

    async fn deploy_completed(
        &self,
        mut execution: DeploymentExecution,
        status: DeployStatus<'_>,
        handle: Option<LogHandle>,
        outcome: Result<()>,
        facts: &DeploymentRequestFacts,
        guid: &str,
    ) -> ExecutionReport {
        let successful = outcome.is_ok();
        let failure = outcome.err().map(|e| {
            error!(kind = ?e.kind(), "Deployment failed: {}", e);
            e.to_string()
        });

        let (stdout, mut stderr) = match execution.logs.read().await {
            Ok(logs) => logs,
            Err(e) => (String::new(), format!("could not read captured output: {}\n", e)),
        };
        if let Some(reason) = &failure {
            stderr.push_str(reason);
            stderr.push('\n');
        }

        if let Some(handle) = &handle {
            if let Err(e) = self.output.update(handle, &stdout, &stderr).await {
                warn!("Could not publish deployment output: {}", e);
            }
        }

        execution.transition(if successful {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        });

        let log_url = status.log_url().map(str::to_string);
        if let Err(e) = status.complete(successful).await {
            warn!("Could not report final status: {}", e);
        }
        info!(successful, "Deployment finished");

        ExecutionReport {
            guid: guid.to_string(),
            repository: facts.repo_full_name.clone(),
            environment: facts.environment.clone(),
            sha: display_sha(&facts.sha),
            status: execution.status,
            log_url,
            failure,
        }
    }
}

async fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn display_sha(sha: &CommitSha) -> String {
    sha.short().to_string()
}
