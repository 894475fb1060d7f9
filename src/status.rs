//! Commit status reporting back to the source-control provider.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::event::CommitSha;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
}

impl StatusState {
    pub fn description(&self) -> &'static str {
        match self {
            StatusState::Pending => "Deployment started",
            StatusState::Success => "Deployment succeeded",
            StatusState::Failure => "Deployment failed",
        }
    }
}

/// One status transition for a commit in a target environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub repo_full_name: String,
    pub commit_sha: CommitSha,
    pub target_environment: String,
    pub state: StatusState,
    pub log_url: Option<String>,
}

impl StatusUpdate {
    /// Status context shown next to the commit, one per environment.
    pub fn context(&self) -> String {
        format!("deploy/{}", self.target_environment)
    }
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Sends one update. Callers log failures and carry on; nothing retries.
    async fn send(&self, update: &StatusUpdate) -> Result<()>;
}

/// The status of one deployment attempt.
///
/// `pending` may be sent once at the start; `complete` consumes the value so
/// a second terminal status cannot be sent for the same attempt.
pub struct DeployStatus<'a> {
    reporter: &'a dyn StatusReporter,
    repo_full_name: String,
    commit_sha: CommitSha,
    environment: String,
    log_url: Option<String>,
}

impl<'a> DeployStatus<'a> {
    pub fn new(
        reporter: &'a dyn StatusReporter,
        repo_full_name: &str,
        commit_sha: &CommitSha,
        environment: &str,
    ) -> Self {
        Self {
            reporter,
            repo_full_name: repo_full_name.to_string(),
            commit_sha: commit_sha.clone(),
            environment: environment.to_string(),
            log_url: None,
        }
    }

    pub fn set_output(&mut self, log_url: Option<String>) {
        self.log_url = log_url;
    }

    pub fn log_url(&self) -> Option<&str> {
        self.log_url.as_deref()
    }

    pub async fn pending(&self) -> Result<()> {
        self.reporter.send(&self.update(StatusState::Pending)).await
    }

    pub async fn complete(self, successful: bool) -> Result<()> {
        let state = if successful {
            StatusState::Success
        } else {
            StatusState::Failure
        };
        self.reporter.send(&self.update(state)).await
    }

    fn update(&self, state: StatusState) -> StatusUpdate {
        StatusUpdate {
            repo_full_name: self.repo_full_name.clone(),
            commit_sha: self.commit_sha.clone(),
            target_environment: self.environment.clone(),
            state,
            log_url: self.log_url.clone(),
        }
    }
}
