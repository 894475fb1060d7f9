//! Decides whether a commit status should trigger auto-deploys.

use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::event::{CommitSha, CommitState, CommitStatusFacts, DeploymentRequestFacts};
use crate::registry::{DeploymentTarget, TargetRegistry};

/// What to do with a commit status event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The build did not succeed.
    NotSuccessful {
        repo: String,
        state: CommitState,
        branch: Option<String>,
        sha: CommitSha,
    },
    /// The build succeeded on a branch other than the default branch.
    NotDefaultBranch {
        repo: String,
        branch: Option<String>,
        sha: CommitSha,
    },
    Deploy,
}

impl Decision {
    pub fn decide(facts: &CommitStatusFacts) -> Self {
        let branch = facts.first_branch().map(str::to_string);
        if !facts.successful() {
            return Decision::NotSuccessful {
                repo: facts.repo_full_name.clone(),
                state: facts.state,
                branch,
                sha: facts.sha.clone(),
            };
        }
        if !facts.is_on_default_branch() {
            return Decision::NotDefaultBranch {
                repo: facts.repo_full_name.clone(),
                branch,
                sha: facts.sha.clone(),
            };
        }
        Decision::Deploy
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::NotSuccessful {
                repo,
                state,
                branch,
                sha,
            } => write!(
                f,
                "Ignoring commit status({}) for {}+{}@{}",
                state,
                repo,
                branch.as_deref().unwrap_or("-"),
                sha
            ),
            Decision::NotDefaultBranch { repo, branch, sha } => write!(
                f,
                "Ignoring commit status(success) for {}+{}@{}: not the default branch",
                repo,
                branch.as_deref().unwrap_or("-"),
                sha
            ),
            Decision::Deploy => f.write_str("Deploying"),
        }
    }
}

/// One deployment produced from a commit status.
#[derive(Debug, Clone)]
pub struct DispatchedDeployment {
    pub target: DeploymentTarget,
    pub request: DeploymentRequestFacts,
    /// Per-dispatch event id; names the log files of the execution.
    pub guid: String,
}

pub struct CommitStatusEvaluator {
    registry: Arc<dyn TargetRegistry>,
    web_url: String,
}

impl CommitStatusEvaluator {
    /// `web_url` is the source-control web host synthetic deployments clone from.
    pub fn new(registry: Arc<dyn TargetRegistry>, web_url: &str) -> Self {
        Self {
            registry,
            web_url: web_url.to_string(),
        }
    }

    /// Returns one dispatch per registered target when the status is a
    /// successful build on the default branch, otherwise none.
    pub async fn evaluate(
        &self,
        facts: &CommitStatusFacts,
        guid: &str,
    ) -> Result<Vec<DispatchedDeployment>> {
        let decision = Decision::decide(facts);
        if decision != Decision::Deploy {
            info!(guid, "{}", decision);
            return Ok(Vec::new());
        }

        let targets = self.registry.targets_for(&facts.repo_full_name).await?;
        if targets.is_empty() {
            info!(guid, repo = %facts.repo_full_name, "No deployment targets registered");
        }

        let dispatched = targets
            .into_iter()
            .map(|target| {
                info!(
                    guid,
                    author = facts.author.as_deref().unwrap_or("-"),
                    "Deploying {}@{} to {}",
                    facts.repo_full_name,
                    facts.sha,
                    target.environment
                );
                let request = DeploymentRequestFacts {
                    id: target.id,
                    repo_full_name: facts.repo_full_name.clone(),
                    clone_url: target.clone_url(&self.web_url),
                    sha: facts.sha.clone(),
                    environment: target.environment.clone(),
                    config: target.config.clone(),
                };
                DispatchedDeployment {
                    guid: format!("{}-{}", guid, target.environment),
                    target,
                    request,
                }
            })
            .collect();

        Ok(dispatched)
    }
}
