//! Deployment targets registered for auto-deploy.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// A (repository, environment) pair eligible for auto-deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentTarget {
    pub id: i64,
    pub repository: String,
    pub environment: String,
    /// Deployment config payload (`heroku_name`, `heroku_staging_name`, ...).
    pub config: Option<Map<String, Value>>,
}

impl DeploymentTarget {
    /// HTTPS clone URL on the given web host, e.g. `https://github.com`.
    pub fn clone_url(&self, web_url: &str) -> String {
        format!("{}/{}.git", web_url.trim_end_matches('/'), self.repository)
    }
}

#[async_trait]
pub trait TargetRegistry: Send + Sync {
    /// Targets for a repository. No targets is an empty list, not an error.
    async fn targets_for(&self, repo_full_name: &str) -> Result<Vec<DeploymentTarget>>;
}
