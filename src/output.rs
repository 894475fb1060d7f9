//! Remote log artifacts for deployment output.

use async_trait::async_trait;

use crate::error::Result;

/// A created log artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHandle {
    pub id: String,
    pub url: String,
}

impl LogHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
pub trait OutputLogStore: Send + Sync {
    /// Creates the artifact before the deployment starts so its URL can go
    /// on the pending status.
    async fn create(&self, app_name: Option<&str>, number: i64, guid: &str) -> Result<LogHandle>;

    /// Publishes the final captured output. Called once per execution.
    async fn update(&self, handle: &LogHandle, stdout: &str, stderr: &str) -> Result<()>;
}

pub(crate) fn artifact_description(app_name: Option<&str>, number: i64) -> String {
    format!("Heaven number {} for {}", number, app_name.unwrap_or("unknown"))
}

pub(crate) fn pending_body(number: i64) -> String {
    format!("Deployment {} pending", number)
}
