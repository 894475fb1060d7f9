//! Inbound event envelope and the facts derived from its payload.
//!
//! Facts are parsed once, when the envelope is built, and never change
//! afterwards. A payload that cannot be parsed is rejected up front so no
//! deployment work ever starts from a malformed event.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::config::default_environment;
use crate::error::{DeployError, Result};

/// Number of characters shown when a commit hash is displayed.
pub const SHORT_SHA_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CommitStatus,
    DeploymentRequest,
}

impl EventKind {
    /// Maps an `X-GitHub-Event` header value to a handled kind.
    pub fn from_github_event(name: &str) -> Option<Self> {
        match name {
            "status" => Some(EventKind::CommitStatus),
            "deployment" => Some(EventKind::DeploymentRequest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CommitStatus => "status",
            EventKind::DeploymentRequest => "deployment",
        }
    }
}

/// A full commit hash. `Display` prints the short form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitSha(String);

impl CommitSha {
    pub fn parse(raw: &str) -> Result<Self> {
        let len = raw.len();
        if !(7..=40).contains(&len) || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DeployError::Validation(format!(
                "'{}' is not a commit hash",
                raw
            )));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(SHORT_SHA_LEN)]
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts derived from a commit status event.
#[derive(Debug, Clone)]
pub struct CommitStatusFacts {
    pub sha: CommitSha,
    pub state: CommitState,
    /// Branch names in payload order.
    pub branches: Vec<String>,
    pub default_branch: String,
    pub repo_full_name: String,
    pub author: Option<String>,
}

impl CommitStatusFacts {
    pub fn from_payload(raw: &[u8]) -> Result<Self> {
        let payload: StatusPayload = serde_json::from_slice(raw)?;
        let branches = payload
            .branches
            .unwrap_or_default()
            .into_iter()
            .map(|b| b.name)
            .collect();
        Ok(Self {
            sha: CommitSha::parse(&payload.sha)?,
            state: payload.state,
            branches,
            default_branch: payload.repository.default_branch.ok_or_else(|| {
                DeployError::Validation("repository.default_branch is missing".to_string())
            })?,
            repo_full_name: payload.repository.full_name,
            author: payload
                .commit
                .and_then(|c| c.commit)
                .and_then(|c| c.author)
                .and_then(|a| a.login),
        })
    }

    pub fn successful(&self) -> bool {
        self.state == CommitState::Success
    }

    pub fn is_on_default_branch(&self) -> bool {
        self.branches.iter().any(|b| *b == self.default_branch)
    }

    pub fn first_branch(&self) -> Option<&str> {
        self.branches.first().map(String::as_str)
    }
}

/// Facts derived from a deployment request event (or synthesised for an
/// auto-deploy target).
#[derive(Debug, Clone)]
pub struct DeploymentRequestFacts {
    pub id: i64,
    pub repo_full_name: String,
    pub clone_url: String,
    pub sha: CommitSha,
    pub environment: String,
    pub config: Option<Map<String, Value>>,
}

impl DeploymentRequestFacts {
    pub fn from_payload(raw: &[u8]) -> Result<Self> {
        let payload: DeploymentPayload = serde_json::from_slice(raw)?;
        let clone_url = payload.repository.clone_url.ok_or_else(|| {
            DeployError::Validation("repository.clone_url is missing".to_string())
        })?;
        let (environment, config) = match payload.payload {
            Some(custom) => (
                custom.environment.unwrap_or_else(default_environment),
                custom.config,
            ),
            None => (default_environment(), None),
        };
        Ok(Self {
            id: payload.id,
            repo_full_name: payload.repository.full_name,
            clone_url,
            sha: CommitSha::parse(&payload.sha)?,
            environment,
            config,
        })
    }

    /// Hosting-platform app name for the requested environment. `None` means
    /// the request cannot be deployed.
    pub fn app_name(&self) -> Option<&str> {
        let config = self.config.as_ref()?;
        let key = if self.environment == "staging" {
            "heroku_staging_name"
        } else {
            "heroku_name"
        };
        config
            .get(key)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Clone URL carrying the deploy token as basic-auth user with an empty
    /// password.
    pub fn authenticated_clone_url(&self, token: &str) -> Result<String> {
        let mut url = url::Url::parse(&self.clone_url)
            .map_err(|e| DeployError::Validation(format!("bad clone url: {}", e)))?;
        url.set_username(token)
            .and_then(|_| url.set_password(Some("")))
            .map_err(|_| {
                DeployError::Validation(format!("clone url '{}' cannot carry credentials", self.clone_url))
            })?;
        Ok(url.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum EventFacts {
    CommitStatus(CommitStatusFacts),
    DeploymentRequest(DeploymentRequestFacts),
}

/// A normalised inbound event. Immutable once built.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    kind: EventKind,
    id: String,
    remote_ip: String,
    credential_token: String,
    raw_payload: Vec<u8>,
    facts: EventFacts,
}

impl EventEnvelope {
    pub fn new(
        kind: EventKind,
        id: impl Into<String>,
        remote_ip: impl Into<String>,
        credential_token: impl Into<String>,
        raw_payload: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let raw_payload = raw_payload.into();
        let facts = match kind {
            EventKind::CommitStatus => {
                EventFacts::CommitStatus(CommitStatusFacts::from_payload(&raw_payload)?)
            }
            EventKind::DeploymentRequest => {
                EventFacts::DeploymentRequest(DeploymentRequestFacts::from_payload(&raw_payload)?)
            }
        };
        Ok(Self {
            kind,
            id: id.into(),
            remote_ip: remote_ip.into(),
            credential_token: credential_token.into(),
            raw_payload,
            facts,
        })
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    pub fn credential_token(&self) -> &str {
        &self.credential_token
    }

    pub fn raw_payload(&self) -> &[u8] {
        &self.raw_payload
    }

    pub fn facts(&self) -> &EventFacts {
        &self.facts
    }
}

// Wire shapes. Only the fields the pipeline reads are declared.

#[derive(Deserialize)]
struct StatusPayload {
    sha: String,
    state: CommitState,
    branches: Option<Vec<BranchPayload>>,
    repository: RepositoryPayload,
    commit: Option<CommitPayload>,
}

#[derive(Deserialize)]
struct BranchPayload {
    name: String,
}

#[derive(Deserialize)]
struct RepositoryPayload {
    full_name: String,
    default_branch: Option<String>,
    clone_url: Option<String>,
}

#[derive(Deserialize)]
struct CommitPayload {
    commit: Option<InnerCommitPayload>,
}

#[derive(Deserialize)]
struct InnerCommitPayload {
    author: Option<AuthorPayload>,
}

#[derive(Deserialize)]
struct AuthorPayload {
    login: Option<String>,
}

#[derive(Deserialize)]
struct DeploymentPayload {
    id: i64,
    sha: String,
    repository: RepositoryPayload,
    payload: Option<CustomPayload>,
}

#[derive(Deserialize)]
struct CustomPayload {
    environment: Option<String>,
    config: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SHA: &str = "abcdef1234567890abcdef1234567890abcdef12";

    fn status_payload(state: &str, branches: Value) -> Vec<u8> {
        json!({
            "sha": SHA,
            "state": state,
            "branches": branches,
            "repository": {"default_branch": "main", "full_name": "org/app"},
            "commit": {"commit": {"author": {"login": "octocat"}}},
        })
        .to_string()
        .into_bytes()
    }

    fn deployment_payload(payload: Value) -> Vec<u8> {
        json!({
            "id": 42,
            "sha": SHA,
            "repository": {
                "clone_url": "https://github.com/org/app.git",
                "full_name": "org/app",
                "default_branch": "main",
            },
            "payload": payload,
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn short_sha_is_first_eight_chars() {
        for len in 8..=40 {
            let sha = CommitSha::parse(&SHA[..len]).unwrap();
            assert_eq!(sha.to_string(), &SHA[..8]);
            assert_eq!(sha.as_str(), &SHA[..len]);
        }
    }

    #[test]
    fn seven_char_sha_displays_whole() {
        let sha = CommitSha::parse("abcdef1").unwrap();
        assert_eq!(sha.to_string(), "abcdef1");
    }

    #[test]
    fn rejects_non_hex_sha() {
        assert!(CommitSha::parse("not-a-sha").is_err());
        assert!(CommitSha::parse("abc").is_err());
        assert!(CommitSha::parse(&"a".repeat(41)).is_err());
    }

    #[test]
    fn status_facts_on_default_branch() {
        let facts =
            CommitStatusFacts::from_payload(&status_payload("success", json!([{"name": "main"}])))
                .unwrap();
        assert!(facts.successful());
        assert!(facts.is_on_default_branch());
        assert_eq!(facts.repo_full_name, "org/app");
        assert_eq!(facts.author.as_deref(), Some("octocat"));
        assert_eq!(facts.first_branch(), Some("main"));
    }

    #[test]
    fn missing_branches_means_not_on_default_branch() {
        let mut raw: Value = serde_json::from_slice(&status_payload("success", json!([]))).unwrap();
        raw.as_object_mut().unwrap().remove("branches");
        let facts = CommitStatusFacts::from_payload(raw.to_string().as_bytes()).unwrap();
        assert!(!facts.is_on_default_branch());
        assert_eq!(facts.first_branch(), None);
    }

    #[test]
    fn unknown_state_is_rejected() {
        let err = CommitStatusFacts::from_payload(&status_payload("exploded", json!([])))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn deployment_defaults_to_production() {
        let facts = DeploymentRequestFacts::from_payload(&deployment_payload(
            json!({"config": {"heroku_name": "app-prod", "heroku_staging_name": "app-stg"}}),
        ))
        .unwrap();
        assert_eq!(facts.id, 42);
        assert_eq!(facts.environment, "production");
        assert_eq!(facts.app_name(), Some("app-prod"));
    }

    #[test]
    fn staging_uses_staging_app_name() {
        let facts = DeploymentRequestFacts::from_payload(&deployment_payload(json!({
            "environment": "staging",
            "config": {"heroku_name": "app-prod", "heroku_staging_name": "app-stg"}
        })))
        .unwrap();
        assert_eq!(facts.app_name(), Some("app-stg"));
    }

    #[test]
    fn no_config_means_no_app_name() {
        let facts =
            DeploymentRequestFacts::from_payload(&deployment_payload(Value::Null)).unwrap();
        assert_eq!(facts.environment, "production");
        assert_eq!(facts.app_name(), None);
    }

    #[test]
    fn clone_url_embeds_token() {
        let facts =
            DeploymentRequestFacts::from_payload(&deployment_payload(Value::Null)).unwrap();
        let url = facts.authenticated_clone_url("s3cret").unwrap();
        assert!(url.starts_with("https://s3cret"));
        assert!(url.ends_with("@github.com/org/app.git"));
    }

    #[test]
    fn envelope_parses_facts_once() {
        let envelope = EventEnvelope::new(
            EventKind::DeploymentRequest,
            "guid-1",
            "127.0.0.1",
            "token",
            deployment_payload(Value::Null),
        )
        .unwrap();
        assert_eq!(envelope.kind(), EventKind::DeploymentRequest);
        assert!(matches!(envelope.facts(), EventFacts::DeploymentRequest(f) if f.id == 42));
    }

    #[test]
    fn envelope_rejects_malformed_payload() {
        let result = EventEnvelope::new(
            EventKind::CommitStatus,
            "guid-2",
            "127.0.0.1",
            "token",
            b"not json".to_vec(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn maps_github_event_names() {
        assert_eq!(EventKind::from_github_event("status"), Some(EventKind::CommitStatus));
        assert_eq!(
            EventKind::from_github_event("deployment"),
            Some(EventKind::DeploymentRequest)
        );
        assert_eq!(EventKind::from_github_event("push"), None);
    }
}
