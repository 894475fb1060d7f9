//! GitHub API client: commit statuses, gist log artifacts, webhook meta,
//! and webhook signature verification.

use async_trait::async_trait;
use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, error};

use crate::error::{DeployError, Result};
use crate::output::{LogHandle, OutputLogStore, artifact_description, pending_body};
use crate::remote_ip::AllowListSource;
use crate::status::{StatusReporter, StatusUpdate};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "github";
const ACCEPT_GITHUB_JSON: &str = "application/vnd.github+json";
const EMPTY_OUTPUT: &str = "(no output)";

/// Helper function for verifying GitHub webhook signature
pub fn verify_github_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    // Expected format: "sha256=..."
    let Some(git_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    match hex_decode(git_signature) {
        // Constant-time comparison
        Ok(git_signature_bytes) => mac.verify_slice(&git_signature_bytes).is_ok(),
        Err(_) => {
            error!("Signature verification failed");
            false
        }
    }
}

#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_url, path))
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(ACCEPT, ACCEPT_GITHUB_JSON)
            .header(USER_AGENT, concat!("autodeploy/", env!("CARGO_PKG_VERSION")))
    }

    async fn send_checked(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DeployError::reporting(SERVICE, format!("{} {}", status, text)));
        }
        Ok(resp)
    }
}

pub(crate) fn status_body(update: &StatusUpdate) -> serde_json::Value {
    let mut body = json!({
        "state": update.state,
        "description": update.state.description(),
        "context": update.context(),
    });
    if let Some(url) = &update.log_url {
        body["target_url"] = json!(url);
    }
    body
}

fn gist_file(content: &str) -> serde_json::Value {
    let content = if content.is_empty() { EMPTY_OUTPUT } else { content };
    json!({ "content": content })
}

#[derive(Deserialize)]
struct GistResponse {
    id: String,
    html_url: String,
}

#[derive(Deserialize)]
struct MetaResponse {
    #[serde(default)]
    hooks: Vec<String>,
}

#[async_trait]
impl StatusReporter for GitHubClient {
    async fn send(&self, update: &StatusUpdate) -> Result<()> {
        let path = format!(
            "/repos/{}/statuses/{}",
            update.repo_full_name,
            update.commit_sha.as_str()
        );
        self.send_checked(
            self.request(reqwest::Method::POST, &path)
                .json(&status_body(update)),
        )
        .await?;
        debug!(
            repo = %update.repo_full_name,
            sha = %update.commit_sha,
            state = ?update.state,
            "Posted commit status"
        );
        Ok(())
    }
}

#[async_trait]
impl OutputLogStore for GitHubClient {
    async fn create(&self, app_name: Option<&str>, number: i64, guid: &str) -> Result<LogHandle> {
        let body = json!({
            "description": artifact_description(app_name, number),
            "public": false,
            "files": { "stdout": gist_file(&pending_body(number)) },
        });
        let gist: GistResponse = self
            .send_checked(self.request(reqwest::Method::POST, "/gists").json(&body))
            .await?
            .json()
            .await?;
        debug!(guid, gist = %gist.id, "Created output gist");
        Ok(LogHandle {
            id: gist.id,
            url: gist.html_url,
        })
    }

    async fn update(&self, handle: &LogHandle, stdout: &str, stderr: &str) -> Result<()> {
        let body = json!({
            "files": {
                "stdout": gist_file(stdout),
                "stderr": gist_file(stderr),
            },
        });
        self.send_checked(
            self.request(reqwest::Method::PATCH, &format!("/gists/{}", handle.id))
                .json(&body),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AllowListSource for GitHubClient {
    async fn hook_blocks(&self) -> Result<Vec<String>> {
        let meta: MetaResponse = self
            .send_checked(self.request(reqwest::Method::GET, "/meta"))
            .await?
            .json()
            .await?;
        Ok(meta.hooks)
    }
}
