//! Process configuration: TOML file plus environment overrides.
//!
//! Everything the core needs (tokens, hosting credentials, paths, timeouts)
//! arrives through [`DeployConfig`]; nothing below `main` reads the
//! environment directly.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{DeployError, Result};

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8888";
pub const DEFAULT_CONFIG_PATH: &str = "autodeploy.toml";
pub const DEFAULT_DATABASE_PATH: &str = "autodeploy.db";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GITHUB_WEB_URL: &str = "https://github.com";
pub const UNKNOWN_TOKEN: &str = "<unknown>";

const VENDORED_DPL_PATH: &str = "/app/vendor/bundle/bin/dpl";
const LOCAL_DPL_PATH: &str = "bin/dpl";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeployConfig {
    pub bind_address: String,
    pub database_path: PathBuf,
    /// Rolling file logs are written here when set.
    pub log_directory: Option<PathBuf>,
    pub github: GitHubConfig,
    pub heroku: HerokuConfig,
    pub deploy: DeployOptions,
    #[serde(rename = "target")]
    pub targets: Vec<TargetConfig>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            log_directory: None,
            github: GitHubConfig::default(),
            heroku: HerokuConfig::default(),
            deploy: DeployOptions::default(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GitHubConfig {
    /// Deploy token: API bearer token and clone URL username.
    pub token: String,
    pub api_url: String,
    /// Web host that repositories are cloned from.
    pub web_url: String,
    pub webhook_secret: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: UNKNOWN_TOKEN.to_string(),
            api_url: DEFAULT_GITHUB_API_URL.to_string(),
            web_url: DEFAULT_GITHUB_WEB_URL.to_string(),
            webhook_secret: None,
        }
    }
}

impl GitHubConfig {
    /// Returns true if a valid (non-empty) webhook_secret is set.
    pub fn has_webhook_secret(&self) -> bool {
        self.webhook_secret
            .as_ref()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HerokuConfig {
    pub username: String,
    pub password: String,
    pub api_key: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeployOptions {
    /// Working directories are created below this root.
    pub scratch_root: PathBuf,
    pub dpl_path: Option<PathBuf>,
    /// Replace the hosting-platform deploy with a no-op command.
    pub dry_run: bool,
    pub command_timeout_secs: u64,
    pub execution_timeout_secs: u64,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir(),
            dpl_path: None,
            dry_run: false,
            command_timeout_secs: 600,
            execution_timeout_secs: 1800,
        }
    }
}

impl DeployOptions {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// Returns the configured dpl binary, falling back to the vendored
    /// bundle path when present and `bin/dpl` otherwise.
    pub fn resolve_dpl_path(&self) -> PathBuf {
        if let Some(path) = &self.dpl_path {
            return path.clone();
        }
        let vendored = Path::new(VENDORED_DPL_PATH);
        if vendored.exists() {
            vendored.to_path_buf()
        } else {
            PathBuf::from(LOCAL_DPL_PATH)
        }
    }
}

/// A `[[target]]` entry seeded into the target registry at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub repository: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    pub heroku_name: Option<String>,
    pub heroku_staging_name: Option<String>,
}

impl TargetConfig {
    /// The deployment config payload carried by requests for this target.
    pub fn payload_config(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut config = serde_json::Map::new();
        if let Some(name) = &self.heroku_name {
            config.insert("heroku_name".into(), name.clone().into());
        }
        if let Some(name) = &self.heroku_staging_name {
            config.insert("heroku_staging_name".into(), name.clone().into());
        }
        config
    }
}

pub(crate) fn default_environment() -> String {
    "production".to_string()
}

impl DeployConfig {
    /// Load and parse the configuration file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Configuration(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<Self> {
        Ok(toml::from_str(config_str)?)
    }

    /// Applies overrides from a variable lookup (the process environment in
    /// `main`, a map in tests).
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("GITHUB_DEPLOY_TOKEN") {
            self.github.token = token;
        }
        if let Some(secret) = lookup("GITHUB_WEBHOOK_SECRET") {
            self.github.webhook_secret = Some(secret);
        }
        if let Some(username) = lookup("HEROKU_USERNAME") {
            self.heroku.username = username;
        }
        if let Some(password) = lookup("HEROKU_PASSWORD") {
            self.heroku.password = password;
        }
        if let Some(api_key) = lookup("HEROKU_API_KEY") {
            self.heroku.api_key = api_key;
        }
        if let Some(bind) = lookup("BIND_ADDRESS") {
            self.bind_address = bind;
        }
        if let Some(dry_run) = lookup("AUTODEPLOY_DRY_RUN") {
            self.deploy.dry_run = matches!(dry_run.as_str(), "1" | "true" | "yes");
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.deploy.execution_timeout_secs == 0 || self.deploy.command_timeout_secs == 0 {
            return Err(DeployError::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        for target in &self.targets {
            if !target.repository.contains('/') {
                return Err(DeployError::Configuration(format!(
                    "target repository '{}' must be in owner/name form",
                    target.repository
                )));
            }
        }
        Ok(())
    }
}
