pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod executor;
pub mod github;
pub mod idempotency;
pub mod logging;
pub mod output;
pub mod receiver;
pub mod registry;
pub mod remote_ip;
pub mod runner;
pub mod status;
pub mod workspace;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use config::DeployConfig;
use db::SqlStore;
use receiver::Receiver;

pub struct AppState {
    pub config: DeployConfig,
    pub receiver: Arc<Receiver>,
    pub store: SqlStore,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;
