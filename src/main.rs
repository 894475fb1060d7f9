use autodeploy::config::{DEFAULT_CONFIG_PATH, DeployConfig};
use autodeploy::db::{SqlStore, init_db};
use autodeploy::error::DeployError;
use autodeploy::evaluator::CommitStatusEvaluator;
use autodeploy::executor::{DeploymentExecutor, ExecutorSettings};
use autodeploy::github::GitHubClient;
use autodeploy::idempotency::IdempotencyGuard;
use autodeploy::logging::setup_logging;
use autodeploy::receiver::Receiver;
use autodeploy::remote_ip::RemoteIpValidator;
use autodeploy::runner::TokioProcessRunner;
use autodeploy::workspace::WorkspaceLocks;
use autodeploy::{AppState, api};
use axum::{Router, routing};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Load the configuration file and apply environment overrides
fn load_config(path: &str) -> Result<DeployConfig, DeployError> {
    let config = DeployConfig::load(path)?.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn build_receiver(config: &DeployConfig, store: &SqlStore) -> Receiver {
    let github = Arc::new(GitHubClient::new(
        &config.github.api_url,
        &config.github.token,
    ));
    let store = Arc::new(store.clone());

    let executor = DeploymentExecutor::new(
        ExecutorSettings::from_config(config),
        Arc::new(TokioProcessRunner::new(config.deploy.command_timeout())),
        github.clone(),
        github.clone(),
        Arc::new(WorkspaceLocks::new()),
    );

    Receiver::new(
        RemoteIpValidator::new(github),
        IdempotencyGuard::new(store.clone()),
        CommitStatusEvaluator::new(store, &config.github.web_url),
        Arc::new(executor),
    )
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config_path =
        std::env::var("AUTODEPLOY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match setup_logging(config.log_directory.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match init_db(&config.database_path).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Database error: {}", e);
            std::process::exit(1);
        }
    };
    let store = SqlStore::new(pool);
    match store.seed_targets(&config.targets).await {
        Ok(count) => info!("Seeded {} deployment targets from config", count),
        Err(e) => {
            error!("Failed to seed deployment targets: {}", e);
            std::process::exit(1);
        }
    }

    if config.deploy.dry_run {
        warn!("Dry run enabled: deploy commands will not run");
    }

    let receiver = Arc::new(build_receiver(&config, &store));
    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState {
        config,
        receiver,
        store,
        start_time: Instant::now(),
        started_at: Utc::now(),
    });

    let app = Router::new()
        .route("/", routing::get(api::root))
        .route("/webhook", routing::post(api::handle_webhook))
        .route("/status", routing::get(api::status))
        .with_state(state);

    info!("Listening on {}", bind_address);
    info!("Using config at {:?}", config_path);
    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
