use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};
use tracing::warn;

use crate::config::TargetConfig;
use crate::error::DeployError;
use crate::idempotency::KeyValueStore;
use crate::registry::{DeploymentTarget, TargetRegistry};

// Helper struct to map DB row to DeploymentTarget struct
#[derive(FromRow)]
struct TargetRow {
    id: i64,
    repository: String,
    environment: String,
    config: Option<String>,
}

impl From<TargetRow> for DeploymentTarget {
    fn from(row: TargetRow) -> Self {
        let config = row.config.and_then(|raw| {
            match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(map) => Some(map),
                Err(e) => {
                    warn!(
                        "Ignoring unreadable config for target {}/{}: {}",
                        row.repository, row.environment, e
                    );
                    None
                }
            }
        });

        DeploymentTarget {
            id: row.id,
            repository: row.repository,
            environment: row.environment,
            config,
        }
    }
}

/// Persistent storage for deployment targets and event bookkeeping using SQLite
#[derive(Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the target for `(repository, environment)`, returns its ID
    pub async fn upsert_target(
        &self,
        repository: &str,
        environment: &str,
        config: Option<&Map<String, Value>>,
    ) -> Result<i64, DeployError> {
        let config_str = config.map(serde_json::to_string).transpose()?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO deployment_targets (repository, environment, config, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (repository, environment) DO UPDATE SET config = excluded.config
            RETURNING id
            "#,
        )
        .bind(repository)
        .bind(environment)
        .bind(config_str)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Seed the `[[target]]` entries of the configuration file
    pub async fn seed_targets(&self, targets: &[TargetConfig]) -> Result<usize, DeployError> {
        for target in targets {
            let config = target.payload_config();
            let config = (!config.is_empty()).then_some(&config);
            self.upsert_target(&target.repository, &target.environment, config)
                .await?;
        }
        Ok(targets.len())
    }

    /// Count registered targets
    pub async fn count_targets(&self) -> Result<i64, DeployError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM deployment_targets")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }
}

#[async_trait]
impl TargetRegistry for SqlStore {
    async fn targets_for(&self, repo_full_name: &str) -> Result<Vec<DeploymentTarget>, DeployError> {
        let rows = sqlx::query_as::<_, TargetRow>(
            r#"
            SELECT id, repository, environment, config
            FROM deployment_targets
            WHERE repository = ?
            ORDER BY id ASC
            "#,
        )
        .bind(repo_full_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

#[async_trait]
impl KeyValueStore for SqlStore {
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), DeployError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DeployError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;

    async fn store() -> SqlStore {
        SqlStore::new(init_memory_db().await.unwrap())
    }

    #[tokio::test]
    async fn targets_are_listed_per_repository() {
        let store = store().await;
        let mut config = Map::new();
        config.insert("heroku_name".into(), "org-app".into());
        store.upsert_target("org/app", "production", Some(&config)).await.unwrap();
        store.upsert_target("org/app", "staging", None).await.unwrap();
        store.upsert_target("org/other", "production", None).await.unwrap();

        let targets = store.targets_for("org/app").await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].environment, "production");
        assert_eq!(
            targets[0].config.as_ref().and_then(|c| c.get("heroku_name")),
            Some(&Value::from("org-app"))
        );
        assert_eq!(targets[1].config, None);
        assert!(store.targets_for("org/missing").await.unwrap().is_empty());
        assert_eq!(store.count_targets().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn upsert_replaces_config_and_keeps_id() {
        let store = store().await;
        let first = store.upsert_target("org/app", "production", None).await.unwrap();
        let mut config = Map::new();
        config.insert("heroku_name".into(), "renamed".into());
        let second = store
            .upsert_target("org/app", "production", Some(&config))
            .await
            .unwrap();
        assert_eq!(first, second);

        let targets = store.targets_for("org/app").await.unwrap();
        assert_eq!(targets.len(), 1);
        assert!(targets[0].config.is_some());
    }

    #[tokio::test]
    async fn seeds_from_config() {
        let store = store().await;
        let targets = vec![TargetConfig {
            repository: "org/app".to_string(),
            environment: "production".to_string(),
            heroku_name: Some("org-app".to_string()),
            heroku_staging_name: None,
        }];
        assert_eq!(store.seed_targets(&targets).await.unwrap(), 1);
        let listed = store.targets_for("org/app").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn kv_store_overwrites() {
        let store = store().await;
        store.set("deployment:1", b"a").await.unwrap();
        store.set("deployment:1", b"b").await.unwrap();
        assert_eq!(store.get("deployment:1").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(store.get("deployment:2").await.unwrap(), None);
    }
}
