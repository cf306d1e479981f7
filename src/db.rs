use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Create a pool from the database configuration
/// Note: sqlx pools are internally reference-counted, clones share the
/// same underlying connections
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let database_url = config
        .url
        .as_deref()
        .context("CADENCE_DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    Ok(pool)
}

/// Run database migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    Ok(())
}

/// Latest migration embedded in this build
pub fn migration_version() -> Option<i64> {
    MIGRATOR.iter().map(|m| m.version).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_version_is_embedded() {
        assert!(migration_version().is_some());
    }

    #[tokio::test]
    #[ignore] // Requires database to be running
    async fn test_pool_initialization() {
        let config = crate::config::Config::load().unwrap();
        let pool = connect(&config.database).await.unwrap();
        let result: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(result.0, 1);
    }
}
