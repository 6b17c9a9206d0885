// src/db.rs
//! SQLite pool setup and schema migrations.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FactoryError;

/// Opens the database pool and brings the schema up to date.
///
/// WAL keeps writers from blocking the status readers; foreign keys must be
/// switched on per connection or the step -> project cascade never fires.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, FactoryError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), FactoryError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed successfully");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_create_schema() {
        let (_dir, pool) = test_support::temp_pool().await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(names.contains(&"projects"));
        assert!(names.contains(&"workflow_steps"));
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() {
        let (_dir, pool) = test_support::temp_pool().await;

        let result = sqlx::query(
            "INSERT INTO workflow_steps (project_id, step_number, step_name) VALUES ('missing', 1, 'theme_selection')",
        )
        .execute(&pool)
        .await;

        assert!(result.is_err());
    }
}
