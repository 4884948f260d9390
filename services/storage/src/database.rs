use crate::error::{StoreError, StoreResult};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Shared SQLite database holding metadata, upload jobs and blob payloads
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `url` and run migrations.
    ///
    /// The connection is opened in WAL mode with `synchronous=FULL` so a
    /// committed write survives a process crash or power loss.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::StorageUnavailable(format!("invalid database url: {e}")))?;

        let filename = options.clone().get_filename();
        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() && parent != Path::new(":memory:") {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::StorageUnavailable(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        // A single writer keeps SQLite from reporting "database is locked"
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::StorageUnavailable(format!("cannot open database: {e}")))?;

        let database = Self { pool };
        database.run_migrations().await?;

        info!(url = %url, "Opened metadata database");

        Ok(database)
    }

    /// Private in-memory database, used by tests and ephemeral deployments
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;

        // The database lives only as long as its one connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;

        let database = Self { pool };
        database.run_migrations().await?;
        Ok(database)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::StorageUnavailable(format!("migration failed: {e}")))
    }

    /// Check database connectivity
    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
