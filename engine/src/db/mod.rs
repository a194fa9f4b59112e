/// Database module for SQLite persistence
///
/// This module provides the durable status store. It uses sqlx with runtime
/// queries and WAL mode so pollers can read while the worker writes.
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub mod results;

pub use results::SqliteStatusStore;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for better concurrency
    /// 3. Run migrations to set up the schema
    ///
    /// SQLite replays a leftover WAL file on open, so an unclean shutdown
    /// needs no extra recovery step here.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        // Configure SQLite connection with WAL mode
        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .disable_statement_logging();

        // Create connection pool
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };

        // Run migrations
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    ///
    /// Migrations use `IF NOT EXISTS` and can be run multiple times safely.
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_results.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_results.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush the WAL to disk
    ///
    /// This should be called during graceful shutdown to ensure all
    /// pending writes are persisted to the database file.
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Close the database connection
    ///
    /// This flushes the WAL and closes all connections in the pool.
    pub async fn close(self) -> Result<()> {
        info!("Closing database connection");

        self.flush_wal().await?;
        self.pool.close().await;

        info!("Database connection closed");
        Ok(())
    }

    /// Create a status store over this database
    pub fn results(&self) -> SqliteStatusStore {
        SqliteStatusStore::new(self.pool.clone())
    }
}
