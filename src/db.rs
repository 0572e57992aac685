//! SQLite connection pool setup and the collection catalog migration.
//!
//! One [`SqlitePool`] is built per process from `[db]` config and shared by
//! every handler. WAL journaling plus a busy timeout let readers run
//! alongside the single SQLite writer; writers queue on the lock instead of
//! failing immediately.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DbConfig;

/// Name of the table recording every collection and its embedding dimension.
pub const CATALOG_TABLE: &str = "kb_collections";

/// How long a connection waits on SQLite's write lock before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the pool described by `config` and run the catalog migration.
pub async fn connect(config: &DbConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .with_context(|| format!("Invalid database url: {}", config.url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    // Ensure parent directory exists
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", config.url))?;

    migrate(&pool).await?;

    tracing::debug!(
        url = %config.url,
        max_connections = config.max_connections,
        "database pool ready"
    );

    Ok(pool)
}

/// Create the collection catalog. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {CATALOG_TABLE} (
            name TEXT PRIMARY KEY,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await
    .context("Failed to create collection catalog")?;

    Ok(())
}
