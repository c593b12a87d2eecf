//! Database interaction logic using `sqlx` and SQLite.
//!
//! This module keeps all persistence logic in one place so other modules can
//! depend on well-defined functions instead of scattering SQL across the
//! code: the provider credential vault, the API-key ledger, rate-window
//! counters, the audit log, a provider-metrics cache (so stats survive a
//! restart), and the job ledger.

use std::path::Path;

use std::str::FromStr;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    ConnectOptions, Pool, Sqlite,
};
use thiserror::Error;

/// Custom error type for database operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Represents a failure to connect to the database.
    #[error("Failed to connect to the database: {0}")]
    ConnectionFailed(sqlx::Error),

    /// Represents a failure during a database query.
    #[error("Database query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),
}

/// A handle to the database connection pool.
pub type DbPool = Pool<Sqlite>;

/// Initializes the database connection pool.
///
/// # Arguments
/// * `database_url` - The SQLite connection string.
pub async fn init_db(database_url: &str) -> Result<DbPool, DbError> {
    create_sqlite_parent_dir(database_url);

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(DbError::ConnectionFailed)?
        .create_if_missing(true)
        .disable_statement_logging();

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(DbError::ConnectionFailed)
}

/// Ensures the database schema exists.
pub async fn ensure_schema(pool: &DbPool) -> Result<(), DbError> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS provider_credentials (
            reference TEXT PRIMARY KEY,
            nonce BLOB NOT NULL,
            ciphertext BLOB NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            hashed_secret TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'enabled',
            tags TEXT NOT NULL DEFAULT '[]',
            allowed_models TEXT NOT NULL DEFAULT '[]',
            blocked_models TEXT NOT NULL DEFAULT '[]',
            allowed_endpoints TEXT NOT NULL DEFAULT '[]',
            cost_limit REAL,
            cost_used REAL NOT NULL DEFAULT 0,
            rpm_limit INTEGER,
            rph_limit INTEGER,
            rpd_limit INTEGER,
            quota_daily INTEGER,
            quota_monthly INTEGER,
            requests_used_daily INTEGER NOT NULL DEFAULT 0,
            requests_used_monthly INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT,
            last_used TEXT,
            last_rotated TEXT,
            rotation_interval_days INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS key_rate_windows (
            key_id TEXT NOT NULL,
            window_kind TEXT NOT NULL,
            window_start TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (key_id, window_kind)
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor_id TEXT,
            key_id TEXT,
            action TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            ip TEXT,
            user_agent TEXT,
            endpoint TEXT,
            method TEXT,
            before TEXT,
            after TEXT,
            metadata TEXT,
            success INTEGER NOT NULL,
            error TEXT
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS provider_metrics (
            provider TEXT PRIMARY KEY,
            avg_latency_ms INTEGER NOT NULL,
            success_rate REAL NOT NULL,
            quality_ema REAL NOT NULL,
            total INTEGER NOT NULL,
            successful INTEGER NOT NULL,
            last_updated TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS job_ledger (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            state TEXT NOT NULL,
            start TEXT,
            end TEXT,
            result TEXT,
            error TEXT,
            progress REAL NOT NULL,
            fallback_count INTEGER NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS provider_catalogue (
            name TEXT PRIMARY KEY,
            tier TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            models TEXT NOT NULL,
            auth_ref TEXT,
            updated_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    migrate_api_keys_columns(pool).await?;
    migrate_job_ledger_columns(pool).await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_key_id ON audit_log(key_id, timestamp)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_ledger_task ON job_ledger(task_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_ledger_request ON job_ledger(request_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Adds columns introduced after the initial `api_keys` table shipped,
/// growing the table in place rather than issuing a full migration tool.
async fn migrate_api_keys_columns(pool: &DbPool) -> Result<(), DbError> {
    let columns = [
        ("requests_used_daily", "INTEGER NOT NULL DEFAULT 0"),
        ("requests_used_monthly", "INTEGER NOT NULL DEFAULT 0"),
        ("rotation_interval_days", "INTEGER"),
    ];

    for (column, definition) in columns {
        let probe = format!("SELECT {column} FROM api_keys LIMIT 1");
        if sqlx::query(&probe).fetch_optional(pool).await.is_err() {
            let alter = format!("ALTER TABLE api_keys ADD COLUMN {column} {definition}");
            sqlx::query(&alter).execute(pool).await?;
        }
    }

    Ok(())
}

/// Adds the `request_id` column to `job_ledger`, which did not exist when
/// the table first shipped — jobs could be looked up by `task_id` but not
/// grouped by the request that spawned them.
async fn migrate_job_ledger_columns(pool: &DbPool) -> Result<(), DbError> {
    let probe = "SELECT request_id FROM job_ledger LIMIT 1";
    if sqlx::query(probe).fetch_optional(pool).await.is_err() {
        sqlx::query("ALTER TABLE job_ledger ADD COLUMN request_id TEXT NOT NULL DEFAULT ''")
            .execute(pool)
            .await?;
    }
    Ok(())
}

fn create_sqlite_parent_dir(database_url: &str) {
    if let Some(path) = extract_sqlite_path(database_url) {
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                eprintln!("routewise: failed to create database directory {parent:?}: {err}");
            }
        }
    }
}

fn extract_sqlite_path(database_url: &str) -> Option<std::path::PathBuf> {
    let trimmed = database_url.strip_prefix("sqlite:")?;
    if trimmed.starts_with("memory") || trimmed == ":memory:" {
        return None;
    }
    let path = trimmed.trim_start_matches("//");
    if path.is_empty() {
        None
    } else {
        Some(Path::new(path).to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_schema_is_idempotent_on_in_memory_db() {
        let pool = init_db("sqlite::memory:").await.unwrap();
        ensure_schema(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();
    }
}
