//! Database pool construction and schema bootstrap.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, SqlitePool};
use std::str::FromStr;

use crate::errors::{DbError, DbResult};

/// Schema owned by this crate. Everything else (todos, subtasks, users)
/// belongs to the host application and is referenced by id only.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sync_metadata (
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    vector_clock TEXT NOT NULL,
    checksum TEXT NOT NULL,
    conflict_resolution TEXT,
    last_sync TEXT NOT NULL,
    PRIMARY KEY (user_id, device_id, entity_type, entity_id)
);

CREATE TABLE IF NOT EXISTS conflict_reviews (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    conflict_type TEXT NOT NULL,
    conflicting_updates TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    resolved_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_conflict_reviews_status
    ON conflict_reviews (status, created_at);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    user_id TEXT NOT NULL,
    device_id TEXT,
    old_values TEXT,
    new_values TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_entity
    ON audit_log (entity_type, entity_id, created_at);
"#;

/// Open (or create) the database and apply the schema.
pub async fn init_pool(db_url: &str) -> DbResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(|e| DbError::ConnectionPool(format!("Invalid database URL: {}", e)))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(DbError::Sqlx)?;

    apply_schema(&pool).await?;
    Ok(pool)
}

/// Apply the crate schema to an existing pool (used by tests with
/// in-memory databases).
pub async fn apply_schema(pool: &SqlitePool) -> DbResult<()> {
    // Raw execute so the multi-statement schema runs as one batch.
    pool.execute(SCHEMA_SQL).await.map_err(DbError::Sqlx)?;
    log::debug!("sync schema applied");
    Ok(())
}
