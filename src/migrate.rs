use anyhow::Result;
use sqlx::SqlitePool;

/// Name of the key-value table backing the checkpoint store.
pub const CHECKPOINT_TABLE: &str = "checkpoint_kv";

/// Create the checkpoint schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoint_kv (
            bucket TEXT NOT NULL,
            key TEXT NOT NULL,
            value BLOB NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (bucket, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Whether [`run_migrations`] has been applied to this database.
pub async fn is_initialized(pool: &SqlitePool) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?",
    )
    .bind(CHECKPOINT_TABLE)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}
