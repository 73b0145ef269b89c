//! [`CheckpointStore`] backends.
//!
//! - [`SqliteCheckpointStore`]: the `checkpoint_kv` table created by
//!   `mmsync init`. Each operation is a single SQL statement, so
//!   `compare_and_swap` is atomic across processes sharing the file.
//! - [`MemoryCheckpointStore`]: a `HashMap` behind `std::sync::RwLock`, for
//!   tests and embedding.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::{SyncError, SyncResult};
use crate::migrate;
use crate::traits::CheckpointStore;

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Wrap a pool whose schema has already been migrated.
    ///
    /// Fails with [`SyncError::StoreUninitialized`] when `mmsync init` was
    /// never run against this database.
    pub async fn open(pool: SqlitePool) -> SyncResult<Self> {
        let ready = migrate::is_initialized(&pool)
            .await
            .map_err(SyncError::Store)?;
        if !ready {
            return Err(SyncError::StoreUninitialized(format!(
                "table '{}' is missing; run `mmsync init` first",
                migrate::CHECKPOINT_TABLE
            )));
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM checkpoint_kv WHERE bucket = ? AND key = ?")
                .bind(bucket)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoint_kv (bucket, key, value, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        bucket: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = match expected {
            Some(current) => {
                sqlx::query(
                    "UPDATE checkpoint_kv SET value = ?, updated_at = ? WHERE bucket = ? AND key = ? AND value = ?",
                )
                .bind(new)
                .bind(now)
                .bind(bucket)
                .bind(key)
                .bind(current)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoint_kv (bucket, key, value, updated_at) VALUES (?, ?, ?, ?)
                    ON CONFLICT(bucket, key) DO NOTHING
                    "#,
                )
                .bind(bucket)
                .bind(key)
                .bind(new)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }
}

/// In-memory checkpoint store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn entry_key(bucket: &str, key: &str) -> (String, String) {
    (bucket.to_string(), key.to_string())
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("checkpoint map lock poisoned"))?;
        Ok(entries.get(&entry_key(bucket, key)).cloned())
    }

    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("checkpoint map lock poisoned"))?;
        entries.insert(entry_key(bucket, key), value.to_vec());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        bucket: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("checkpoint map lock poisoned"))?;
        let slot = entry_key(bucket, key);
        if entries.get(&slot).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        entries.insert(slot, new.to_vec());
        Ok(true)
    }
}
