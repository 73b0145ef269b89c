//! Typed access to the persisted sync checkpoint.
//!
//! All values live in the `sync` bucket of a [`CheckpointStore`], encoded as
//! ASCII strings:
//!
//! | Key | Encoding | Default |
//! |-----|----------|---------|
//! | `fetch_interval` | seconds | from config (15) |
//! | `is_sync_in_progress` | `true` / `false` | `false` |
//! | `is_fetch_in_progress` | `true` / `false` | `false` |
//! | `total_fetched_posts` | decimal | `0` |
//! | `last_fetched_at` | Unix millis, `0` = never | `0` |
//!
//! The two in-progress flags are acquired with a compare-and-swap, so two
//! controllers sharing one store can never both hold the same flag. Every
//! flag mutation is published on a [`watch`] channel at the moment it
//! happens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Activity, SyncError, SyncResult};
use crate::traits::CheckpointStore;

pub const SYNC_BUCKET: &str = "sync";

/// Longest accepted fetch interval: one year.
pub const MAX_FETCH_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

const KEY_FETCH_INTERVAL: &str = "fetch_interval";
const KEY_SYNC_IN_PROGRESS: &str = "is_sync_in_progress";
const KEY_FETCH_IN_PROGRESS: &str = "is_fetch_in_progress";
const KEY_TOTAL_FETCHED: &str = "total_fetched_posts";
const KEY_LAST_FETCHED_AT: &str = "last_fetched_at";

/// One of the two persisted mutual-exclusion flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Sync,
    Fetch,
}

impl Flag {
    fn key(&self) -> &'static str {
        match self {
            Flag::Sync => KEY_SYNC_IN_PROGRESS,
            Flag::Fetch => KEY_FETCH_IN_PROGRESS,
        }
    }

    fn activity(&self) -> Activity {
        match self {
            Flag::Sync => Activity::Sync,
            Flag::Fetch => Activity::Fetch,
        }
    }
}

/// The two flags, as last observed by this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub is_sync_in_progress: bool,
    pub is_fetch_in_progress: bool,
}

/// Full checkpoint snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub fetch_interval: u64,
    pub is_sync_in_progress: bool,
    pub is_fetch_in_progress: bool,
    pub total_fetched_posts: u64,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

pub struct SyncStateStore {
    store: Arc<dyn CheckpointStore>,
    default_interval: u64,
    status: watch::Sender<SyncStatus>,
}

impl SyncStateStore {
    /// Write defaults for every missing key and load the current flags.
    /// Existing values are left untouched.
    pub async fn initialize(
        store: Arc<dyn CheckpointStore>,
        default_interval: u64,
    ) -> SyncResult<Arc<Self>> {
        if default_interval == 0 || default_interval > MAX_FETCH_INTERVAL_SECS {
            return Err(SyncError::InvalidInterval(
                i64::try_from(default_interval).unwrap_or(i64::MAX),
            ));
        }

        let defaults = [
            (KEY_FETCH_INTERVAL, default_interval.to_string()),
            (KEY_SYNC_IN_PROGRESS, "false".to_string()),
            (KEY_FETCH_IN_PROGRESS, "false".to_string()),
            (KEY_TOTAL_FETCHED, "0".to_string()),
            (KEY_LAST_FETCHED_AT, "0".to_string()),
        ];
        for (key, value) in defaults {
            let written = store
                .compare_and_swap(SYNC_BUCKET, key, None, value.as_bytes())
                .await
                .map_err(SyncError::Store)?;
            if written {
                debug!(key, value = %value, "initialized checkpoint key");
            }
        }

        let (status, _) = watch::channel(SyncStatus::default());
        let state = Arc::new(Self {
            store,
            default_interval,
            status,
        });

        let initial = SyncStatus {
            is_sync_in_progress: state.flag(Flag::Sync).await?,
            is_fetch_in_progress: state.flag(Flag::Fetch).await?,
        };
        state.status.send_replace(initial);
        Ok(state)
    }

    async fn read(&self, key: &str) -> SyncResult<Option<String>> {
        let raw = self
            .store
            .get(SYNC_BUCKET, key)
            .await
            .map_err(SyncError::Store)?;
        Ok(raw.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        self.store
            .put(SYNC_BUCKET, key, value.as_bytes())
            .await
            .map_err(SyncError::Store)
    }

    async fn read_u64(&self, key: &str, default: u64) -> SyncResult<u64> {
        match self.read(key).await? {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| SyncError::CorruptCheckpoint {
                    key: key.to_string(),
                    value,
                }),
        }
    }

    // ── interval ────────────────────────────────────────────────────

    pub async fn fetch_interval(&self) -> SyncResult<u64> {
        self.read_u64(KEY_FETCH_INTERVAL, self.default_interval)
            .await
    }

    /// Persist a new interval. Values outside
    /// `1..=MAX_FETCH_INTERVAL_SECS` are rejected and the stored value is
    /// kept.
    pub async fn set_fetch_interval(&self, secs: i64) -> SyncResult<u64> {
        let secs = match u64::try_from(secs) {
            Ok(secs) if (1..=MAX_FETCH_INTERVAL_SECS).contains(&secs) => secs,
            _ => return Err(SyncError::InvalidInterval(secs)),
        };
        self.write(KEY_FETCH_INTERVAL, &secs.to_string()).await?;
        Ok(secs)
    }

    // ── flags ───────────────────────────────────────────────────────

    pub async fn flag(&self, flag: Flag) -> SyncResult<bool> {
        match self.read(flag.key()).await? {
            None => Ok(false),
            Some(value) => match value.trim() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(SyncError::CorruptCheckpoint {
                    key: flag.key().to_string(),
                    value,
                }),
            },
        }
    }

    /// Atomically flip `flag` from false (or absent) to true.
    ///
    /// Fails with [`SyncError::AlreadyInProgress`] if it is already set.
    pub async fn acquire(self: &Arc<Self>, flag: Flag) -> SyncResult<FlagLease> {
        let swapped = self
            .store
            .compare_and_swap(SYNC_BUCKET, flag.key(), Some(b"false"), b"true")
            .await
            .map_err(SyncError::Store)?;
        let acquired = swapped
            || self
                .store
                .compare_and_swap(SYNC_BUCKET, flag.key(), None, b"true")
                .await
                .map_err(SyncError::Store)?;

        if !acquired {
            return Err(SyncError::AlreadyInProgress(flag.activity()));
        }

        self.publish(flag, true);
        Ok(FlagLease {
            state: Arc::clone(self),
            flag,
            released: false,
        })
    }

    /// Clear a flag unconditionally.
    pub async fn clear(&self, flag: Flag) -> SyncResult<()> {
        self.write(flag.key(), "false").await?;
        self.publish(flag, false);
        Ok(())
    }

    fn publish(&self, flag: Flag, value: bool) {
        self.status.send_if_modified(|status| {
            let slot = match flag {
                Flag::Sync => &mut status.is_sync_in_progress,
                Flag::Fetch => &mut status.is_fetch_in_progress,
            };
            if *slot == value {
                false
            } else {
                *slot = value;
                true
            }
        });
    }

    /// Flags as last mutated through this store.
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Receive a value every time a flag changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    // ── progress cursor ─────────────────────────────────────────────

    pub async fn total_fetched_posts(&self) -> SyncResult<u64> {
        self.read_u64(KEY_TOTAL_FETCHED, 0).await
    }

    pub async fn set_total_fetched_posts(&self, total: u64) -> SyncResult<()> {
        self.write(KEY_TOTAL_FETCHED, &total.to_string()).await
    }

    /// Time of the last fully successful pass, `None` if there was none.
    pub async fn last_fetched_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let millis = match self.read(KEY_LAST_FETCHED_AT).await? {
            None => return Ok(None),
            Some(value) => {
                value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| SyncError::CorruptCheckpoint {
                        key: KEY_LAST_FETCHED_AT.to_string(),
                        value,
                    })?
            }
        };
        if millis == 0 {
            return Ok(None);
        }
        Ok(DateTime::from_timestamp_millis(millis))
    }

    pub async fn set_last_fetched_at(&self, at: DateTime<Utc>) -> SyncResult<()> {
        self.write(KEY_LAST_FETCHED_AT, &at.timestamp_millis().to_string())
            .await
    }

    /// Forget all progress so the next pass re-ingests the full corpus.
    pub async fn clear_cursor(&self) -> SyncResult<()> {
        self.write(KEY_TOTAL_FETCHED, "0").await?;
        self.write(KEY_LAST_FETCHED_AT, "0").await
    }

    pub async fn snapshot(&self) -> SyncResult<SyncState> {
        Ok(SyncState {
            fetch_interval: self.fetch_interval().await?,
            is_sync_in_progress: self.flag(Flag::Sync).await?,
            is_fetch_in_progress: self.flag(Flag::Fetch).await?,
            total_fetched_posts: self.total_fetched_posts().await?,
            last_fetched_at: self.last_fetched_at().await?,
        })
    }
}

/// Ownership of an acquired flag.
///
/// Call [`release`](FlagLease::release) on every exit path. If the lease is
/// dropped without being released (the owning task was aborted), the flag
/// is cleared from a spawned task.
pub struct FlagLease {
    state: Arc<SyncStateStore>,
    flag: Flag,
    released: bool,
}

impl FlagLease {
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.state.clear(self.flag).await {
            warn!(flag = ?self.flag, error = %e, "failed to clear in-progress flag");
        }
    }
}

impl Drop for FlagLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let state = Arc::clone(&self.state);
        let flag = self.flag;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = state.clear(flag).await {
                        warn!(flag = ?flag, error = %e, "failed to clear abandoned flag");
                    }
                });
            }
            Err(_) => warn!(flag = ?flag, "flag lease dropped outside a runtime; flag left set"),
        }
    }
}
