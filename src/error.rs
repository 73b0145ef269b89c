//! Error kinds surfaced by the sync engine.

use std::fmt;
use thiserror::Error;

/// Which kind of work was already running when a start was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Sync,
    Fetch,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Sync => f.write_str("sync"),
            Activity::Fetch => f.write_str("fetch"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// A sync loop or fetch pass is already running. The duplicate start is
    /// rejected without side effects.
    #[error("{0} is already in progress")]
    AlreadyInProgress(Activity),

    #[error("fetch interval must be between 1 and {max} seconds (got {0})", max = crate::sync_state::MAX_FETCH_INTERVAL_SECS)]
    InvalidInterval(i64),

    #[error("upstream request failed: {0:#}")]
    Upstream(anyhow::Error),

    #[error("vector sink request failed: {0:#}")]
    Sink(anyhow::Error),

    #[error("checkpoint store error: {0:#}")]
    Store(anyhow::Error),

    #[error("checkpoint store is not initialized: {0}")]
    StoreUninitialized(String),

    #[error("corrupt checkpoint value for '{key}': {value:?}")]
    CorruptCheckpoint { key: String, value: String },

    /// Cooperative cancellation was observed. Not a failure.
    #[error("sync was cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Short machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::AlreadyInProgress(_) => "already_in_progress",
            SyncError::InvalidInterval(_) => "invalid_interval",
            SyncError::Upstream(_) => "upstream_error",
            SyncError::Sink(_) => "sink_error",
            SyncError::Store(_) | SyncError::CorruptCheckpoint { .. } => "store_error",
            SyncError::StoreUninitialized(_) => "uninitialized",
            SyncError::Cancelled => "cancelled",
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
