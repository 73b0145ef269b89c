//! Fetch pipeline: one pass over every channel the upstream exposes.
//!
//! ```text
//! acquire fetch flag ──► resolve cursor ──► list channels
//!        │                                      │
//!        │              ┌───────────────────────┘
//!        │              ▼
//!        │     per channel, page 0,1,2,…  (cancel check before each request)
//!        │        ├─ deleted posts  → sink.delete   (one call per page)
//!        │        ├─ indexable      → sink.upsert   (one call per page)
//!        │        ├─ counter += upserted            (persisted per page)
//!        │        └─ cancel check → Progress event
//!        ▼
//! success: last_fetched_at = pass start, release flag, Done
//! failure: counter = value at pass start, release flag, error
//! ```
//!
//! A failed or cancelled pass leaves the persisted cursor exactly as it was,
//! so the next pass resumes from the same point.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::models::{Channel, PageRequest, VectorDocument};
use crate::progress::ProgressEvent;
use crate::sync_state::{Flag, SyncStateStore};
use crate::traits::{UpstreamClient, VectorSink};

/// Counts for one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub channels: usize,
    pub pages: u64,
    pub upserted: u64,
    pub deleted: u64,
    /// System posts and blank messages.
    pub skipped: u64,
}

pub struct FetchPipeline {
    upstream: Arc<dyn UpstreamClient>,
    sink: Arc<dyn VectorSink>,
    state: Arc<SyncStateStore>,
    page_size: u32,
}

/// Running totals while a pass is in flight.
struct PassCursor {
    baseline: u64,
    pending: u64,
    since: Option<i64>,
    summary: PassSummary,
}

impl PassCursor {
    fn percent(&self) -> Option<f64> {
        if self.pending == 0 {
            return None;
        }
        let ratio = self.summary.upserted as f64 / self.pending as f64;
        Some((ratio * 100.0).min(100.0))
    }
}

impl FetchPipeline {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        sink: Arc<dyn VectorSink>,
        state: Arc<SyncStateStore>,
        page_size: u32,
    ) -> Self {
        Self {
            upstream,
            sink,
            state,
            page_size: page_size.max(1),
        }
    }

    pub fn state(&self) -> &Arc<SyncStateStore> {
        &self.state
    }

    /// Run one full pass.
    ///
    /// Fails with `AlreadyInProgress(Fetch)` without touching the upstream
    /// or the sink when another pass holds the fetch flag. Emits `Progress`
    /// events per committed page and `Done` on success; a failed or
    /// cancelled pass emits nothing further.
    pub async fn run_pass(
        &self,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ProgressEvent>,
    ) -> SyncResult<PassSummary> {
        let lease = self.state.acquire(Flag::Fetch).await?;
        let started_at = Utc::now();

        let baseline = match self.state.total_fetched_posts().await {
            Ok(total) => total,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        info!(baseline, "fetch pass started");
        let mut result = self.pass(baseline, cancel, events).await;
        if result.is_ok() {
            if let Err(e) = self.state.set_last_fetched_at(started_at).await {
                result = Err(e);
            }
        }

        if let Err(e) = &result {
            if let Err(rollback) = self.state.set_total_fetched_posts(baseline).await {
                warn!(error = %rollback, baseline, "failed to roll back fetched-post counter");
            }
            if e.is_cancelled() {
                info!("fetch pass cancelled");
            } else {
                warn!(error = %e, "fetch pass failed");
            }
        }

        lease.release().await;

        if let Ok(summary) = &result {
            info!(
                channels = summary.channels,
                pages = summary.pages,
                upserted = summary.upserted,
                deleted = summary.deleted,
                "fetch pass done"
            );
            let _ = events.send(ProgressEvent::Done).await;
        }
        result
    }

    async fn pass(
        &self,
        baseline: u64,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ProgressEvent>,
    ) -> SyncResult<PassSummary> {
        let since = if baseline > 0 {
            self.state
                .last_fetched_at()
                .await?
                .map(|at| at.timestamp_millis())
        } else {
            None
        };

        let channels = self
            .upstream
            .list_channels()
            .await
            .map_err(SyncError::Upstream)?;
        let total: u64 = channels.iter().map(|c| c.total_msg_count).sum();

        let mut cursor = PassCursor {
            baseline,
            pending: total.saturating_sub(baseline),
            since,
            summary: PassSummary {
                channels: channels.len(),
                ..PassSummary::default()
            },
        };
        debug!(
            channels = channels.len(),
            pending = cursor.pending,
            since = ?cursor.since,
            "resolved pass cursor"
        );

        for channel in &channels {
            self.fetch_channel(channel, &mut cursor, cancel, events)
                .await?;
        }

        Ok(cursor.summary)
    }

    async fn fetch_channel(
        &self,
        channel: &Channel,
        cursor: &mut PassCursor,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ProgressEvent>,
    ) -> SyncResult<()> {
        let source = self.upstream.source_kind();
        let collection = source.collection_name();
        let access = channel.access();
        let mut page = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let request = PageRequest {
                since: cursor.since,
                page,
                per_page: self.page_size,
            };
            let batch = self
                .upstream
                .list_posts_page(&channel.id, &request)
                .await
                .map_err(SyncError::Upstream)?;

            if batch.order.is_empty() {
                break;
            }

            let mut documents = Vec::new();
            let mut deleted = Vec::new();
            for post in batch.ordered_posts() {
                if post.is_deleted() {
                    deleted.push(post.id.clone());
                } else if post.is_indexable() {
                    documents.push(VectorDocument::from_post(post, access, source));
                } else {
                    cursor.summary.skipped += 1;
                }
            }

            if !deleted.is_empty() {
                self.sink
                    .delete(collection, &deleted)
                    .await
                    .map_err(SyncError::Sink)?;
            }
            if !documents.is_empty() {
                self.sink
                    .upsert(collection, &documents)
                    .await
                    .map_err(SyncError::Sink)?;
            }

            cursor.summary.pages += 1;
            cursor.summary.deleted += deleted.len() as u64;
            cursor.summary.upserted += documents.len() as u64;
            self.state
                .set_total_fetched_posts(cursor.baseline + cursor.summary.upserted)
                .await?;

            debug!(
                channel_id = %channel.id,
                page,
                upserted = documents.len(),
                deleted = deleted.len(),
                "page committed"
            );

            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            if let Some(percent) = cursor.percent() {
                let _ = events
                    .send(ProgressEvent::Progress {
                        percent,
                        upserted: cursor.summary.upserted,
                    })
                    .await;
            }

            if batch.is_last() {
                break;
            }
            page += 1;
        }

        Ok(())
    }
}
