//! Collaborator seams of the sync engine.
//!
//! The engine never talks to the network or disk directly. It is handed
//! implementations of these traits at construction time:
//!
//! ```text
//!  UpstreamClient ──▶ FetchPipeline ──▶ VectorSink
//!                         │
//!                         ▼
//!                  CheckpointStore          Broker ──▶ NotificationTransport
//! ```
//!
//! | Trait | Built-in implementations |
//! |-------|--------------------------|
//! | [`UpstreamClient`] | [`MattermostClient`](crate::upstream::MattermostClient) |
//! | [`VectorSink`] | [`ChromaSink`](crate::sink::ChromaSink), [`MemorySink`](crate::sink::MemorySink) |
//! | [`CheckpointStore`] | [`SqliteCheckpointStore`](crate::checkpoint::SqliteCheckpointStore), [`MemoryCheckpointStore`](crate::checkpoint::MemoryCheckpointStore) |
//! | [`NotificationTransport`] | [`StderrTransport`](crate::progress::StderrTransport), [`JsonTransport`](crate::progress::JsonTransport) |

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Channel, PageRequest, PostPage, SourceKind, VectorDocument};
use crate::progress::Notification;

// ═══════════════════════════════════════════════════════════════════════
// Upstream
// ═══════════════════════════════════════════════════════════════════════

/// Paginated access to the upstream message source.
///
/// Each call is independently authenticated and carries its own deadline.
/// Implementations hold no per-pass state.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Kind of records this client produces. Selects the sink collection.
    fn source_kind(&self) -> SourceKind {
        SourceKind::Mattermost
    }

    /// List every channel, in source order.
    async fn list_channels(&self) -> Result<Vec<Channel>>;

    /// Fetch one page of posts for a channel.
    ///
    /// An empty `order` or an empty `previous_post_id` in the result marks
    /// the end of the channel.
    async fn list_posts_page(&self, channel_id: &str, request: &PageRequest) -> Result<PostPage>;
}

// ═══════════════════════════════════════════════════════════════════════
// Vector sink
// ═══════════════════════════════════════════════════════════════════════

/// Write side of the vector store.
///
/// `upsert` is idempotent by id: re-upserting an id replaces the stored
/// text and metadata.
#[async_trait]
pub trait VectorSink: Send + Sync {
    async fn upsert(&self, collection: &str, documents: &[VectorDocument]) -> Result<()>;

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()>;

    /// Drop a whole collection. Missing collections are not an error.
    async fn reset(&self, collection: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Checkpoint store
// ═══════════════════════════════════════════════════════════════════════

/// Durable bucketed key-value persistence.
///
/// A missing key is a normal condition (`Ok(None)`); buckets are created
/// on first write.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Atomically write `new` if the current value equals `expected`
    /// (`None` meaning "absent"). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        bucket: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool>;
}

// ═══════════════════════════════════════════════════════════════════════
// Notification transport
// ═══════════════════════════════════════════════════════════════════════

/// Outbound live-update channel fed by a broker subscription.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<()>;
}
