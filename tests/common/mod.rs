//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use mm_semantic_sync::checkpoint::MemoryCheckpointStore;
use mm_semantic_sync::controller::SyncController;
use mm_semantic_sync::models::{Channel, PageRequest, Post, PostPage, VectorDocument};
use mm_semantic_sync::pipeline::FetchPipeline;
use mm_semantic_sync::progress::ProgressEvent;
use mm_semantic_sync::sink::MemorySink;
use mm_semantic_sync::sync_state::SyncStateStore;
use mm_semantic_sync::traits::{UpstreamClient, VectorSink};

/// Timestamp older than any pass start in these tests.
pub const OLD: i64 = 1_600_000_000_000;

pub fn channel(id: &str, channel_type: &str, total: u64) -> Channel {
    Channel {
        id: id.to_string(),
        channel_type: channel_type.to_string(),
        display_name: id.to_string(),
        total_msg_count: total,
    }
}

pub fn post(id: &str, channel_id: &str, message: &str) -> Post {
    Post {
        id: id.to_string(),
        message: message.to_string(),
        user_id: "u1".to_string(),
        post_type: String::new(),
        update_at: OLD,
        delete_at: 0,
        channel_id: channel_id.to_string(),
    }
}

pub fn deleted(mut post: Post) -> Post {
    post.delete_at = post.update_at + 1;
    post
}

/// A post edited after every pass that has run so far.
pub fn fresh(mut post: Post) -> Post {
    post.update_at = chrono::Utc::now().timestamp_millis() + 60_000;
    post
}

pub fn posts(channel_id: &str, prefix: &str, count: usize) -> Vec<Post> {
    (0..count)
        .map(|i| post(&format!("{}{}", prefix, i), channel_id, &format!("message {} in {}", i, channel_id)))
        .collect()
}

/// In-memory upstream. Pages are cut from each channel's post list on
/// request, honouring `since` and `per_page` the way the real API does.
#[derive(Default)]
pub struct ScriptedUpstream {
    channels: Mutex<Vec<Channel>>,
    posts: Mutex<HashMap<String, Vec<Post>>>,
    fail_channel: Mutex<Option<String>>,
    cancel_at: Mutex<Option<(String, u32, CancellationToken)>>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub channel_calls: AtomicUsize,
    pub requests: Mutex<Vec<(String, PageRequest)>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(self, channel: Channel, posts: Vec<Post>) -> Self {
        self.posts
            .lock()
            .unwrap()
            .insert(channel.id.clone(), posts);
        self.channels.lock().unwrap().push(channel);
        self
    }

    pub fn push_post(&self, post: Post) {
        let mut posts = self.posts.lock().unwrap();
        let list = posts.entry(post.channel_id.clone()).or_default();
        list.retain(|p| p.id != post.id);
        list.push(post);
    }

    /// Page requests for `channel_id` fail until cleared.
    pub fn fail_channel(&self, channel_id: Option<&str>) {
        *self.fail_channel.lock().unwrap() = channel_id.map(str::to_string);
    }

    /// Cancel `token` when `page` of `channel_id` is requested. The page
    /// itself is still served.
    pub fn cancel_at(&self, channel_id: &str, page: u32, token: CancellationToken) {
        *self.cancel_at.lock().unwrap() = Some((channel_id.to_string(), page, token));
    }

    /// Hold `list_channels` until the returned handle is notified.
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn page_requests(&self) -> Vec<(String, PageRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        self.channel_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.channels.lock().unwrap().clone())
    }

    async fn list_posts_page(&self, channel_id: &str, request: &PageRequest) -> Result<PostPage> {
        self.requests
            .lock()
            .unwrap()
            .push((channel_id.to_string(), request.clone()));

        if self.fail_channel.lock().unwrap().as_deref() == Some(channel_id) {
            bail!("upstream unavailable for channel {}", channel_id);
        }

        if let Some((cid, page, token)) = self.cancel_at.lock().unwrap().as_ref() {
            if cid == channel_id && *page == request.page {
                token.cancel();
            }
        }

        let posts = self.posts.lock().unwrap();
        let matching: Vec<&Post> = posts
            .get(channel_id)
            .map(|list| {
                list.iter()
                    .filter(|p| request.since.map_or(true, |since| p.update_at > since))
                    .collect()
            })
            .unwrap_or_default();

        let chunks: Vec<&[&Post]> = matching.chunks(request.per_page as usize).collect();
        let Some(chunk) = chunks.get(request.page as usize) else {
            return Ok(PostPage::default());
        };

        let previous_post_id = chunks
            .get(request.page as usize + 1)
            .and_then(|next| next.first())
            .map(|p| p.id.clone())
            .unwrap_or_default();

        Ok(PostPage {
            order: chunk.iter().map(|p| p.id.clone()).collect(),
            posts: chunk.iter().map(|p| (p.id.clone(), (*p).clone())).collect(),
            previous_post_id,
        })
    }
}

/// Wraps a [`MemorySink`] and fails upserts while `failing` is set.
pub struct FlakySink {
    pub inner: MemorySink,
    failing: Mutex<bool>,
}

impl FlakySink {
    pub fn new() -> Self {
        Self {
            inner: MemorySink::new(),
            failing: Mutex::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl VectorSink for FlakySink {
    async fn upsert(&self, collection: &str, documents: &[VectorDocument]) -> Result<()> {
        if *self.failing.lock().unwrap() {
            bail!("sink rejected batch of {}", documents.len());
        }
        self.inner.upsert(collection, documents).await
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()> {
        self.inner.delete(collection, ids).await
    }

    async fn reset(&self, collection: &str) -> Result<()> {
        self.inner.reset(collection).await
    }
}

pub struct Harness {
    pub upstream: Arc<ScriptedUpstream>,
    pub sink: Arc<FlakySink>,
    pub state: Arc<SyncStateStore>,
    pub pipeline: Arc<FetchPipeline>,
    pub controller: Arc<SyncController>,
}

pub async fn harness(upstream: ScriptedUpstream, page_size: u32, interval: u64) -> Harness {
    let upstream = Arc::new(upstream);
    let sink = Arc::new(FlakySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let state = SyncStateStore::initialize(store, interval).await.unwrap();
    let pipeline = Arc::new(FetchPipeline::new(
        upstream.clone(),
        sink.clone(),
        Arc::clone(&state),
        page_size,
    ));
    let controller = SyncController::new(Arc::clone(&pipeline));
    Harness {
        upstream,
        sink,
        state,
        pipeline,
        controller,
    }
}

/// Everything currently queued on `rx`.
pub fn drain(rx: &mut mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
