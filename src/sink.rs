//! [`VectorSink`] backends.
//!
//! - **[`ChromaSink`]**: Chroma's REST API. Collections are created on
//!   first use (`get_or_create`, cosine space) and their ids cached.
//!   Embeddings are computed client-side by an [`Embedder`], so one page
//!   of records is exactly one `upsert` request.
//! - **[`MemorySink`]**: keeps documents in a map and records every call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::SinkConfig;
use crate::embedding::{Embedder, HashEmbedder};
use crate::models::VectorDocument;
use crate::traits::VectorSink;

// ============ Chroma ============

pub struct ChromaSink {
    base_url: String,
    client: reqwest::Client,
    embedder: Arc<dyn Embedder>,
    /// Collection name → Chroma collection id.
    collections: RwLock<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct CollectionInfo {
    id: String,
}

impl ChromaSink {
    pub fn new(
        base_url: &str,
        timeout: std::time::Duration,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            embedder,
            collections: RwLock::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            config.timeout(),
            Arc::new(HashEmbedder::new(config.embedding_dims)),
        )
    }

    async fn collection_id(&self, name: &str) -> Result<String> {
        {
            let cached = self.collections.read().await;
            if let Some(id) = cached.get(name) {
                return Ok(id.clone());
            }
        }

        let url = format!("{}/api/v1/collections", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "name": name,
                "metadata": { "hnsw:space": "cosine" },
                "get_or_create": true,
            }))
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("creating collection '{}' returned {}: {}", name, status, body);
        }

        let info: CollectionInfo = response
            .json()
            .await
            .with_context(|| format!("could not decode collection '{}'", name))?;

        info!(collection = name, id = %info.id, "using chroma collection");
        self.collections
            .write()
            .await
            .insert(name.to_string(), info.id.clone());
        Ok(info.id)
    }

    async fn post_collection(&self, collection: &str, op: &str, body: serde_json::Value) -> Result<()> {
        let id = self.collection_id(collection).await?;
        let url = format!("{}/api/v1/collections/{}/{}", self.base_url, id, op);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{} on '{}' returned {}: {}", op, collection, status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl VectorSink for ChromaSink {
    async fn upsert(&self, collection: &str, documents: &[VectorDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let texts: Vec<&str> = documents.iter().map(|d| d.text.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts);
        let body = json!({
            "ids": documents.iter().map(|d| &d.id).collect::<Vec<_>>(),
            "embeddings": embeddings,
            "documents": texts,
            "metadatas": documents.iter().map(|d| &d.metadata).collect::<Vec<_>>(),
        });

        debug!(collection, count = documents.len(), "upserting documents");
        self.post_collection(collection, "upsert", body).await
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        debug!(collection, count = ids.len(), "deleting documents");
        self.post_collection(collection, "delete", json!({ "ids": ids }))
            .await
    }

    async fn reset(&self, collection: &str) -> Result<()> {
        let url = format!("{}/api/v1/collections/{}", self.base_url, collection);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if !is_missing_collection(status, &body) {
                bail!("dropping collection '{}' returned {}: {}", collection, status, body);
            }
            debug!(collection, "collection did not exist");
        }

        self.collections.write().await.remove(collection);
        Ok(())
    }
}

/// Chroma reports an unknown collection as 404 on newer servers and as an
/// error whose message says it "does not exist" on older ones.
fn is_missing_collection(status: StatusCode, body: &str) -> bool {
    status == StatusCode::NOT_FOUND
        || ((status.is_client_error() || status.is_server_error())
            && status != StatusCode::UNAUTHORIZED
            && status != StatusCode::FORBIDDEN
            && body.contains("does not exist"))
}

// ============ In-memory ============

/// A recorded call against a [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Upsert { collection: String, ids: Vec<String> },
    Delete { collection: String, ids: Vec<String> },
    Reset { collection: String },
}

#[derive(Default)]
pub struct MemorySink {
    collections: Mutex<HashMap<String, BTreeMap<String, VectorDocument>>>,
    calls: Mutex<Vec<SinkCall>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<VectorDocument> {
        let collections = self.collections.lock().ok()?;
        collections.get(collection)?.get(id).cloned()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: SinkCall) -> Result<()> {
        self.calls
            .lock()
            .map_err(|_| anyhow::anyhow!("sink call log poisoned"))?
            .push(call);
        Ok(())
    }
}

#[async_trait]
impl VectorSink for MemorySink {
    async fn upsert(&self, collection: &str, documents: &[VectorDocument]) -> Result<()> {
        self.record(SinkCall::Upsert {
            collection: collection.to_string(),
            ids: documents.iter().map(|d| d.id.clone()).collect(),
        })?;
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| anyhow::anyhow!("sink map poisoned"))?;
        let docs = collections.entry(collection.to_string()).or_default();
        for doc in documents {
            docs.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<()> {
        self.record(SinkCall::Delete {
            collection: collection.to_string(),
            ids: ids.to_vec(),
        })?;
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| anyhow::anyhow!("sink map poisoned"))?;
        if let Some(docs) = collections.get_mut(collection) {
            for id in ids {
                docs.remove(id);
            }
        }
        Ok(())
    }

    async fn reset(&self, collection: &str) -> Result<()> {
        self.record(SinkCall::Reset {
            collection: collection.to_string(),
        })?;
        self.collections
            .lock()
            .map_err(|_| anyhow::anyhow!("sink map poisoned"))?
            .remove(collection);
        Ok(())
    }
}
