//! Mattermost REST client.
//!
//! Implements [`UpstreamClient`] against the Mattermost v4 API:
//!
//! | Call | Endpoint |
//! |------|----------|
//! | `list_channels` | `GET {base}/channels?page=N&per_page=200` (repeated until a short page) |
//! | `list_posts_page` | `GET {base}/channels/{id}/posts?page=N&per_page=M[&since=millis]` |
//!
//! Every request carries `Authorization: Bearer <token>` and the client-wide
//! timeout from `[upstream].timeout_secs`.
//!
//! # Environment Variables
//!
//! The token is read from the variable named by `[upstream].token_env`
//! (default `MM_ACCESS_TOKEN`).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::models::{Channel, PageRequest, PostPage};
use crate::traits::UpstreamClient;

const CHANNEL_PAGE_SIZE: u32 = 200;

pub struct MattermostClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl MattermostClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    /// Build a client from config, reading the token from the environment.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .with_context(|| format!("{} environment variable not set", config.token_env))?;
        Self::new(&config.base_url, &token, config.timeout())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json")
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GET {} returned {}: {}", url, status, body);
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("could not decode response from {}", url))
    }
}

#[async_trait]
impl UpstreamClient for MattermostClient {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut channels = Vec::new();
        let mut page = 0u32;

        loop {
            let batch: Vec<Channel> = self
                .get_json(
                    "/channels",
                    &[
                        ("page", page.to_string()),
                        ("per_page", CHANNEL_PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let short = (batch.len() as u32) < CHANNEL_PAGE_SIZE;
            channels.extend(batch);
            if short {
                break;
            }
            page += 1;
        }

        debug!(count = channels.len(), "listed channels");
        Ok(channels)
    }

    async fn list_posts_page(&self, channel_id: &str, request: &PageRequest) -> Result<PostPage> {
        let mut query = vec![
            ("page", request.page.to_string()),
            ("per_page", request.per_page.to_string()),
        ];
        if let Some(since) = request.since {
            query.push(("since", since.to_string()));
        }

        self.get_json(&format!("/channels/{}/posts", channel_id), &query)
            .await
    }
}
