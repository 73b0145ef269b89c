//! Data types that flow through a sync pass.
//!
//! [`Channel`], [`Post`] and [`PostPage`] mirror the upstream JSON shapes;
//! [`VectorDocument`] is what the sink receives.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Which upstream system a record came from. Selects the sink collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Mattermost,
}

impl SourceKind {
    /// Short tag stored in each record's metadata.
    pub fn tag(&self) -> &'static str {
        match self {
            SourceKind::Mattermost => "mm",
        }
    }

    /// Name of the sink collection holding records of this kind.
    pub fn collection_name(&self) -> &'static str {
        match self {
            SourceKind::Mattermost => "mattermost_messages",
        }
    }
}

/// Visibility class of a channel, stored as the record's access tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Private,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Public => "pub",
            Access::Private => "pri",
        }
    }
}

/// A channel as listed by the upstream source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Channel {
    pub id: String,
    /// `O` open, `P` private, `D` direct, `G` group.
    #[serde(rename = "type", default)]
    pub channel_type: String,
    #[serde(default)]
    pub display_name: String,
    /// Used only to estimate the amount of work for progress reporting.
    #[serde(default)]
    pub total_msg_count: u64,
}

impl Channel {
    pub fn access(&self) -> Access {
        if self.channel_type == "O" {
            Access::Public
        } else {
            Access::Private
        }
    }
}

/// A single upstream record (a chat post).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user_id: String,
    /// Empty for ordinary user posts; system posts carry a subtype here.
    #[serde(rename = "type", default)]
    pub post_type: String,
    #[serde(default)]
    pub update_at: i64,
    /// Deletion marker: non-zero once the post was deleted upstream.
    #[serde(default)]
    pub delete_at: i64,
    #[serde(default)]
    pub channel_id: String,
}

impl Post {
    pub fn is_deleted(&self) -> bool {
        self.delete_at > 0
    }

    /// Plain, non-empty user text. Deleted posts are handled separately.
    pub fn is_indexable(&self) -> bool {
        self.post_type.is_empty() && !self.message.trim().is_empty()
    }
}

/// One page of posts for a channel.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PostPage {
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub posts: HashMap<String, Post>,
    #[serde(rename = "prev_post_id", default)]
    pub previous_post_id: String,
}

impl PostPage {
    /// Posts in the order the source listed them. Ids missing from the
    /// `posts` map are skipped.
    pub fn ordered_posts(&self) -> impl Iterator<Item = &Post> {
        self.order.iter().filter_map(|id| self.posts.get(id))
    }

    /// True when no further page should be requested for this channel.
    pub fn is_last(&self) -> bool {
        self.order.is_empty() || self.previous_post_id.is_empty()
    }
}

/// Parameters for one page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Only records updated after this Unix-millisecond timestamp.
    pub since: Option<i64>,
    pub page: u32,
    pub per_page: u32,
}

/// A record ready for the vector sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorDocument {
    pub id: String,
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl VectorDocument {
    pub fn from_post(post: &Post, access: Access, source: SourceKind) -> Self {
        let mut metadata = Map::new();
        metadata.insert("source".into(), Value::from(source.tag()));
        metadata.insert("access".into(), Value::from(access.as_str()));
        metadata.insert("channel_id".into(), Value::from(post.channel_id.clone()));
        metadata.insert("user_id".into(), Value::from(post.user_id.clone()));
        metadata.insert("update_at".into(), Value::from(post.update_at));

        Self {
            id: post.id.clone(),
            text: post.message.clone(),
            metadata,
        }
    }
}
