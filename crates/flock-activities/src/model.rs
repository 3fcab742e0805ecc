//! Identities, posts and timeline entries the graphs act on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an identity (local account or known remote actor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub Uuid);

impl IdentityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub Uuid);

impl PostId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PostId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An account, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub handle: String,
    /// ActivityPub actor URI.
    pub actor_uri: String,
    pub inbox_uri: String,
    /// Whether this server hosts the account.
    pub local: bool,
}

impl Identity {
    /// A local identity whose URIs live under `base`.
    pub fn local(handle: &str, base: &str) -> Self {
        let actor_uri = format!("{}/@{}/", base.trim_end_matches('/'), handle);
        Self {
            id: IdentityId::new(),
            handle: handle.to_string(),
            inbox_uri: format!("{}inbox/", actor_uri),
            actor_uri,
            local: true,
        }
    }

    /// A remote identity with known actor and inbox URIs.
    pub fn remote(handle: &str, actor_uri: &str, inbox_uri: &str) -> Self {
        Self {
            id: IdentityId::new(),
            handle: handle.to_string(),
            actor_uri: actor_uri.to_string(),
            inbox_uri: inbox_uri.to_string(),
            local: false,
        }
    }
}

/// Who a post is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Followers,
    /// Only the mentioned identities.
    Mentioned,
    /// Public, but never federated.
    LocalOnly,
}

/// A post and the fields fan-out needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub author: IdentityId,
    /// ActivityPub object URI.
    pub object_uri: String,
    pub content: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub mentions: Vec<IdentityId>,
    #[serde(default)]
    pub in_reply_to: Option<PostId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

/// What a timeline entry shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    /// A post in the home timeline.
    Post,
    /// A post mentioning the identity.
    Mentioned,
    /// Someone started following the identity.
    Followed,
    /// Someone boosted a post into this timeline.
    Boost,
    /// Someone liked the identity's post.
    Liked,
    /// Someone boosted the identity's post.
    Boosted,
}

/// One entry in a local identity's timeline or notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Owner of the timeline.
    pub identity: IdentityId,
    pub kind: TimelineEventKind,
    /// The post the entry is about; `None` for follows.
    pub post: Option<PostId>,
    /// The identity that caused the entry, for follows, mentions, boosts and likes.
    pub subject_identity: Option<IdentityId>,
    pub created_at: DateTime<Utc>,
}
