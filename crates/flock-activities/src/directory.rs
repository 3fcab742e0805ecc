//! In-memory directory of identities, posts and timelines.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Identity, IdentityId, Post, PostId, TimelineEvent, TimelineEventKind, Visibility};

/// Serializable contents of a [`Directory`], used to seed it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub posts: Vec<Post>,
}

#[derive(Debug, Default)]
struct Inner {
    identities: HashMap<IdentityId, Identity>,
    posts: HashMap<PostId, Post>,
    timeline: Vec<TimelineEvent>,
}

/// Identities, posts and timeline events shared by the graph handlers.
#[derive(Debug, Default)]
pub struct Directory {
    inner: RwLock<Inner>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let inner = Inner {
            identities: seed.identities.into_iter().map(|i| (i.id, i)).collect(),
            posts: seed.posts.into_iter().map(|p| (p.id, p)).collect(),
            timeline: Vec::new(),
        };
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub async fn add_identity(&self, identity: Identity) -> IdentityId {
        let id = identity.id;
        self.inner.write().await.identities.insert(id, identity);
        id
    }

    pub async fn identity(&self, id: IdentityId) -> Option<Identity> {
        self.inner.read().await.identities.get(&id).cloned()
    }

    pub async fn identity_by_actor_uri(&self, uri: &str) -> Option<Identity> {
        self.inner
            .read()
            .await
            .identities
            .values()
            .find(|i| i.actor_uri == uri)
            .cloned()
    }

    pub async fn add_post(&self, post: Post) -> PostId {
        let id = post.id;
        self.inner.write().await.posts.insert(id, post);
        id
    }

    pub async fn post(&self, id: PostId) -> Option<Post> {
        self.inner.read().await.posts.get(&id).cloned()
    }

    pub async fn post_by_object_uri(&self, uri: &str) -> Option<Post> {
        self.inner
            .read()
            .await
            .posts
            .values()
            .find(|p| p.object_uri == uri)
            .cloned()
    }

    /// Apply `edit` to a stored post. Returns the updated post.
    pub async fn update_post(&self, id: PostId, edit: impl FnOnce(&mut Post)) -> Option<Post> {
        let mut inner = self.inner.write().await;
        let post = inner.posts.get_mut(&id)?;
        edit(post);
        Some(post.clone())
    }

    /// Undeleted top-level posts by local authors, visible to the public,
    /// carrying `tag`.
    pub async fn local_public_posts_tagged(&self, tag: &str) -> Vec<Post> {
        let inner = self.inner.read().await;
        inner
            .posts
            .values()
            .filter(|p| !p.deleted && p.in_reply_to.is_none())
            .filter(|p| matches!(p.visibility, Visibility::Public | Visibility::LocalOnly))
            .filter(|p| p.hashtags.iter().any(|t| t == tag))
            .filter(|p| inner.identities.get(&p.author).is_some_and(|a| a.local))
            .cloned()
            .collect()
    }

    /// Add a timeline entry unless an identical one exists. Returns whether
    /// it was added.
    pub async fn add_timeline_event(&self, event: TimelineEvent) -> bool {
        let mut inner = self.inner.write().await;
        let exists = inner.timeline.iter().any(|e| {
            e.identity == event.identity
                && e.kind == event.kind
                && e.post == event.post
                && e.subject_identity == event.subject_identity
        });
        if exists {
            return false;
        }
        debug!(identity = %event.identity, kind = ?event.kind, post = ?event.post, "timeline event added");
        inner.timeline.push(event);
        true
    }

    /// Remove matching entries from `identity`'s timeline. `None` filters
    /// match anything. Returns how many were removed.
    pub async fn remove_timeline_events(
        &self,
        identity: IdentityId,
        post: Option<PostId>,
        kind: Option<TimelineEventKind>,
        subject: Option<IdentityId>,
    ) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.timeline.len();
        inner.timeline.retain(|e| {
            !(e.identity == identity
                && post.is_none_or(|p| e.post == Some(p))
                && kind.is_none_or(|k| e.kind == k)
                && subject.is_none_or(|s| e.subject_identity == Some(s)))
        });
        before - inner.timeline.len()
    }

    /// `identity`'s timeline, oldest first.
    pub async fn timeline(&self, identity: IdentityId) -> Vec<TimelineEvent> {
        self.inner
            .read()
            .await
            .timeline
            .iter()
            .filter(|e| e.identity == identity)
            .cloned()
            .collect()
    }
}
