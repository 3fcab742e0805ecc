//! Publishing, editing and deleting posts.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use flock_stator::{
    GraphBuilder, GraphError, HandlerError, Instance, InstanceId, NewInstance, Outcome, StateDef,
    StateGraph, StateKind, StatorError, StoreError, Transition,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::context::{Handled, bind};
use crate::fan_out::{self, FanOutData, FanOutKind};
use crate::federation::{object_uri, str_field};
use crate::follow::followers;
use crate::hashtag::{self, hashtags_in};
use crate::{
    AS_CONTEXT, AS_PUBLIC, ActivityError, Context, Federation, Identity, IdentityId, Post, PostId,
    Visibility,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostState {
    New,
    FannedOut,
    Deleted,
    DeletedFannedOut,
    Edited,
    EditedFannedOut,
}

impl StateKind for PostState {
    const GRAPH: &'static str = "post";

    fn name(self) -> &'static str {
        match self {
            PostState::New => "new",
            PostState::FannedOut => "fanned_out",
            PostState::Deleted => "deleted",
            PostState::DeletedFannedOut => "deleted_fanned_out",
            PostState::Edited => "edited",
            PostState::EditedFannedOut => "edited_fanned_out",
        }
    }

    fn all() -> &'static [Self] {
        &[
            PostState::New,
            PostState::FannedOut,
            PostState::Deleted,
            PostState::DeletedFannedOut,
            PostState::Edited,
            PostState::EditedFannedOut,
        ]
    }
}

impl PostState {
    /// Settled states a post can be edited or deleted from.
    fn is_published(self) -> bool {
        matches!(self, PostState::FannedOut | PostState::EditedFannedOut)
    }
}

/// Payload of a post instance; the post itself lives in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostData {
    pub post: PostId,
}

pub fn post_instance_id(post: PostId) -> InstanceId {
    InstanceId::derived(PostState::GRAPH, &post.to_string())
}

/// A post a local identity is about to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostDraft {
    pub content: String,
    pub visibility: Visibility,
    pub mentions: Vec<IdentityId>,
    pub in_reply_to: Option<PostId>,
}

impl PostDraft {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn mentioning(mut self, identity: IdentityId) -> Self {
        self.mentions.push(identity);
        self
    }

    pub fn replying_to(mut self, post: PostId) -> Self {
        self.in_reply_to = Some(post);
        self
    }
}

impl Post {
    /// The post as an ActivityPub Note.
    pub fn to_note(&self, author: &Identity, mentioned: &[Identity], in_reply_to: Option<&str>) -> Value {
        let followers = format!("{}followers/", author.actor_uri);
        let mention_uris: Vec<&str> = mentioned.iter().map(|i| i.actor_uri.as_str()).collect();
        let (to, cc): (Vec<&str>, Vec<&str>) = match self.visibility {
            Visibility::Public | Visibility::LocalOnly => {
                (vec![AS_PUBLIC], [&[followers.as_str()][..], &mention_uris[..]].concat())
            }
            Visibility::Unlisted => (
                vec![followers.as_str()],
                [&[AS_PUBLIC][..], &mention_uris[..]].concat(),
            ),
            Visibility::Followers => (vec![followers.as_str()], mention_uris.clone()),
            Visibility::Mentioned => (mention_uris.clone(), vec![]),
        };

        let mut tags: Vec<Value> = self
            .hashtags
            .iter()
            .map(|t| json!({"type": "Hashtag", "name": format!("#{}", t)}))
            .collect();
        tags.extend(
            mentioned
                .iter()
                .map(|i| json!({"type": "Mention", "href": i.actor_uri, "name": format!("@{}", i.handle)})),
        );

        let mut note = json!({
            "type": "Note",
            "id": self.object_uri,
            "attributedTo": author.actor_uri,
            "content": self.content,
            "published": self.created_at.to_rfc3339(),
            "to": to,
            "cc": cc,
            "tag": tags,
        });
        if let Some(reply) = in_reply_to {
            note["inReplyTo"] = json!(reply);
        }
        if let Some(edited) = self.edited_at {
            note["updated"] = json!(edited.to_rfc3339());
        }
        note
    }

    pub fn to_create_ap(&self, author: &Identity, note: Value) -> Value {
        json!({
            "@context": AS_CONTEXT,
            "type": "Create",
            "id": format!("{}#create", self.object_uri),
            "actor": author.actor_uri,
            "to": note["to"],
            "cc": note["cc"],
            "object": note,
        })
    }

    pub fn to_update_ap(&self, author: &Identity, note: Value) -> Value {
        let version = self.edited_at.unwrap_or(self.created_at).timestamp();
        json!({
            "@context": AS_CONTEXT,
            "type": "Update",
            "id": format!("{}#update/{}", self.object_uri, version),
            "actor": author.actor_uri,
            "object": note,
        })
    }

    pub fn to_delete_ap(&self, author: &Identity) -> Value {
        json!({
            "@context": AS_CONTEXT,
            "type": "Delete",
            "id": format!("{}#delete", self.object_uri),
            "actor": author.actor_uri,
            "object": {"type": "Tombstone", "id": self.object_uri},
        })
    }
}

/// Note for `post` with its mentions and reply target resolved.
pub(crate) async fn resolve_note(ctx: &Context, post: &Post, author: &Identity) -> Value {
    let mut mentioned = Vec::new();
    for id in &post.mentions {
        if let Some(identity) = ctx.directory.identity(*id).await {
            mentioned.push(identity);
        }
    }
    let reply_uri = match post.in_reply_to {
        Some(id) => ctx.directory.post(id).await.map(|p| p.object_uri),
        None => None,
    };
    post.to_note(author, &mentioned, reply_uri.as_deref())
}

pub(crate) fn graph(ctx: &Context) -> Result<StateGraph, GraphError> {
    use PostState::*;

    GraphBuilder::<PostState>::new()
        .state(New, StateDef::try_every(300))
        .state(FannedOut, StateDef::externally_progressed())
        .state(Deleted, StateDef::try_every(300))
        .state(DeletedFannedOut, StateDef::terminal())
        .state(Edited, StateDef::try_every(300))
        .state(EditedFannedOut, StateDef::externally_progressed())
        .transition(New, FannedOut)
        .transition(FannedOut, Deleted)
        .transition(FannedOut, Edited)
        .transition(Deleted, DeletedFannedOut)
        .transition(Edited, EditedFannedOut)
        .transition(Edited, Deleted)
        .transition(EditedFannedOut, Edited)
        .transition(EditedFannedOut, Deleted)
        .handler(New, bind(ctx, handle_new))
        .handler(Deleted, bind(ctx, handle_deleted))
        .handler(Edited, bind(ctx, handle_edited))
        .build()
}

/// Everyone who needs to see the post and its changes.
///
/// Mentions, followers unless only mentions may see it, and the author of
/// the post being replied to (plus their followers when that author is
/// local). Remote and local-only posts only go to local identities; local
/// posts also go to their author.
pub(crate) async fn targets(ctx: &Context, post: &Post) -> Result<BTreeSet<IdentityId>, StoreError> {
    let mut targets: BTreeSet<IdentityId> = post.mentions.iter().copied().collect();
    if post.visibility != Visibility::Mentioned {
        targets.extend(followers(ctx.store.as_ref(), post.author).await?);
    }
    if let Some(reply) = post.in_reply_to {
        if let Some(reply) = ctx.directory.post(reply).await {
            targets.insert(reply.author);
            if ctx.is_local(reply.author).await {
                targets.extend(followers(ctx.store.as_ref(), reply.author).await?);
            }
        }
    }

    let author_local = ctx.is_local(post.author).await;
    if !author_local || post.visibility == Visibility::LocalOnly {
        targets = ctx.only_local(targets).await;
    }
    if author_local {
        targets.insert(post.author);
    }
    Ok(targets)
}

async fn fan_out_records(
    ctx: &Context,
    instance: &Instance,
    kind: FanOutKind,
    with_hashtags: bool,
) -> Result<Option<Vec<NewInstance>>, HandlerError> {
    let data: PostData = instance.data_as()?;
    let Some(post) = ctx.directory.post(data.post).await else {
        debug!(instance = %instance.id, "post missing from directory");
        return Ok(None);
    };

    let mut records = Vec::new();
    for identity in targets(ctx, &post).await? {
        let fan_out = FanOutData {
            kind,
            identity,
            post: post.id,
            interaction: None,
        };
        records.push(fan_out::record(instance, &fan_out)?);
    }
    if with_hashtags {
        for tag in &post.hashtags {
            records.push(hashtag::record(tag)?);
        }
    }
    Ok(Some(records))
}

async fn handle_new(ctx: Context, instance: Instance) -> Handled<PostState> {
    let Some(records) = fan_out_records(&ctx, &instance, FanOutKind::Post, true).await? else {
        return Ok(Outcome::Stay);
    };
    Ok(Outcome::Transition(
        Transition::to(PostState::FannedOut).spawning(records),
    ))
}

async fn handle_deleted(ctx: Context, instance: Instance) -> Handled<PostState> {
    let Some(records) = fan_out_records(&ctx, &instance, FanOutKind::PostDeleted, false).await?
    else {
        return Ok(Outcome::Stay);
    };
    Ok(Outcome::Transition(
        Transition::to(PostState::DeletedFannedOut).spawning(records),
    ))
}

async fn handle_edited(ctx: Context, instance: Instance) -> Handled<PostState> {
    let Some(records) = fan_out_records(&ctx, &instance, FanOutKind::PostEdited, true).await?
    else {
        return Ok(Outcome::Stay);
    };
    Ok(Outcome::Transition(
        Transition::to(PostState::EditedFannedOut).spawning(records),
    ))
}

/// Who can see a remote post, from its addressing.
fn visibility_from_addressing(object: &Value) -> Visibility {
    let addressed = |field: &str| {
        object[field]
            .as_array()
            .is_some_and(|uris| uris.iter().any(|u| u == AS_PUBLIC))
            || object[field] == AS_PUBLIC
    };
    if addressed("to") {
        Visibility::Public
    } else if addressed("cc") {
        Visibility::Unlisted
    } else {
        Visibility::Followers
    }
}

impl Federation {
    /// Publish a post as the local `author`.
    #[tracing::instrument(skip(self, draft))]
    pub async fn create_post(
        &self,
        author: IdentityId,
        draft: PostDraft,
    ) -> Result<(Post, Instance), ActivityError> {
        let author = self.local_identity(author).await?;
        let id = PostId::new();
        let post = Post {
            id,
            author: author.id,
            object_uri: format!("{}posts/{}/", author.actor_uri, id),
            hashtags: hashtags_in(&draft.content),
            content: draft.content,
            visibility: draft.visibility,
            mentions: draft.mentions,
            in_reply_to: draft.in_reply_to,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
        };
        self.ctx.directory.add_post(post.clone()).await;
        let instance = self
            .stator
            .insert(NewInstance {
                id: post_instance_id(id),
                graph: PostState::GRAPH.to_string(),
                data: serde_json::to_value(PostData { post: id })?,
            })
            .await?;
        info!(post = %id, "post created");
        Ok((post, instance))
    }

    /// Replace a local post's content and fan the edit out.
    #[tracing::instrument(skip(self, content))]
    pub async fn edit_post(&self, post: PostId, content: &str) -> Result<Instance, ActivityError> {
        let existing = self.local_post(post).await?;
        self.ctx
            .directory
            .update_post(existing.id, |p| {
                p.content = content.to_string();
                p.hashtags = hashtags_in(content);
                p.edited_at = Some(Utc::now());
            })
            .await;
        self.mark_edited(post).await
    }

    /// Delete a local post and fan the deletion out. Returns `None` if the
    /// post had not been fanned out yet and was dropped outright.
    #[tracing::instrument(skip(self))]
    pub async fn delete_post(&self, post: PostId) -> Result<Option<Instance>, ActivityError> {
        self.local_post(post).await?;
        self.mark_deleted(post).await
    }

    /// An inbound Create of a Note. Returns `None` for other object types.
    #[tracing::instrument(skip_all)]
    pub async fn receive_create(&self, activity: &Value) -> Result<Option<Instance>, ActivityError> {
        let object = &activity["object"];
        if object["type"] != "Note" {
            debug!(object = ?object["type"], "ignoring create of unsupported object");
            return Ok(None);
        }
        let actor = str_field(activity, "actor")?;
        let attributed = object["attributedTo"].as_str().unwrap_or(actor);
        if attributed != actor {
            return Err(ActivityError::ActorMismatch {
                actor: actor.to_string(),
                expected: attributed.to_string(),
            });
        }
        let author = self.actor(actor).await?;
        let uri = str_field(object, "id")?;
        if let Some(existing) = self.ctx.directory.post_by_object_uri(uri).await {
            return Ok(self.find(post_instance_id(existing.id)).await?);
        }

        let mut hashtags = Vec::new();
        let mut mentions = Vec::new();
        for tag in object["tag"].as_array().into_iter().flatten() {
            match (tag["type"].as_str(), tag["name"].as_str(), tag["href"].as_str()) {
                (Some("Hashtag"), Some(name), _) => {
                    let name = name.trim_start_matches('#').to_lowercase();
                    if !name.is_empty() && !hashtags.contains(&name) {
                        hashtags.push(name);
                    }
                }
                (Some("Mention"), _, Some(href)) => {
                    if let Some(mentioned) = self.ctx.directory.identity_by_actor_uri(href).await {
                        mentions.push(mentioned.id);
                    }
                }
                _ => {}
            }
        }
        let in_reply_to = match object["inReplyTo"].as_str() {
            Some(uri) => self.ctx.directory.post_by_object_uri(uri).await.map(|p| p.id),
            None => None,
        };
        let created_at = object["published"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or_else(Utc::now, |d| d.with_timezone(&Utc));

        let id = PostId::new();
        let post = Post {
            id,
            author: author.id,
            object_uri: uri.to_string(),
            content: object["content"].as_str().unwrap_or_default().to_string(),
            hashtags,
            visibility: visibility_from_addressing(object),
            mentions,
            in_reply_to,
            created_at,
            edited_at: None,
            deleted: false,
        };
        self.ctx.directory.add_post(post).await;
        let instance = self
            .stator
            .insert(NewInstance {
                id: post_instance_id(id),
                graph: PostState::GRAPH.to_string(),
                data: serde_json::to_value(PostData { post: id })?,
            })
            .await?;
        Ok(Some(instance))
    }

    /// An inbound Update of a Note we have.
    #[tracing::instrument(skip_all)]
    pub async fn receive_update(&self, activity: &Value) -> Result<Option<Instance>, ActivityError> {
        let object = &activity["object"];
        let Some(post) = self.remote_post(activity).await? else {
            return Ok(None);
        };
        let content = object["content"].as_str().unwrap_or_default().to_string();
        let hashtags: Vec<String> = object["tag"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|t| t["type"] == "Hashtag")
            .filter_map(|t| t["name"].as_str())
            .map(|n| n.trim_start_matches('#').to_lowercase())
            .collect();
        self.ctx
            .directory
            .update_post(post.id, |p| {
                p.content = content;
                p.hashtags = hashtags;
                p.edited_at = Some(Utc::now());
            })
            .await;
        Ok(Some(self.mark_edited(post.id).await?))
    }

    /// An inbound Delete of a Note we have.
    #[tracing::instrument(skip_all)]
    pub async fn receive_delete(&self, activity: &Value) -> Result<Option<Instance>, ActivityError> {
        let Some(post) = self.remote_post(activity).await? else {
            return Ok(None);
        };
        self.mark_deleted(post.id).await
    }

    /// The post an inbound Update or Delete refers to, checking the actor
    /// wrote it.
    async fn remote_post(&self, activity: &Value) -> Result<Option<Post>, ActivityError> {
        let actor = str_field(activity, "actor")?;
        let uri = object_uri(&activity["object"])
            .ok_or_else(|| ActivityError::Malformed("activity without object".to_string()))?;
        let Some(post) = self.ctx.directory.post_by_object_uri(uri).await else {
            debug!(object = uri, "activity on unknown post");
            return Ok(None);
        };
        let author = self.identity(post.author).await?;
        if author.actor_uri != actor {
            return Err(ActivityError::ActorMismatch {
                actor: actor.to_string(),
                expected: author.actor_uri,
            });
        }
        Ok(Some(post))
    }

    async fn local_post(&self, id: PostId) -> Result<Post, ActivityError> {
        let post = self
            .ctx
            .directory
            .post(id)
            .await
            .ok_or(ActivityError::PostNotFound(id))?;
        if post.deleted {
            return Err(ActivityError::PostNotFound(id));
        }
        self.local_identity(post.author).await?;
        Ok(post)
    }

    async fn mark_edited(&self, post: PostId) -> Result<Instance, ActivityError> {
        let id = post_instance_id(post);
        let instance = self.stator.get(id).await?;
        match PostState::from_name(&instance.state) {
            Some(state) if state.is_published() => {
                Ok(self.stator.transition_perform(id, PostState::Edited).await?)
            }
            // Not fanned out yet; the pending fan-out reads the new content
            _ => Ok(instance),
        }
    }

    async fn mark_deleted(&self, post: PostId) -> Result<Option<Instance>, ActivityError> {
        self.ctx
            .directory
            .update_post(post, |p| p.deleted = true)
            .await;
        let id = post_instance_id(post);
        let instance = match self.stator.get(id).await {
            Ok(instance) => instance,
            Err(StatorError::InstanceNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match PostState::from_name(&instance.state) {
            Some(PostState::New) => {
                self.stator.delete(id).await?;
                Ok(None)
            }
            Some(state) if state.is_published() || state == PostState::Edited => Ok(Some(
                self.stator.transition_perform(id, PostState::Deleted).await?,
            )),
            _ => Ok(Some(instance)),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn post(author: &Identity, visibility: Visibility) -> Post {
        Post {
            id: PostId::new(),
            author: author.id,
            object_uri: format!("{}posts/1/", author.actor_uri),
            content: "hello #rust".to_string(),
            hashtags: vec!["rust".to_string()],
            visibility,
            mentions: vec![],
            in_reply_to: None,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
        }
    }

    #[test]
    fn test_note_addressing_by_visibility() {
        let author = Identity::local("alice", "https://flock.test");
        let bob = Identity::remote("bob", "https://remote.test/u/bob", "https://remote.test/inbox");
        let followers = "https://flock.test/@alice/followers/";

        let public = post(&author, Visibility::Public).to_note(&author, &[bob.clone()], None);
        assert_eq!(public["to"], json!([AS_PUBLIC]));
        assert_eq!(public["cc"], json!([followers, bob.actor_uri]));

        let unlisted = post(&author, Visibility::Unlisted).to_note(&author, &[], None);
        assert_eq!(unlisted["to"], json!([followers]));
        assert_eq!(unlisted["cc"], json!([AS_PUBLIC]));

        let mentioned = post(&author, Visibility::Mentioned).to_note(&author, &[bob.clone()], None);
        assert_eq!(mentioned["to"], json!([bob.actor_uri]));
        assert_eq!(mentioned["cc"], json!([]));
    }

    #[test]
    fn test_note_carries_tags_and_reply() {
        let author = Identity::local("alice", "https://flock.test");
        let note = post(&author, Visibility::Public).to_note(
            &author,
            &[],
            Some("https://remote.test/notes/9"),
        );
        assert_eq!(note["inReplyTo"], "https://remote.test/notes/9");
        assert_eq!(note["tag"], json!([{"type": "Hashtag", "name": "#rust"}]));
        assert!(note.get("updated").is_none());
    }

    #[test]
    fn test_create_and_delete_wrap_the_object() {
        let author = Identity::local("alice", "https://flock.test");
        let p = post(&author, Visibility::Public);
        let create = p.to_create_ap(&author, p.to_note(&author, &[], None));
        assert_eq!(create["id"], format!("{}#create", p.object_uri));
        assert_eq!(create["object"]["id"], p.object_uri);
        assert_eq!(create["to"], json!([AS_PUBLIC]));

        let delete = p.to_delete_ap(&author);
        assert_eq!(delete["object"]["type"], "Tombstone");
        assert_eq!(delete["object"]["id"], p.object_uri);
    }

    #[test]
    fn test_visibility_from_addressing() {
        assert_eq!(
            visibility_from_addressing(&json!({"to": [AS_PUBLIC]})),
            Visibility::Public
        );
        assert_eq!(
            visibility_from_addressing(&json!({"to": AS_PUBLIC})),
            Visibility::Public
        );
        assert_eq!(
            visibility_from_addressing(&json!({"to": ["x"], "cc": [AS_PUBLIC]})),
            Visibility::Unlisted
        );
        assert_eq!(
            visibility_from_addressing(&json!({"to": ["https://r.test/followers"]})),
            Visibility::Followers
        );
    }

    #[test]
    fn test_draft_builder() {
        let other = IdentityId::new();
        let parent = PostId::new();
        let draft = PostDraft::new("hi")
            .visibility(Visibility::Followers)
            .mentioning(other)
            .replying_to(parent);
        assert_eq!(draft.mentions, vec![other]);
        assert_eq!(draft.in_reply_to, Some(parent));
        assert_eq!(draft.visibility, Visibility::Followers);
    }
}
