//! Likes and boosts.

use std::collections::BTreeSet;

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
use crate::{
    AS_CONTEXT, AS_PUBLIC, ActivityError, Context, Federation, Identity, IdentityId, Post, PostId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionState {
    New,
    FannedOut,
    /// Undone here, undo not yet fanned out.
    Undone,
    UndoneFannedOut,
}

impl StateKind for InteractionState {
    const GRAPH: &'static str = "post_interaction";

    fn name(self) -> &'static str {
        match self {
            InteractionState::New => "new",
            InteractionState::FannedOut => "fanned_out",
            InteractionState::Undone => "undone",
            InteractionState::UndoneFannedOut => "undone_fanned_out",
        }
    }

    fn all() -> &'static [Self] {
        &[
            InteractionState::New,
            InteractionState::FannedOut,
            InteractionState::Undone,
            InteractionState::UndoneFannedOut,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Like,
    Boost,
}

impl InteractionKind {
    fn ap_type(self) -> &'static str {
        match self {
            InteractionKind::Like => "Like",
            InteractionKind::Boost => "Announce",
        }
    }

    fn path(self) -> &'static str {
        match self {
            InteractionKind::Like => "likes",
            InteractionKind::Boost => "boosts",
        }
    }
}

/// Payload of an interaction instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionData {
    pub kind: InteractionKind,
    /// Who liked or boosted.
    pub identity: IdentityId,
    pub post: PostId,
    /// ActivityPub id of the Like or Announce.
    pub object_uri: String,
}

impl InteractionData {
    pub fn to_ap(&self, actor: &Identity, post: &Post) -> Value {
        let mut activity = json!({
            "@context": AS_CONTEXT,
            "type": self.kind.ap_type(),
            "id": self.object_uri,
            "actor": actor.actor_uri,
            "object": post.object_uri,
        });
        if self.kind == InteractionKind::Boost {
            activity["to"] = json!([AS_PUBLIC]);
            activity["cc"] = json!([format!("{}followers/", actor.actor_uri)]);
        }
        activity
    }

    pub fn to_undo_ap(&self, actor: &Identity, post: &Post) -> Value {
        json!({
            "@context": AS_CONTEXT,
            "type": "Undo",
            "id": format!("{}#undo", self.object_uri),
            "actor": actor.actor_uri,
            "object": self.to_ap(actor, post),
        })
    }
}

/// The interaction instance for an activity id.
pub fn interaction_id(object_uri: &str) -> InstanceId {
    InstanceId::derived(InteractionState::GRAPH, object_uri)
}

pub(crate) fn graph(ctx: &Context) -> Result<StateGraph, GraphError> {
    use InteractionState::*;

    GraphBuilder::<InteractionState>::new()
        .state(New, StateDef::try_every(300))
        .state(FannedOut, StateDef::externally_progressed())
        .state(Undone, StateDef::try_every(300))
        .state(UndoneFannedOut, StateDef::terminal())
        .transition(New, FannedOut)
        .transition(FannedOut, Undone)
        .transition(FannedOut, UndoneFannedOut)
        .transition(Undone, UndoneFannedOut)
        .handler(New, bind(ctx, handle_new))
        .handler(Undone, bind(ctx, handle_undone))
        .build()
}

/// Everyone who should hear about the interaction (or its undoing).
///
/// Likes go to the post's author. Boosts go to the booster's followers
/// (only the local ones when the booster is remote), the author unless this
/// is an undo, and the booster if local.
pub(crate) async fn audience(
    ctx: &Context,
    interaction: &InteractionData,
    post: &Post,
    undo: bool,
) -> Result<BTreeSet<IdentityId>, StoreError> {
    let mut targets = BTreeSet::new();
    match interaction.kind {
        InteractionKind::Like => {
            targets.insert(post.author);
        }
        InteractionKind::Boost => {
            let booster_local = ctx.is_local(interaction.identity).await;
            for follower in followers(ctx.store.as_ref(), interaction.identity).await? {
                if booster_local || ctx.is_local(follower).await {
                    targets.insert(follower);
                }
            }
            if !undo {
                targets.insert(post.author);
            }
            if booster_local {
                targets.insert(interaction.identity);
            }
        }
    }
    Ok(targets)
}

async fn fan_out_records(
    ctx: &Context,
    instance: &Instance,
    undo: bool,
) -> Result<Option<Vec<NewInstance>>, HandlerError> {
    let interaction: InteractionData = instance.data_as()?;
    let Some(post) = ctx.directory.post(interaction.post).await else {
        debug!(instance = %instance.id, "interaction post unknown");
        return Ok(None);
    };
    let kind = if undo {
        FanOutKind::UndoInteraction
    } else {
        FanOutKind::Interaction
    };

    let mut records = Vec::new();
    for identity in audience(ctx, &interaction, &post, undo).await? {
        let data = FanOutData {
            kind,
            identity,
            post: post.id,
            interaction: Some(instance.id),
        };
        records.push(fan_out::record(instance, &data)?);
    }
    Ok(Some(records))
}

async fn handle_new(ctx: Context, instance: Instance) -> Handled<InteractionState> {
    let Some(records) = fan_out_records(&ctx, &instance, false).await? else {
        return Ok(Outcome::Stay);
    };
    Ok(Outcome::Transition(
        Transition::to(InteractionState::FannedOut).spawning(records),
    ))
}

async fn handle_undone(ctx: Context, instance: Instance) -> Handled<InteractionState> {
    let Some(records) = fan_out_records(&ctx, &instance, true).await? else {
        return Ok(Outcome::Stay);
    };
    Ok(Outcome::Transition(
        Transition::to(InteractionState::UndoneFannedOut).spawning(records),
    ))
}

impl Federation {
    pub async fn like(&self, identity: IdentityId, post: PostId) -> Result<Instance, ActivityError> {
        self.interact(identity, post, InteractionKind::Like).await
    }

    pub async fn boost(&self, identity: IdentityId, post: PostId) -> Result<Instance, ActivityError> {
        self.interact(identity, post, InteractionKind::Boost).await
    }

    /// Like or boost `post` as the local `identity`. Returns the existing
    /// interaction if it is still in effect.
    #[tracing::instrument(skip(self))]
    pub async fn interact(
        &self,
        identity: IdentityId,
        post: PostId,
        kind: InteractionKind,
    ) -> Result<Instance, ActivityError> {
        let actor = self.local_identity(identity).await?;
        let post = self
            .ctx
            .directory
            .post(post)
            .await
            .ok_or(ActivityError::PostNotFound(post))?;

        let object_uri = format!("{}{}/{}/", actor.actor_uri, kind.path(), post.id);
        let id = interaction_id(&object_uri);
        if let Some(existing) = self.find(id).await? {
            if existing.state != InteractionState::UndoneFannedOut.name() {
                return Ok(existing);
            }
            self.stator.delete(id).await?;
        }

        let data = InteractionData {
            kind,
            identity,
            post: post.id,
            object_uri,
        };
        let instance = self
            .stator
            .insert(NewInstance {
                id,
                graph: InteractionState::GRAPH.to_string(),
                data: serde_json::to_value(&data)?,
            })
            .await?;
        info!(interaction = %instance.id, ?kind, "interaction created");
        Ok(instance)
    }

    /// Undo a like or boost made by the local `identity`. Returns the
    /// interaction as it now stands, or `None` if there was nothing to undo.
    #[tracing::instrument(skip(self))]
    pub async fn undo_interaction(
        &self,
        identity: IdentityId,
        post: PostId,
        kind: InteractionKind,
    ) -> Result<Option<Instance>, ActivityError> {
        let actor = self.local_identity(identity).await?;
        let object_uri = format!("{}{}/{}/", actor.actor_uri, kind.path(), post);
        let id = interaction_id(&object_uri);
        let Some(existing) = self.find(id).await? else {
            return Ok(None);
        };

        match InteractionState::from_name(&existing.state) {
            Some(InteractionState::New) => {
                // Never fanned out
                self.stator.delete(id).await?;
                Ok(None)
            }
            Some(InteractionState::FannedOut) => Ok(Some(
                self.stator
                    .transition_perform(id, InteractionState::Undone)
                    .await?,
            )),
            _ => Ok(Some(existing)),
        }
    }

    /// An inbound Like or Announce. Shows it to the local identities who
    /// should see it and records it as already fanned out. Returns `None` if
    /// the post is unknown here.
    #[tracing::instrument(skip_all)]
    pub async fn receive_interaction(
        &self,
        activity: &Value,
    ) -> Result<Option<Instance>, ActivityError> {
        let kind = match str_field(activity, "type")? {
            "Like" => InteractionKind::Like,
            "Announce" => InteractionKind::Boost,
            other => {
                return Err(ActivityError::Malformed(format!(
                    "not an interaction: {}",
                    other
                )));
            }
        };
        let object_uri = str_field(activity, "id")?.to_string();
        let actor = self.actor(str_field(activity, "actor")?).await?;
        let post_uri = object_uri_of(activity)?;
        let Some(post) = self.ctx.directory.post_by_object_uri(post_uri).await else {
            debug!(post = post_uri, "interaction on unknown post");
            return Ok(None);
        };

        let id = interaction_id(&object_uri);
        if let Some(existing) = self.find(id).await? {
            return Ok(Some(existing));
        }

        let data = InteractionData {
            kind,
            identity: actor.id,
            post: post.id,
            object_uri,
        };
        let new = NewInstance {
            id,
            graph: InteractionState::GRAPH.to_string(),
            data: serde_json::to_value(&data)?,
        };
        let instance = match self
            .stator
            .create_forced(new, InteractionState::FannedOut)
            .await
        {
            Ok(instance) => instance,
            Err(StatorError::Store(StoreError::AlreadyExists(_))) => {
                return Ok(Some(self.stator.get(id).await?));
            }
            Err(e) => return Err(e.into()),
        };

        let recipients = audience(&self.ctx, &data, &post, false).await?;
        for identity in self.ctx.only_local(recipients).await {
            fan_out::add_interaction_event(&self.ctx, identity, &data, &post).await;
        }
        Ok(Some(instance))
    }

    /// An inbound Undo of a Like or Announce. Returns whether an
    /// interaction was undone.
    #[tracing::instrument(skip_all)]
    pub async fn receive_undo_interaction(&self, activity: &Value) -> Result<bool, ActivityError> {
        let actor = str_field(activity, "actor")?;
        let object_uri = object_uri(&activity["object"])
            .ok_or_else(|| ActivityError::Malformed("undo without object".to_string()))?;
        let Some(existing) = self.find(interaction_id(object_uri)).await? else {
            return Ok(false);
        };

        let data: InteractionData = serde_json::from_value(existing.data.clone())?;
        let identity = self.identity(data.identity).await?;
        if identity.actor_uri != actor {
            return Err(ActivityError::ActorMismatch {
                actor: actor.to_string(),
                expected: identity.actor_uri,
            });
        }
        if existing.state != InteractionState::FannedOut.name() {
            return Ok(false);
        }

        if let Some(post) = self.ctx.directory.post(data.post).await {
            let recipients = audience(&self.ctx, &data, &post, false).await?;
            for recipient in self.ctx.only_local(recipients).await {
                fan_out::remove_interaction_events(&self.ctx, recipient, &data).await;
            }
        }
        self.stator
            .transition_perform(existing.id, InteractionState::UndoneFannedOut)
            .await?;
        Ok(true)
    }
}

fn object_uri_of(activity: &Value) -> Result<&str, ActivityError> {
    object_uri(&activity["object"])
        .ok_or_else(|| ActivityError::Malformed("interaction without object".to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::Visibility;

    fn post(author: &Identity) -> Post {
        Post {
            id: PostId::new(),
            author: author.id,
            object_uri: format!("{}posts/1/", author.actor_uri),
            content: "hi".to_string(),
            hashtags: vec![],
            visibility: Visibility::Public,
            mentions: vec![],
            in_reply_to: None,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
        }
    }

    #[test]
    fn test_boost_is_announce_addressed_publicly() {
        let actor = Identity::local("alice", "https://flock.test");
        let author = Identity::remote("bob", "https://remote.test/u/bob", "https://remote.test/inbox");
        let post = post(&author);
        let data = InteractionData {
            kind: InteractionKind::Boost,
            identity: actor.id,
            post: post.id,
            object_uri: "https://flock.test/@alice/boosts/1/".to_string(),
        };

        let activity = data.to_ap(&actor, &post);
        assert_eq!(activity["type"], "Announce");
        assert_eq!(activity["object"], post.object_uri);
        assert_eq!(activity["to"], json!([AS_PUBLIC]));

        let undo = data.to_undo_ap(&actor, &post);
        assert_eq!(undo["type"], "Undo");
        assert_eq!(undo["object"], activity);
    }

    #[test]
    fn test_like_has_no_addressing() {
        let actor = Identity::local("alice", "https://flock.test");
        let post = post(&actor);
        let data = InteractionData {
            kind: InteractionKind::Like,
            identity: actor.id,
            post: post.id,
            object_uri: "https://flock.test/@alice/likes/1/".to_string(),
        };
        let activity = data.to_ap(&actor, &post);
        assert_eq!(activity["type"], "Like");
        assert!(activity.get("to").is_none());
    }
}
