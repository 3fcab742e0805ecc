//! Follow relationships between identities.

use chrono::Utc;
use flock_stator::{
    GraphBuilder, GraphError, Instance, InstanceId, NewInstance, Outcome, StateDef, StateGraph,
    StateKind, StatorError, StatorStore, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::context::{Handled, bind};
use crate::federation::{object_uri, str_field};
use crate::{
    AS_CONTEXT, ActivityError, Context, Federation, Identity, IdentityId, TimelineEvent,
    TimelineEventKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FollowState {
    /// Created locally, request not yet sent.
    Unrequested,
    /// Request sent to a remote target, waiting for their Accept.
    LocalRequested,
    /// Request received from a remote source, Accept not yet sent.
    RemoteRequested,
    Accepted,
    /// Unfollowed here, Undo not yet sent.
    UndoneLocally,
    UndoneRemotely,
}

impl StateKind for FollowState {
    const GRAPH: &'static str = "follow";

    fn name(self) -> &'static str {
        match self {
            FollowState::Unrequested => "unrequested",
            FollowState::LocalRequested => "local_requested",
            FollowState::RemoteRequested => "remote_requested",
            FollowState::Accepted => "accepted",
            FollowState::UndoneLocally => "undone_locally",
            FollowState::UndoneRemotely => "undone_remotely",
        }
    }

    fn all() -> &'static [Self] {
        &[
            FollowState::Unrequested,
            FollowState::LocalRequested,
            FollowState::RemoteRequested,
            FollowState::Accepted,
            FollowState::UndoneLocally,
            FollowState::UndoneRemotely,
        ]
    }
}

impl FollowState {
    /// Whether the source should still see the target's posts.
    pub fn is_active(self) -> bool {
        !matches!(self, FollowState::UndoneLocally | FollowState::UndoneRemotely)
    }
}

/// Payload of a follow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowData {
    pub source: IdentityId,
    pub target: IdentityId,
    /// ActivityPub id of the Follow activity.
    pub uri: String,
}

impl FollowData {
    pub fn to_ap(&self, source: &Identity, target: &Identity) -> Value {
        json!({
            "@context": AS_CONTEXT,
            "type": "Follow",
            "id": self.uri,
            "actor": source.actor_uri,
            "object": target.actor_uri,
        })
    }

    pub fn to_accept_ap(&self, source: &Identity, target: &Identity) -> Value {
        json!({
            "@context": AS_CONTEXT,
            "type": "Accept",
            "id": format!("{}#accept", self.uri),
            "actor": target.actor_uri,
            "object": self.to_ap(source, target),
        })
    }

    pub fn to_undo_ap(&self, source: &Identity, target: &Identity) -> Value {
        json!({
            "@context": AS_CONTEXT,
            "type": "Undo",
            "id": format!("{}#undo", self.uri),
            "actor": source.actor_uri,
            "object": self.to_ap(source, target),
        })
    }
}

/// The one follow instance for a source/target pair.
pub fn follow_id(source: IdentityId, target: IdentityId) -> InstanceId {
    InstanceId::derived(FollowState::GRAPH, &format!("{}>{}", source, target))
}

pub(crate) fn graph(ctx: &Context) -> Result<StateGraph, GraphError> {
    use FollowState::*;

    GraphBuilder::<FollowState>::new()
        .state(Unrequested, StateDef::try_every(300))
        .state(LocalRequested, StateDef::try_every(24 * 3600))
        .state(RemoteRequested, StateDef::try_every(24 * 3600))
        .state(Accepted, StateDef::externally_progressed())
        .state(UndoneLocally, StateDef::try_every(3600))
        .state(UndoneRemotely, StateDef::terminal())
        .transition(Unrequested, LocalRequested)
        .transition(Unrequested, RemoteRequested)
        .transition(Unrequested, Accepted)
        .transition(LocalRequested, Accepted)
        .transition(LocalRequested, UndoneLocally)
        .transition(RemoteRequested, Accepted)
        .transition(Accepted, UndoneLocally)
        .transition(UndoneLocally, UndoneRemotely)
        .handler(Unrequested, bind(ctx, handle_unrequested))
        .handler(LocalRequested, bind(ctx, handle_local_requested))
        .handler(RemoteRequested, bind(ctx, handle_remote_requested))
        .handler(UndoneLocally, bind(ctx, handle_undone_locally))
        .build()
}

async fn parties(ctx: &Context, follow: &FollowData) -> Option<(Identity, Identity)> {
    let source = ctx.directory.identity(follow.source).await?;
    let target = ctx.directory.identity(follow.target).await?;
    Some((source, target))
}

async fn add_followed_event(ctx: &Context, source: &Identity, target: &Identity) {
    if target.local {
        ctx.directory
            .add_timeline_event(TimelineEvent {
                identity: target.id,
                kind: TimelineEventKind::Followed,
                post: None,
                subject_identity: Some(source.id),
                created_at: Utc::now(),
            })
            .await;
    }
}

/// Send the request, or note that a remote source's request arrived.
async fn handle_unrequested(ctx: Context, instance: Instance) -> Handled<FollowState> {
    let follow: FollowData = instance.data_as()?;
    let Some((source, target)) = parties(&ctx, &follow).await else {
        debug!(instance = %instance.id, "follow parties unknown, waiting");
        return Ok(Outcome::Stay);
    };

    if !source.local {
        return Ok(Outcome::to(FollowState::RemoteRequested));
    }
    if target.local {
        add_followed_event(&ctx, &source, &target).await;
        return Ok(Outcome::to(FollowState::Accepted));
    }

    ctx.delivery
        .deliver(&source, &target.inbox_uri, &follow.to_ap(&source, &target))
        .await?;
    Ok(Outcome::to(FollowState::LocalRequested))
}

/// Waiting on the remote side; the Accept arrives through the inbox.
async fn handle_local_requested(_ctx: Context, _instance: Instance) -> Handled<FollowState> {
    Ok(Outcome::Stay)
}

/// Accept a remote request on behalf of the local target.
async fn handle_remote_requested(ctx: Context, instance: Instance) -> Handled<FollowState> {
    let follow: FollowData = instance.data_as()?;
    let Some((source, target)) = parties(&ctx, &follow).await else {
        return Ok(Outcome::Stay);
    };

    ctx.delivery
        .deliver(&target, &source.inbox_uri, &follow.to_accept_ap(&source, &target))
        .await?;
    add_followed_event(&ctx, &source, &target).await;
    Ok(Outcome::to(FollowState::Accepted))
}

/// Tell the target the local source stopped following them.
async fn handle_undone_locally(ctx: Context, instance: Instance) -> Handled<FollowState> {
    let follow: FollowData = instance.data_as()?;
    let Some((source, target)) = parties(&ctx, &follow).await else {
        return Ok(Outcome::Stay);
    };

    if !target.local {
        ctx.delivery
            .deliver(&source, &target.inbox_uri, &follow.to_undo_ap(&source, &target))
            .await?;
    }
    Ok(Outcome::to(FollowState::UndoneRemotely))
}

/// Sources of every active follow pointing at `target`.
pub(crate) async fn followers(
    store: &dyn StatorStore,
    target: IdentityId,
) -> Result<Vec<IdentityId>, StoreError> {
    let mut sources: Vec<IdentityId> = store
        .list(FollowState::GRAPH)
        .await?
        .iter()
        .filter(|i| FollowState::from_name(&i.state).is_some_and(FollowState::is_active))
        .filter_map(|i| i.data_as::<FollowData>().ok())
        .filter(|f| f.target == target)
        .map(|f| f.source)
        .collect();
    sources.sort();
    sources.dedup();
    Ok(sources)
}

impl Federation {
    /// Follow `target` from the local identity `source`.
    ///
    /// Following a local target is accepted immediately; a remote target is
    /// sent a request by the scheduler. Returns the existing follow if one is
    /// still in effect.
    #[tracing::instrument(skip(self))]
    pub async fn follow(
        &self,
        source: IdentityId,
        target: IdentityId,
    ) -> Result<Instance, ActivityError> {
        let source_identity = self.local_identity(source).await?;
        let target_identity = self.identity(target).await?;
        let id = follow_id(source, target);

        if let Some(existing) = self.find(id).await? {
            if existing.state != FollowState::UndoneRemotely.name() {
                return Ok(existing);
            }
            // A finished unfollow; start over
            self.stator.delete(id).await?;
        }

        let data = FollowData {
            source,
            target,
            uri: format!("{}follow/{}/", source_identity.actor_uri, id),
        };
        let new = NewInstance {
            id,
            graph: FollowState::GRAPH.to_string(),
            data: serde_json::to_value(&data)?,
        };

        let instance = if target_identity.local {
            let instance = self.stator.create_forced(new, FollowState::Accepted).await?;
            add_followed_event(&self.ctx, &source_identity, &target_identity).await;
            instance
        } else {
            self.stator.insert(new).await?
        };
        info!(follow = %instance.id, state = %instance.state, "follow created");
        Ok(instance)
    }

    /// Stop following. Returns the follow as it now stands, or `None` if there
    /// was nothing to undo.
    #[tracing::instrument(skip(self))]
    pub async fn unfollow(
        &self,
        source: IdentityId,
        target: IdentityId,
    ) -> Result<Option<Instance>, ActivityError> {
        self.local_identity(source).await?;
        let id = follow_id(source, target);
        let Some(existing) = self.find(id).await? else {
            return Ok(None);
        };

        match FollowState::from_name(&existing.state) {
            Some(FollowState::Unrequested) => {
                // Nothing was sent yet
                self.stator.delete(id).await?;
                Ok(None)
            }
            Some(FollowState::LocalRequested | FollowState::Accepted) => {
                let instance = self
                    .stator
                    .transition_perform(id, FollowState::UndoneLocally)
                    .await?;
                self.ctx
                    .directory
                    .remove_timeline_events(target, None, Some(TimelineEventKind::Followed), Some(source))
                    .await;
                Ok(Some(instance))
            }
            _ => Ok(Some(existing)),
        }
    }

    /// An inbound Follow: record the request so the scheduler accepts it.
    #[tracing::instrument(skip_all)]
    pub async fn receive_follow(&self, activity: &Value) -> Result<Instance, ActivityError> {
        let source = self.actor(str_field(activity, "actor")?).await?;
        let target_uri = object_uri(&activity["object"])
            .ok_or_else(|| ActivityError::Malformed("follow without object".to_string()))?;
        let target = self.actor(target_uri).await?;
        if !target.local {
            return Err(ActivityError::NotLocal(target.id));
        }

        let id = follow_id(source.id, target.id);
        if let Some(existing) = self.find(id).await? {
            match FollowState::from_name(&existing.state) {
                Some(FollowState::UndoneRemotely) => {
                    self.stator.delete(id).await?;
                }
                Some(FollowState::Unrequested) => {
                    return Ok(self
                        .stator
                        .transition_perform(id, FollowState::RemoteRequested)
                        .await?);
                }
                _ => {
                    debug!(follow = %id, state = %existing.state, "duplicate follow request");
                    return Ok(existing);
                }
            }
        }

        let data = FollowData {
            source: source.id,
            target: target.id,
            uri: str_field(activity, "id")?.to_string(),
        };
        let new = NewInstance {
            id,
            graph: FollowState::GRAPH.to_string(),
            data: serde_json::to_value(&data)?,
        };
        match self
            .stator
            .create_forced(new, FollowState::RemoteRequested)
            .await
        {
            Ok(instance) => Ok(instance),
            // Lost a race with a concurrent delivery of the same request
            Err(StatorError::Store(StoreError::AlreadyExists(_))) => Ok(self.stator.get(id).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// An inbound Accept of one of our requests.
    #[tracing::instrument(skip_all)]
    pub async fn receive_accept(&self, activity: &Value) -> Result<Instance, ActivityError> {
        let actor = str_field(activity, "actor")?;
        let follow = &activity["object"];
        let (source_uri, target_uri) = (str_field(follow, "actor")?, str_field(follow, "object")?);
        if actor != target_uri {
            return Err(ActivityError::ActorMismatch {
                actor: actor.to_string(),
                expected: target_uri.to_string(),
            });
        }

        let existing = self.follow_between(source_uri, target_uri).await?;
        match FollowState::from_name(&existing.state) {
            Some(FollowState::Unrequested | FollowState::LocalRequested) => Ok(self
                .stator
                .transition_perform(existing.id, FollowState::Accepted)
                .await?),
            _ => Ok(existing),
        }
    }

    /// An inbound Undo of a follow: the remote source stopped following.
    /// Returns whether a follow was removed.
    #[tracing::instrument(skip_all)]
    pub async fn receive_undo_follow(&self, activity: &Value) -> Result<bool, ActivityError> {
        let actor = str_field(activity, "actor")?;
        let follow = &activity["object"];
        let (source_uri, target_uri) = (str_field(follow, "actor")?, str_field(follow, "object")?);
        if actor != source_uri {
            return Err(ActivityError::ActorMismatch {
                actor: actor.to_string(),
                expected: source_uri.to_string(),
            });
        }

        let existing = match self.follow_between(source_uri, target_uri).await {
            Ok(existing) => existing,
            Err(ActivityError::NoFollow { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let follow: FollowData = serde_json::from_value(existing.data.clone())?;
        self.ctx
            .directory
            .remove_timeline_events(
                follow.target,
                None,
                Some(TimelineEventKind::Followed),
                Some(follow.source),
            )
            .await;
        Ok(self.stator.delete(existing.id).await?)
    }

    async fn follow_between(
        &self,
        source_uri: &str,
        target_uri: &str,
    ) -> Result<Instance, ActivityError> {
        let no_follow = || ActivityError::NoFollow {
            source_uri: source_uri.to_string(),
            target_uri: target_uri.to_string(),
        };
        let source = self.actor(source_uri).await.map_err(|_| no_follow())?;
        let target = self.actor(target_uri).await.map_err(|_| no_follow())?;
        self.find(follow_id(source.id, target.id))
            .await?
            .ok_or_else(no_follow)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flock_stator::MemoryStore;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{ActivitiesConfig, Directory, RecordingDelivery};

    fn context() -> Context {
        Context::new(
            Arc::new(Directory::new()),
            Arc::new(RecordingDelivery::new()),
            Arc::new(MemoryStore::new()),
            ActivitiesConfig::default(),
        )
    }

    #[test]
    fn test_graph_shape() {
        let graph = graph(&context()).unwrap();
        assert_eq!(graph.initial_state().name(), "unrequested");
        assert!(graph.is_legal_transition("unrequested", "accepted"));
        assert!(graph.is_legal_transition("accepted", "undone_locally"));
        assert!(!graph.is_legal_transition("accepted", "unrequested"));
        assert!(graph.state("accepted").unwrap().is_externally_progressed());
        assert!(graph.state("undone_remotely").unwrap().is_terminal());
    }

    #[test]
    fn test_follow_id_is_directional() {
        let (a, b) = (IdentityId::new(), IdentityId::new());
        assert_eq!(follow_id(a, b), follow_id(a, b));
        assert_ne!(follow_id(a, b), follow_id(b, a));
    }

    #[test]
    fn test_activity_shapes() {
        let source = Identity::local("alice", "https://flock.test");
        let target = Identity::remote("bob", "https://remote.test/u/bob", "https://remote.test/inbox");
        let data = FollowData {
            source: source.id,
            target: target.id,
            uri: "https://flock.test/@alice/follow/1/".to_string(),
        };

        let follow = data.to_ap(&source, &target);
        assert_eq!(follow["type"], "Follow");
        assert_eq!(follow["actor"], "https://flock.test/@alice/");
        assert_eq!(follow["object"], "https://remote.test/u/bob");

        let accept = data.to_accept_ap(&source, &target);
        assert_eq!(accept["id"], "https://flock.test/@alice/follow/1/#accept");
        assert_eq!(accept["actor"], "https://remote.test/u/bob");
        assert_eq!(accept["object"], follow);

        let undo = data.to_undo_ap(&source, &target);
        assert_eq!(undo["id"], "https://flock.test/@alice/follow/1/#undo");
        assert_eq!(undo["actor"], "https://flock.test/@alice/");
    }

    #[tokio::test]
    async fn test_followers_skip_undone_and_other_targets() {
        let ctx = context();
        let federation = Federation::new(ctx.clone()).unwrap();
        let star = ctx
            .directory
            .add_identity(Identity::local("star", "https://flock.test"))
            .await;
        let mut fans = Vec::new();
        for name in ["a", "b", "c"] {
            let fan = ctx
                .directory
                .add_identity(Identity::local(name, "https://flock.test"))
                .await;
            federation.follow(fan, star).await.unwrap();
            fans.push(fan);
        }
        federation.unfollow(fans[2], star).await.unwrap();
        federation.follow(star, fans[0]).await.unwrap();

        let mut expected = fans[..2].to_vec();
        expected.sort();
        assert_eq!(followers(ctx.store.as_ref(), star).await.unwrap(), expected);
    }
}
