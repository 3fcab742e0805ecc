//! Delivery of one post or interaction change to one recipient.

use chrono::Utc;
use flock_stator::{
    GraphBuilder, GraphError, HandlerError, Instance, InstanceId, NewInstance, Outcome, StateDef,
    StateGraph, StateKind,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{Handled, bind};
use crate::post::resolve_note;
use crate::{
    Context, Identity, IdentityId, InteractionData, InteractionKind, Post, PostId, TimelineEvent,
    TimelineEventKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FanOutState {
    New,
    Sent,
    /// Gave up after retrying for the configured timeout.
    Failed,
}

impl StateKind for FanOutState {
    const GRAPH: &'static str = "fan_out";

    fn name(self) -> &'static str {
        match self {
            FanOutState::New => "new",
            FanOutState::Sent => "sent",
            FanOutState::Failed => "failed",
        }
    }

    fn all() -> &'static [Self] {
        &[FanOutState::New, FanOutState::Sent, FanOutState::Failed]
    }
}

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutKind {
    Post,
    PostEdited,
    PostDeleted,
    Interaction,
    UndoInteraction,
}

impl FanOutKind {
    fn as_str(self) -> &'static str {
        match self {
            FanOutKind::Post => "post",
            FanOutKind::PostEdited => "post_edited",
            FanOutKind::PostDeleted => "post_deleted",
            FanOutKind::Interaction => "interaction",
            FanOutKind::UndoInteraction => "undo_interaction",
        }
    }
}

/// Payload of a fan-out instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutData {
    pub kind: FanOutKind,
    /// Recipient.
    pub identity: IdentityId,
    pub post: PostId,
    /// The interaction instance, for interaction fan-outs.
    #[serde(default)]
    pub interaction: Option<InstanceId>,
}

/// A fan-out record spawned by `source`'s current state.
///
/// The id is derived from the source, the moment it entered its state and
/// the recipient, so a retried handler re-creates the same records while a
/// later edit of the same post produces new ones.
pub(crate) fn record(source: &Instance, data: &FanOutData) -> Result<NewInstance, HandlerError> {
    let key = format!(
        "{}:{}:{}:{}:{}",
        source.id,
        source.state,
        source.state_changed_at.timestamp_micros(),
        data.kind.as_str(),
        data.identity
    );
    Ok(NewInstance::derived(
        FanOutState::GRAPH,
        &key,
        serde_json::to_value(data)?,
    ))
}

pub(crate) fn graph(ctx: &Context) -> Result<StateGraph, GraphError> {
    GraphBuilder::<FanOutState>::new()
        .state(FanOutState::New, StateDef::try_every(600))
        .state(FanOutState::Sent, StateDef::terminal())
        .state(FanOutState::Failed, StateDef::terminal())
        .transition(FanOutState::New, FanOutState::Sent)
        .times_out_to(
            FanOutState::New,
            FanOutState::Failed,
            ctx.config.fan_out_timeout_secs,
        )
        .handler(FanOutState::New, bind(ctx, handle_new))
        .build()
}

/// Apply the change locally or deliver it to the remote recipient.
async fn handle_new(ctx: Context, instance: Instance) -> Handled<FanOutState> {
    let fan_out: FanOutData = instance.data_as()?;
    let Some(recipient) = ctx.directory.identity(fan_out.identity).await else {
        debug!(instance = %instance.id, "fan-out recipient unknown");
        return Ok(Outcome::Stay);
    };
    let Some(post) = ctx.directory.post(fan_out.post).await else {
        debug!(instance = %instance.id, "fan-out post unknown");
        return Ok(Outcome::Stay);
    };

    match fan_out.kind {
        FanOutKind::Post | FanOutKind::PostEdited if post.deleted => {
            debug!(instance = %instance.id, "post deleted before fan-out");
        }
        FanOutKind::Post | FanOutKind::PostEdited | FanOutKind::PostDeleted => {
            deliver_post(&ctx, fan_out.kind, &recipient, &post).await?
        }
        FanOutKind::Interaction | FanOutKind::UndoInteraction => {
            let Some(interaction_id) = fan_out.interaction else {
                return Err(HandlerError::Delivery(
                    "interaction fan-out without interaction".to_string(),
                ));
            };
            let Some(interaction) = ctx.store.get(interaction_id).await? else {
                debug!(instance = %instance.id, "fan-out interaction gone");
                return Ok(Outcome::to(FanOutState::Sent));
            };
            let interaction: InteractionData = interaction.data_as()?;
            let undo = fan_out.kind == FanOutKind::UndoInteraction;
            deliver_interaction(&ctx, undo, &recipient, &interaction, &post).await?
        }
    }
    Ok(Outcome::to(FanOutState::Sent))
}

async fn deliver_post(
    ctx: &Context,
    kind: FanOutKind,
    recipient: &Identity,
    post: &Post,
) -> Result<(), HandlerError> {
    if recipient.local {
        match kind {
            FanOutKind::Post => {
                add_post_events(ctx, recipient.id, post).await;
            }
            FanOutKind::PostDeleted => {
                ctx.directory
                    .remove_timeline_events(recipient.id, Some(post.id), None, None)
                    .await;
            }
            // Timelines read the current content
            _ => {}
        }
        return Ok(());
    }

    // Remote copies of remote posts are their origin server's business
    let Some(author) = ctx.directory.identity(post.author).await.filter(|a| a.local) else {
        return Ok(());
    };
    let activity = match kind {
        FanOutKind::Post => post.to_create_ap(&author, resolve_note(ctx, post, &author).await),
        FanOutKind::PostEdited => post.to_update_ap(&author, resolve_note(ctx, post, &author).await),
        _ => post.to_delete_ap(&author),
    };
    ctx.delivery
        .deliver(&author, &recipient.inbox_uri, &activity)
        .await?;
    Ok(())
}

async fn deliver_interaction(
    ctx: &Context,
    undo: bool,
    recipient: &Identity,
    interaction: &InteractionData,
    post: &Post,
) -> Result<(), HandlerError> {
    if recipient.local {
        if undo {
            remove_interaction_events(ctx, recipient.id, interaction).await;
        } else {
            add_interaction_event(ctx, recipient.id, interaction, post).await;
        }
        return Ok(());
    }

    let Some(actor) = ctx
        .directory
        .identity(interaction.identity)
        .await
        .filter(|a| a.local)
    else {
        return Ok(());
    };
    let activity = if undo {
        interaction.to_undo_ap(&actor, post)
    } else {
        interaction.to_ap(&actor, post)
    };
    ctx.delivery
        .deliver(&actor, &recipient.inbox_uri, &activity)
        .await?;
    Ok(())
}

/// Put a post in a local timeline, plus a mention notification if it
/// mentions the owner.
pub(crate) async fn add_post_events(ctx: &Context, identity: IdentityId, post: &Post) {
    let at = post.created_at;
    if post.mentions.contains(&identity) {
        ctx.directory
            .add_timeline_event(TimelineEvent {
                identity,
                kind: TimelineEventKind::Mentioned,
                post: Some(post.id),
                subject_identity: Some(post.author),
                created_at: at,
            })
            .await;
    }
    ctx.directory
        .add_timeline_event(TimelineEvent {
            identity,
            kind: TimelineEventKind::Post,
            post: Some(post.id),
            subject_identity: None,
            created_at: at,
        })
        .await;
}

/// Show an interaction to a local identity: a like notification, a boost
/// notification if they wrote the post, or a boost in their timeline.
pub(crate) async fn add_interaction_event(
    ctx: &Context,
    identity: IdentityId,
    interaction: &InteractionData,
    post: &Post,
) {
    let kind = match interaction.kind {
        InteractionKind::Like => TimelineEventKind::Liked,
        InteractionKind::Boost if post.author == identity => TimelineEventKind::Boosted,
        InteractionKind::Boost => TimelineEventKind::Boost,
    };
    ctx.directory
        .add_timeline_event(TimelineEvent {
            identity,
            kind,
            post: Some(post.id),
            subject_identity: Some(interaction.identity),
            created_at: Utc::now(),
        })
        .await;
}

pub(crate) async fn remove_interaction_events(
    ctx: &Context,
    identity: IdentityId,
    interaction: &InteractionData,
) {
    let kinds: &[TimelineEventKind] = match interaction.kind {
        InteractionKind::Like => &[TimelineEventKind::Liked],
        InteractionKind::Boost => &[TimelineEventKind::Boost, TimelineEventKind::Boosted],
    };
    for kind in kinds {
        ctx.directory
            .remove_timeline_events(
                identity,
                Some(interaction.post),
                Some(*kind),
                Some(interaction.identity),
            )
            .await;
    }
}
