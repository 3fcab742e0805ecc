//! Federation state graphs for Flock.
//!
//! Five graphs run on the stator scheduler:
//!
//! - [`FollowState`]: follow requests, acceptance and unfollows
//! - [`InteractionState`]: likes and boosts, and undoing them
//! - [`PostState`]: publishing, editing and deleting posts
//! - [`FanOutState`]: delivering one post or interaction change to one recipient
//! - [`HashtagState`]: keeping per-tag usage statistics fresh
//!
//! [`Federation`] owns the scheduler for these graphs and exposes local
//! actions (follow, like, post) and inbound ActivityPub handling.

mod config;
mod context;
mod delivery;
mod directory;
mod error;
mod fan_out;
mod federation;
mod follow;
mod hashtag;
mod interaction;
mod model;
mod post;

use flock_stator::{GraphError, GraphRegistry};

pub use config::ActivitiesConfig;
pub use context::Context;
pub use delivery::{ACTIVITY_JSON, Delivered, Delivery, HttpDelivery, RecordingDelivery};
pub use directory::{Directory, DirectorySeed};
pub use error::{ActivityError, DeliveryError};
pub use fan_out::{FanOutData, FanOutKind, FanOutState};
pub use federation::Federation;
pub use follow::{FollowData, FollowState, follow_id};
pub use hashtag::{HashtagData, HashtagState, compute_stats, hashtag_id, hashtags_in};
pub use interaction::{InteractionData, InteractionKind, InteractionState, interaction_id};
pub use model::{
    Identity, IdentityId, Post, PostId, TimelineEvent, TimelineEventKind, Visibility,
};
pub use post::{PostData, PostDraft, PostState, post_instance_id};

/// JSON-LD context for outbound activities.
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Addressing URI for public posts.
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Every activity graph, built against `ctx`.
pub fn registry(ctx: &Context) -> Result<GraphRegistry, GraphError> {
    GraphRegistry::new()
        .with(follow::graph(ctx)?)?
        .with(interaction::graph(ctx)?)?
        .with(post::graph(ctx)?)?
        .with(fan_out::graph(ctx)?)?
        .with(hashtag::graph(ctx)?)
}
