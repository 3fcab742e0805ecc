//! Local actions and inbound activity handling.

use std::sync::Arc;

use flock_stator::{GraphError, Instance, InstanceId, RetryPolicy, Stator, StatorError};
use serde_json::Value;
use tracing::debug;

use crate::{ActivityError, Context, Directory, Identity, IdentityId};

/// Entry point for everything that changes federation state outside the
/// scheduler: local users acting, and activities arriving from other servers.
///
/// Graph-specific operations live next to their graphs (`follow`, `like`,
/// `create_post`, ...); this module holds the shared plumbing.
#[derive(Clone)]
pub struct Federation {
    pub(crate) stator: Stator,
    pub(crate) ctx: Context,
}

impl Federation {
    /// Build every activity graph and a scheduler over `ctx.store`.
    pub fn new(ctx: Context) -> Result<Self, GraphError> {
        let registry = crate::registry(&ctx)?;
        Ok(Self {
            stator: Stator::new(registry, ctx.store.clone()),
            ctx,
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.stator = self.stator.with_policy(policy);
        self
    }

    pub fn stator(&self) -> &Stator {
        &self.stator
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.ctx.directory
    }

    /// Handle one inbound activity, dispatching on its `type`.
    #[tracing::instrument(skip_all, fields(kind = activity["type"].as_str(), id = activity["id"].as_str()))]
    pub async fn receive(&self, activity: &Value) -> Result<(), ActivityError> {
        match str_field(activity, "type")? {
            "Follow" => self.receive_follow(activity).await.map(drop),
            "Accept" => self.receive_accept(activity).await.map(drop),
            "Like" | "Announce" => self.receive_interaction(activity).await.map(drop),
            "Create" => self.receive_create(activity).await.map(drop),
            "Update" => self.receive_update(activity).await.map(drop),
            "Delete" => self.receive_delete(activity).await.map(drop),
            "Undo" => match activity["object"]["type"].as_str() {
                Some("Follow") => self.receive_undo_follow(activity).await.map(drop),
                Some("Like") | Some("Announce") => {
                    self.receive_undo_interaction(activity).await.map(drop)
                }
                other => {
                    debug!(object = ?other, "ignoring undo of unsupported object");
                    Ok(())
                }
            },
            other => {
                debug!(kind = other, "ignoring unsupported activity");
                Ok(())
            }
        }
    }

    pub(crate) async fn identity(&self, id: IdentityId) -> Result<Identity, ActivityError> {
        self.ctx
            .directory
            .identity(id)
            .await
            .ok_or(ActivityError::IdentityNotFound(id))
    }

    pub(crate) async fn local_identity(&self, id: IdentityId) -> Result<Identity, ActivityError> {
        let identity = self.identity(id).await?;
        if !identity.local {
            return Err(ActivityError::NotLocal(id));
        }
        Ok(identity)
    }

    pub(crate) async fn actor(&self, uri: &str) -> Result<Identity, ActivityError> {
        self.ctx
            .directory
            .identity_by_actor_uri(uri)
            .await
            .ok_or_else(|| ActivityError::UnknownActor(uri.to_string()))
    }

    /// The instance with `id`, or `None` if it does not exist.
    pub(crate) async fn find(&self, id: InstanceId) -> Result<Option<Instance>, ActivityError> {
        match self.stator.get(id).await {
            Ok(instance) => Ok(Some(instance)),
            Err(StatorError::InstanceNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A required string field of an activity.
pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str, ActivityError> {
    value[key]
        .as_str()
        .ok_or_else(|| ActivityError::Malformed(format!("missing string field '{}'", key)))
}

/// The URI of an object that may be inlined or referenced by id.
pub(crate) fn object_uri(value: &Value) -> Option<&str> {
    value.as_str().or_else(|| value["id"].as_str())
}
