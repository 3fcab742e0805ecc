//! Error types for activity handling.

use thiserror::Error;

use flock_stator::{HandlerError, StatorError, StoreError};

use crate::{IdentityId, PostId};

/// Errors from the delivery collaborator.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote inbox refused the activity.
    #[error("inbox {inbox} rejected delivery ({status}): {body}")]
    Rejected {
        inbox: String,
        status: u16,
        body: String,
    },

    /// The remote inbox asked us to slow down.
    #[error("rate limited by {inbox}{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        inbox: String,
        retry_after_secs: Option<u64>,
    },
}

impl From<DeliveryError> for HandlerError {
    fn from(e: DeliveryError) -> Self {
        HandlerError::Delivery(e.to_string())
    }
}

/// Errors from inbound activity processing and local actions.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// Scheduler error.
    #[error(transparent)]
    Stator(#[from] StatorError),

    /// Store error outside a scheduler call.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The activity is missing a field or has the wrong shape.
    #[error("malformed activity: {0}")]
    Malformed(String),

    /// No identity is known for this actor URI.
    #[error("unknown actor: {0}")]
    UnknownActor(String),

    /// No post is known for this object URI.
    #[error("unknown object: {0}")]
    UnknownObject(String),

    #[error("identity not found: {0}")]
    IdentityNotFound(IdentityId),

    #[error("post not found: {0}")]
    PostNotFound(PostId),

    /// The activity's actor does not match the object it refers to.
    #[error("actor {actor} does not match {expected}")]
    ActorMismatch { actor: String, expected: String },

    /// Only local identities can start this action.
    #[error("identity {0} is not local")]
    NotLocal(IdentityId),

    /// There is no follow between the two identities.
    #[error("no follow from {source_uri} to {target_uri}")]
    NoFollow {
        source_uri: String,
        target_uri: String,
    },
}
