//! State machine instances.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{HandlerError, RetryPolicy, StateNode};

/// Identifier of a state machine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Namespace for ids derived from a natural key.
    const NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c0e_57d4_4b8e_9f21_0c4d_7e93_a5b2);

    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// A deterministic id for a derived record, so re-creating the same
    /// record twice resolves to the same row.
    pub fn derived(graph: &str, key: &str) -> Self {
        Self(Uuid::new_v5(
            &Self::NAMESPACE,
            format!("{}:{}", graph, key).as_bytes(),
        ))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A claim lease on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Token identifying this particular claim.
    pub token: Uuid,
    /// When the lease lapses. `None` once housekeeping has released it; the
    /// holder can still commit until another claim replaces the token.
    pub until: Option<DateTime<Utc>>,
}

/// One persisted entity progressing through a state graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Name of the graph this instance belongs to.
    pub graph: String,
    /// Current state name.
    pub state: String,
    /// Entity payload.
    pub data: serde_json::Value,
    /// When the state last changed (or the instance was created).
    pub state_changed_at: DateTime<Utc>,
    /// When the current state was last attempted.
    pub state_attempted_at: Option<DateTime<Utc>>,
    /// Attempts since entering the current state.
    pub state_attempts: u32,
    /// Claim currently held on this instance, if any.
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    /// Time spent in the current state.
    pub fn state_age(&self) -> Duration {
        self.state_age_at(Utc::now())
    }

    /// Time spent in the current state as of `now`.
    pub fn state_age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.state_changed_at
    }

    /// Decode the payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Whether a claim is held at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lease
            .is_some_and(|lease| lease.until.is_some_and(|until| until > now))
    }

    /// Whether the scheduler should attempt this instance at `now`.
    ///
    /// `node` must be the node of the instance's current state.
    pub fn is_due(&self, node: &StateNode, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        if !node.is_automatic() || self.is_locked_at(now) {
            return false;
        }
        let Some(base) = node.try_interval() else {
            return false;
        };
        match self.state_attempted_at {
            None => true,
            Some(attempted) => now - attempted >= policy.interval_for(base, self.state_attempts),
        }
    }
}

/// A record to create, in its graph's initial state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    pub id: InstanceId,
    pub graph: String,
    pub data: serde_json::Value,
}

impl NewInstance {
    /// A new record with a random id.
    pub fn new(graph: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: InstanceId::new(),
            graph: graph.into(),
            data,
        }
    }

    /// A new record whose id is derived from `key`; creating it twice is a no-op.
    pub fn derived(graph: impl Into<String>, key: &str, data: serde_json::Value) -> Self {
        let graph = graph.into();
        Self {
            id: InstanceId::derived(&graph, key),
            graph,
            data,
        }
    }
}
