//! Persistence seam for state machine instances.
//!
//! The scheduler never mutates instances directly. Every change goes through
//! a [`StatorStore`], which must apply each [`Commit`] atomically and refuse
//! it when the instance moved on or the claim lapsed. A relational backend
//! maps `claim_due` onto `SELECT ... FOR UPDATE SKIP LOCKED` and `commit`
//! onto a conditional `UPDATE` plus inserts in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{Instance, InstanceId, RetryPolicy, StateGraph, StoreError};

/// Which instances to claim.
#[derive(Debug, Clone, Copy)]
pub struct DueQuery<'a> {
    pub graph: &'a StateGraph,
    pub policy: &'a RetryPolicy,
    pub now: DateTime<Utc>,
    /// Maximum number of instances to claim.
    pub limit: usize,
    /// How long the claim is held before another runner may take it.
    pub lease: Duration,
}

/// An instance claimed for one attempt.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Snapshot of the instance at claim time.
    pub instance: Instance,
    /// Token that must be presented when committing the attempt.
    pub token: Uuid,
}

/// How a commit proves it may touch the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitGuard {
    /// The committer holds this claim.
    Lease(Uuid),
    /// A forced transition from outside the scheduler; only the state check applies.
    Forced,
}

/// The mutation to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Move to another state.
    Transition {
        to: String,
        at: DateTime<Utc>,
        /// `None` makes the new state due immediately.
        attempted_at: Option<DateTime<Utc>>,
        /// Replacement payload, if any.
        data: Option<serde_json::Value>,
    },
    /// Record an attempt that did not move the instance.
    Attempted { at: DateTime<Utc> },
}

/// One atomic write against an instance.
#[derive(Debug, Clone)]
pub struct Commit {
    pub id: InstanceId,
    /// State the instance must still be in.
    pub expected_state: String,
    pub guard: CommitGuard,
    pub change: Change,
    /// Records to insert alongside; ids that already exist are left alone.
    pub spawn: Vec<Instance>,
}

/// Storage backend for instances.
#[async_trait]
pub trait StatorStore: Send + Sync {
    /// Insert a new instance. Returns `false` if the id already exists.
    async fn insert(&self, instance: Instance) -> Result<bool, StoreError>;

    async fn get(&self, id: InstanceId) -> Result<Option<Instance>, StoreError>;

    /// Every instance of a graph.
    async fn list(&self, graph: &str) -> Result<Vec<Instance>, StoreError>;

    /// Remove an instance. Returns `false` if it did not exist.
    async fn delete(&self, id: InstanceId) -> Result<bool, StoreError>;

    /// Atomically pick up to `query.limit` due instances of the graph, lease
    /// them and stamp `state_attempted_at = now`.
    ///
    /// Instances leased by someone else are skipped, never waited on.
    async fn claim_due(&self, query: &DueQuery<'_>) -> Result<Vec<Claim>, StoreError>;

    /// Number of instances of the graph that are due at `now`.
    async fn count_due(
        &self,
        graph: &StateGraph,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Apply a commit atomically and return the updated instance.
    ///
    /// Fails with [`StoreError::StateConflict`] if the instance is no longer
    /// in `expected_state`, and with [`StoreError::StaleClaim`] if the lease
    /// token does not match the one held. A lease released by
    /// [`clean_locks`](Self::clean_locks) still matches until it is
    /// re-claimed.
    async fn commit(&self, commit: Commit) -> Result<Instance, StoreError>;

    /// Release leases on the graph that expired before `now`, keeping their
    /// tokens. Returns how many were released.
    async fn clean_locks(&self, graph: &str, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Make an instance due on the next pass.
    async fn clear_attempted(&self, id: InstanceId) -> Result<(), StoreError>;
}
