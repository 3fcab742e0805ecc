//! Error types for the stator.

use thiserror::Error;

use crate::InstanceId;

/// Errors raised while building or registering a state graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A state was declared twice.
    #[error("graph {graph}: state {state} declared more than once")]
    DuplicateState {
        graph: &'static str,
        state: &'static str,
    },

    /// A transition, timeout or handler references a state the graph never declared.
    #[error("graph {graph}: state {state} is referenced but not declared")]
    UndeclaredState {
        graph: &'static str,
        state: &'static str,
    },

    /// More than one state claims to be the initial state.
    #[error("graph {graph} has more than one initial state: {first} and {second}")]
    MultipleInitialStates {
        graph: &'static str,
        first: &'static str,
        second: &'static str,
    },

    /// No state could be picked as the initial state.
    #[error("graph {graph} has no initial state")]
    NoInitialState { graph: &'static str },

    /// A terminal state (no outgoing edges) was given a handler.
    #[error("graph {graph}: terminal state {state} must not have a handler")]
    TerminalWithHandler {
        graph: &'static str,
        state: &'static str,
    },

    /// An automatic state has no try interval.
    #[error("graph {graph}: state {state} has no try_interval and is not terminal or externally progressed")]
    MissingInterval {
        graph: &'static str,
        state: &'static str,
    },

    /// An automatic state has no handler.
    #[error("graph {graph}: state {state} has no handler")]
    MissingHandler {
        graph: &'static str,
        state: &'static str,
    },

    /// A state declared a second timeout edge.
    #[error("graph {graph}: state {state} already has a timeout")]
    DuplicateTimeout {
        graph: &'static str,
        state: &'static str,
    },

    /// A graph with the same name is already registered.
    #[error("graph {0} is already registered")]
    AlreadyRegistered(&'static str),
}

/// Errors reported by a [`StatorStore`](crate::StatorStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The instance does not exist (or was deleted concurrently).
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    /// The instance moved to another state since it was read.
    #[error("instance {id} is in state {actual}, expected {expected}")]
    StateConflict {
        id: InstanceId,
        expected: String,
        actual: String,
    },

    /// The claim used for this commit is no longer held.
    #[error("claim on instance {0} is no longer held")]
    StaleClaim(InstanceId),

    /// An instance with this id already exists.
    #[error("instance already exists: {0}")]
    AlreadyExists(InstanceId),

    /// Backend failure (connection, serialization, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors a state handler may return.
///
/// Every variant is treated as "no transition this attempt": the scheduler
/// logs it, bumps the attempt counter and retries on the normal cadence.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Not ready yet; retry later without logging a failure.
    #[error("try again later")]
    TryAgainLater,

    /// Network delivery failed.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The instance payload could not be decoded.
    #[error("invalid instance payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Store access from inside the handler failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Any other transient failure.
    #[error("{0}")]
    Transient(String),
}

/// Errors that can occur in stator operations.
#[derive(Debug, Error)]
pub enum StatorError {
    /// Graph validation error.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Storage error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No graph is registered under this name.
    #[error("no graph registered for {0}")]
    UnregisteredGraph(String),

    /// The state is not part of the graph.
    #[error("graph {graph} has no state {state}")]
    UnknownState { graph: String, state: String },

    /// A transition with no declared edge was requested.
    #[error("cannot transition {graph} from {from} to {to}: not a declared transition")]
    IllegalTransition {
        graph: String,
        from: String,
        to: String,
    },

    /// Instance not found.
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// An attempt task panicked.
    #[error("attempt panicked: {0}")]
    AttemptPanicked(String),

    /// Liveness file could not be written.
    #[error("liveness file error: {0}")]
    Liveness(#[from] std::io::Error),
}

impl StatorError {
    /// Whether this error points at a graph or handler defect rather than a
    /// runtime condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StatorError::IllegalTransition { .. }
                | StatorError::UnknownState { .. }
                | StatorError::UnregisteredGraph(_)
                | StatorError::AttemptPanicked(_)
        )
    }
}
