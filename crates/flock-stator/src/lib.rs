//! State-machine task scheduler for Flock.
//!
//! Long-lived entities (follows, post interactions, posts, fan-out deliveries,
//! hashtags) are modeled as instances of a fixed [`StateGraph`]. The
//! [`Runner`] finds instances whose state is due for an attempt, claims them
//! so no other runner works on the same instance, runs the state's
//! [`StateHandler`] and commits the resulting transition. Code outside the
//! scheduler moves instances with [`Stator::transition_perform`], which obeys
//! the same graph legality rules.

mod error;
mod graph;
mod handler;
mod instance;
mod memory;
mod registry;
mod retry;
mod runner;
mod stator;
mod stats;
pub mod store;

pub use error::{GraphError, HandlerError, StatorError, StoreError};
pub use graph::{GraphBuilder, StateDef, StateGraph, StateKind, StateNode};
pub use handler::{DynHandler, FnHandler, Outcome, StateHandler, Transition, handler_fn};
pub use instance::{Instance, InstanceId, Lease, NewInstance};
pub use memory::MemoryStore;
pub use registry::GraphRegistry;
pub use retry::RetryPolicy;
pub use runner::{AttemptReport, Runner, RunnerConfig};
pub use stator::{AttemptOutcome, Stator};
pub use stats::{GraphStats, Stats};
pub use store::{Change, Claim, Commit, CommitGuard, DueQuery, StatorStore};
