//! Instance lifecycle operations.
//!
//! [`Stator`] ties a registry of graphs to a store. It creates instances,
//! performs forced transitions for code outside the scheduler, and runs single
//! claimed attempts on behalf of the [`Runner`](crate::Runner). Both paths
//! write through [`StatorStore::commit`], so a forced transition racing an
//! attempt is detected instead of silently overwritten.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::store::{Change, Claim, Commit, CommitGuard, StatorStore};
use crate::{
    GraphRegistry, HandlerError, Instance, InstanceId, NewInstance, Outcome, RetryPolicy,
    StateGraph, StateKind, StateNode, StatorError, StoreError, Transition,
};

/// What a single attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The handler moved the instance.
    Transitioned { from: String, to: &'static str },
    /// The handler did not move the instance, but its state's timeout did.
    TimedOut { to: &'static str },
    /// Nothing moved; the attempt was recorded.
    NoTransition { attempts: u32 },
    /// The claimed state has nothing to run.
    Skipped,
    /// The claim was lost before the result could be committed.
    Stale,
}

/// Graph registry plus instance store.
#[derive(Clone)]
pub struct Stator {
    registry: Arc<GraphRegistry>,
    store: Arc<dyn StatorStore>,
    policy: RetryPolicy,
}

impl Stator {
    pub fn new(registry: GraphRegistry, store: Arc<dyn StatorStore>) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            policy: RetryPolicy::default(),
        }
    }

    /// Use `policy` to space out retries.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &GraphRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StatorStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The registered graph called `name`.
    pub fn graph(&self, name: &str) -> Result<&Arc<StateGraph>, StatorError> {
        self.registry
            .get(name)
            .ok_or_else(|| StatorError::UnregisteredGraph(name.to_string()))
    }

    fn node<'g>(graph: &'g StateGraph, state: &str) -> Result<&'g StateNode, StatorError> {
        graph.state(state).ok_or_else(|| StatorError::UnknownState {
            graph: graph.name().to_string(),
            state: state.to_string(),
        })
    }

    /// Build the row for a record entering `node`.
    fn row(new: NewInstance, node: &StateNode, now: DateTime<Utc>) -> Instance {
        Instance {
            id: new.id,
            graph: new.graph,
            state: node.name().to_string(),
            data: new.data,
            state_changed_at: now,
            state_attempted_at: if node.attempt_immediately() {
                None
            } else {
                Some(now)
            },
            state_attempts: 0,
            lease: None,
            created_at: now,
        }
    }

    fn initial_row(&self, new: NewInstance, now: DateTime<Utc>) -> Result<Instance, StatorError> {
        let graph = self.graph(&new.graph)?;
        Ok(Self::row(new, graph.initial_state(), now))
    }

    pub async fn get(&self, id: InstanceId) -> Result<Instance, StatorError> {
        self.store
            .get(id)
            .await?
            .ok_or(StatorError::InstanceNotFound(id))
    }

    /// Every instance of a graph.
    pub async fn list(&self, graph: &str) -> Result<Vec<Instance>, StatorError> {
        Ok(self.store.list(graph).await?)
    }

    /// Create a new instance of `S`'s graph with a random id, in the initial state.
    pub async fn create<S: StateKind>(
        &self,
        data: serde_json::Value,
    ) -> Result<Instance, StatorError> {
        self.insert(NewInstance::new(S::GRAPH, data)).await
    }

    /// Create `new` in its graph's initial state. Fails if the id is taken.
    #[tracing::instrument(skip(self, new), fields(graph = %new.graph, instance = %new.id))]
    pub async fn insert(&self, new: NewInstance) -> Result<Instance, StatorError> {
        let row = self.initial_row(new, Utc::now())?;
        if !self.store.insert(row.clone()).await? {
            return Err(StoreError::AlreadyExists(row.id).into());
        }
        debug!(state = %row.state, "created instance");
        Ok(row)
    }

    /// Create `new` in its initial state unless the id already exists.
    /// Returns whether a record was created.
    pub async fn ensure(&self, new: NewInstance) -> Result<bool, StatorError> {
        let row = self.initial_row(new, Utc::now())?;
        Ok(self.store.insert(row).await?)
    }

    /// Create `new` directly in `target`.
    ///
    /// `target` must be the initial state or one legal step from it; this is
    /// the creation-time counterpart of [`transition_perform`](Self::transition_perform)
    /// for records whose first step already happened elsewhere.
    #[tracing::instrument(skip(self, new, target), fields(graph = %new.graph, instance = %new.id, target = target.name()))]
    pub async fn create_forced<S: StateKind>(
        &self,
        new: NewInstance,
        target: S,
    ) -> Result<Instance, StatorError> {
        let graph = self.graph(S::GRAPH)?;
        let initial = graph.initial_state().name();
        let to = target.name();
        if to != initial && !graph.is_legal_transition(initial, to) {
            error!(from = initial, to, "illegal forced creation");
            return Err(StatorError::IllegalTransition {
                graph: graph.name().to_string(),
                from: initial.to_string(),
                to: to.to_string(),
            });
        }
        let node = Self::node(graph, to)?;
        let new = NewInstance {
            graph: S::GRAPH.to_string(),
            ..new
        };
        let row = Self::row(new, node, Utc::now());
        if !self.store.insert(row.clone()).await? {
            return Err(StoreError::AlreadyExists(row.id).into());
        }
        debug!(state = to, "created instance in forced state");
        Ok(row)
    }

    /// Force an instance into `target`, bypassing discovery but not legality.
    pub async fn transition_perform<S: StateKind>(
        &self,
        id: InstanceId,
        target: S,
    ) -> Result<Instance, StatorError> {
        self.transition_perform_with(id, Transition::to(target))
            .await
    }

    /// [`transition_perform`](Self::transition_perform) with a payload update
    /// and derived records committed alongside.
    pub async fn transition_perform_with<S: StateKind>(
        &self,
        id: InstanceId,
        transition: Transition<S>,
    ) -> Result<Instance, StatorError> {
        let instance = self.get(id).await?;
        if instance.graph != S::GRAPH {
            return Err(StatorError::UnknownState {
                graph: instance.graph,
                state: transition.to.name().to_string(),
            });
        }
        self.force(instance, transition.map(S::name)).await
    }

    /// Forced transition by state name, for callers without the state enum.
    pub async fn transition_perform_named(
        &self,
        id: InstanceId,
        target: &str,
    ) -> Result<Instance, StatorError> {
        let instance = self.get(id).await?;
        let graph = self.graph(&instance.graph)?;
        let to = Self::node(graph, target)?.name();
        self.force(instance, Transition::to(to)).await
    }

    #[tracing::instrument(skip(self, instance, transition), fields(graph = %instance.graph, instance = %instance.id, from = %instance.state, to = transition.to))]
    async fn force(
        &self,
        instance: Instance,
        transition: Transition<&'static str>,
    ) -> Result<Instance, StatorError> {
        let graph = self.graph(&instance.graph)?;
        let updated = self
            .commit_transition(graph, &instance, transition, CommitGuard::Forced, Utc::now())
            .await?;
        info!("forced transition");
        Ok(updated)
    }

    /// Make an instance due on the next scheduler pass.
    pub async fn schedule_now(&self, id: InstanceId) -> Result<(), StatorError> {
        match self.store.clear_attempted(id).await {
            Err(StoreError::NotFound(id)) => Err(StatorError::InstanceNotFound(id)),
            other => Ok(other?),
        }
    }

    /// Delete an instance. Returns whether it existed.
    pub async fn delete(&self, id: InstanceId) -> Result<bool, StatorError> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            debug!(instance = %id, "deleted instance");
        }
        Ok(deleted)
    }

    /// Validate and commit `transition` out of `instance`'s current state.
    async fn commit_transition(
        &self,
        graph: &StateGraph,
        instance: &Instance,
        transition: Transition<&'static str>,
        guard: CommitGuard,
        now: DateTime<Utc>,
    ) -> Result<Instance, StatorError> {
        let to = transition.to;
        if !graph.is_legal_transition(&instance.state, to) {
            error!(
                graph = graph.name(),
                instance = %instance.id,
                from = %instance.state,
                to,
                "illegal transition"
            );
            return Err(StatorError::IllegalTransition {
                graph: graph.name().to_string(),
                from: instance.state.clone(),
                to: to.to_string(),
            });
        }
        let target = Self::node(graph, to)?;

        let spawn = transition
            .spawn
            .into_iter()
            .map(|new| self.initial_row(new, now))
            .collect::<Result<Vec<_>, _>>()?;

        let updated = self
            .store
            .commit(Commit {
                id: instance.id,
                expected_state: instance.state.clone(),
                guard,
                change: Change::Transition {
                    to: to.to_string(),
                    at: now,
                    attempted_at: if target.attempt_immediately() {
                        None
                    } else {
                        Some(now)
                    },
                    data: transition.data,
                },
                spawn,
            })
            .await?;
        Ok(updated)
    }

    /// Run the handler for a claimed instance and commit what it decided.
    ///
    /// Handler errors count as "no transition". An illegal target is returned
    /// as [`StatorError::IllegalTransition`] without touching the instance.
    #[tracing::instrument(skip(self, claim), fields(graph = %claim.instance.graph, instance = %claim.instance.id, state = %claim.instance.state))]
    pub async fn attempt(&self, claim: Claim) -> Result<AttemptOutcome, StatorError> {
        let Claim { instance, token } = claim;
        let graph = self.graph(&instance.graph)?;
        let node = Self::node(graph, &instance.state)?;

        let handler = match node.handler() {
            Some(handler) if node.is_automatic() => handler,
            _ => {
                debug!("claimed state has no automatic handler");
                return Ok(AttemptOutcome::Skipped);
            }
        };

        let outcome = match handler.handle(&instance).await {
            Ok(outcome) => outcome,
            Err(HandlerError::TryAgainLater) => {
                debug!("handler asked to try again later");
                Outcome::Stay
            }
            Err(e) => {
                warn!(error = %e, attempts = instance.state_attempts, "handler failed");
                Outcome::Stay
            }
        };

        let now = Utc::now();
        let guard = CommitGuard::Lease(token);
        let result = match outcome {
            Outcome::Transition(transition) => {
                let to = transition.to;
                self.commit_transition(graph, &instance, transition, guard, now)
                    .await
                    .map(|_| AttemptOutcome::Transitioned {
                        from: instance.state.clone(),
                        to,
                    })
            }
            Outcome::Stay => match node.timeout() {
                Some((to, after)) if instance.state_age_at(now) >= after => {
                    debug!(to, "state timed out");
                    self.commit_transition(graph, &instance, Transition::to(to), guard, now)
                        .await
                        .map(|_| AttemptOutcome::TimedOut { to })
                }
                _ => self
                    .store
                    .commit(Commit {
                        id: instance.id,
                        expected_state: instance.state.clone(),
                        guard,
                        change: Change::Attempted { at: now },
                        spawn: Vec::new(),
                    })
                    .await
                    .map(|updated| AttemptOutcome::NoTransition {
                        attempts: updated.state_attempts,
                    })
                    .map_err(StatorError::from),
            },
        };

        match result {
            Ok(outcome) => {
                debug!(?outcome, "attempt finished");
                Ok(outcome)
            }
            Err(StatorError::Store(
                e @ (StoreError::StaleClaim(_)
                | StoreError::StateConflict { .. }
                | StoreError::NotFound(_)),
            )) => {
                warn!(error = %e, "claim lost before commit, discarding attempt result");
                Ok(AttemptOutcome::Stale)
            }
            Err(e) => Err(e),
        }
    }
}
