//! The handler contract.
//!
//! A handler runs the side effect implied by its state's name and reports the
//! state that reflects "that side effect is now known to have happened", or
//! [`Outcome::Stay`] when nothing moved this attempt.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{HandlerError, Instance, NewInstance, StateKind};

/// A transition requested by a handler or a forced-transition caller.
///
/// Spawned records and the payload update are committed in the same store
/// transaction as the state change, or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S> {
    pub to: S,
    pub data: Option<serde_json::Value>,
    pub spawn: Vec<NewInstance>,
}

impl<S> Transition<S> {
    pub fn to(state: S) -> Self {
        Self {
            to: state,
            data: None,
            spawn: Vec::new(),
        }
    }

    /// Replace the instance payload as part of the transition.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Create derived records as part of the transition.
    pub fn spawning(mut self, records: impl IntoIterator<Item = NewInstance>) -> Self {
        self.spawn.extend(records);
        self
    }

    pub(crate) fn map<T>(self, f: impl FnOnce(S) -> T) -> Transition<T> {
        Transition {
            to: f(self.to),
            data: self.data,
            spawn: self.spawn,
        }
    }
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<S> {
    /// No transition this attempt.
    Stay,
    /// Commit a transition.
    Transition(Transition<S>),
}

impl<S> Outcome<S> {
    /// Transition to `state` with no payload change or derived records.
    pub fn to(state: S) -> Self {
        Outcome::Transition(Transition::to(state))
    }

    pub(crate) fn map<T>(self, f: impl FnOnce(S) -> T) -> Outcome<T> {
        match self {
            Outcome::Stay => Outcome::Stay,
            Outcome::Transition(t) => Outcome::Transition(t.map(f)),
        }
    }
}

impl<S> From<Transition<S>> for Outcome<S> {
    fn from(transition: Transition<S>) -> Self {
        Outcome::Transition(transition)
    }
}

/// Per-state asynchronous logic.
#[async_trait]
pub trait StateHandler<S: StateKind>: Send + Sync + 'static {
    async fn handle(&self, instance: &Instance) -> Result<Outcome<S>, HandlerError>;
}

/// Adapter turning an async closure into a [`StateHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<S, F, Fut> StateHandler<S> for FnHandler<F>
where
    S: StateKind,
    F: Fn(Instance) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome<S>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, instance: &Instance) -> Result<Outcome<S>, HandlerError> {
        (self.f)(instance.clone()).await
    }
}

/// A handler with its state type erased, as stored in a registered graph.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle(&self, instance: &Instance) -> Result<Outcome<&'static str>, HandlerError>;
}

pub(crate) struct Erased<S: StateKind> {
    inner: Arc<dyn StateHandler<S>>,
    _state: PhantomData<fn() -> S>,
}

impl<S: StateKind> Erased<S> {
    pub(crate) fn new(inner: Arc<dyn StateHandler<S>>) -> Self {
        Self {
            inner,
            _state: PhantomData,
        }
    }
}

#[async_trait]
impl<S: StateKind> DynHandler for Erased<S> {
    async fn handle(&self, instance: &Instance) -> Result<Outcome<&'static str>, HandlerError> {
        let outcome = self.inner.handle(instance).await?;
        Ok(outcome.map(S::name))
    }
}
