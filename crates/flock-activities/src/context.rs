//! Collaborators shared by every graph handler.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use flock_stator::{
    HandlerError, Instance, Outcome, StateHandler, StateKind, StatorStore, handler_fn,
};

use crate::{ActivitiesConfig, Delivery, Directory, IdentityId};

/// What a handler returns.
pub(crate) type Handled<S> = Result<Outcome<S>, HandlerError>;

/// Everything a handler can reach: the directory, outbound delivery and the
/// instance store (for queries across graphs, such as an identity's followers).
#[derive(Clone)]
pub struct Context {
    pub directory: Arc<Directory>,
    pub delivery: Arc<dyn Delivery>,
    pub store: Arc<dyn StatorStore>,
    pub config: ActivitiesConfig,
}

impl Context {
    pub fn new(
        directory: Arc<Directory>,
        delivery: Arc<dyn Delivery>,
        store: Arc<dyn StatorStore>,
        config: ActivitiesConfig,
    ) -> Self {
        Self {
            directory,
            delivery,
            store,
            config,
        }
    }

    pub(crate) async fn is_local(&self, id: IdentityId) -> bool {
        self.directory.identity(id).await.is_some_and(|i| i.local)
    }

    /// The subset of `ids` hosted here.
    pub(crate) async fn only_local(&self, ids: BTreeSet<IdentityId>) -> BTreeSet<IdentityId> {
        let mut local = BTreeSet::new();
        for id in ids {
            if self.is_local(id).await {
                local.insert(id);
            }
        }
        local
    }
}

/// Bind an `async fn(Context, Instance)` to `ctx` as a state handler.
pub(crate) fn bind<S, Fut>(ctx: &Context, f: fn(Context, Instance) -> Fut) -> impl StateHandler<S>
where
    S: StateKind,
    Fut: Future<Output = Handled<S>> + Send + 'static,
{
    let ctx = ctx.clone();
    handler_fn(move |instance| f(ctx.clone(), instance))
}
