//! In-process store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{Change, Claim, Commit, CommitGuard, DueQuery, StatorStore};
use crate::{Instance, InstanceId, Lease, RetryPolicy, StateGraph, StoreError};

/// A [`StatorStore`] holding every instance in memory.
///
/// Claims and commits run under one write lock, which gives them the same
/// atomicity a transactional backend provides.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<InstanceId, Instance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `instances`.
    pub fn with_instances(instances: impl IntoIterator<Item = Instance>) -> Self {
        Self {
            instances: RwLock::new(instances.into_iter().map(|i| (i.id, i)).collect()),
        }
    }

    /// Snapshot of every instance, in no particular order.
    pub async fn snapshot(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }
}

fn is_due_in(instance: &Instance, graph: &StateGraph, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
    instance.graph == graph.name()
        && graph
            .state(&instance.state)
            .is_some_and(|node| instance.is_due(node, policy, now))
}

#[async_trait]
impl StatorStore for MemoryStore {
    async fn insert(&self, instance: Instance) -> Result<bool, StoreError> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Ok(false);
        }
        instances.insert(instance.id, instance);
        Ok(true)
    }

    async fn get(&self, id: InstanceId) -> Result<Option<Instance>, StoreError> {
        Ok(self.instances.read().await.get(&id).cloned())
    }

    async fn list(&self, graph: &str) -> Result<Vec<Instance>, StoreError> {
        let instances = self.instances.read().await;
        let mut found: Vec<Instance> = instances
            .values()
            .filter(|i| i.graph == graph)
            .cloned()
            .collect();
        found.sort_by_key(|i| (i.created_at, i.id));
        Ok(found)
    }

    async fn delete(&self, id: InstanceId) -> Result<bool, StoreError> {
        Ok(self.instances.write().await.remove(&id).is_some())
    }

    async fn claim_due(&self, query: &DueQuery<'_>) -> Result<Vec<Claim>, StoreError> {
        let mut instances = self.instances.write().await;

        // Never-attempted first, then longest-waiting
        let mut due: Vec<(Option<DateTime<Utc>>, DateTime<Utc>, InstanceId)> = instances
            .values()
            .filter(|i| is_due_in(i, query.graph, query.policy, query.now))
            .map(|i| (i.state_attempted_at, i.state_changed_at, i.id))
            .collect();
        due.sort();
        due.truncate(query.limit);

        let mut claims = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(instance) = instances.get_mut(&id) {
                let token = Uuid::new_v4();
                instance.lease = Some(Lease {
                    token,
                    until: Some(query.now + query.lease),
                });
                instance.state_attempted_at = Some(query.now);
                claims.push(Claim {
                    instance: instance.clone(),
                    token,
                });
            }
        }
        Ok(claims)
    }

    async fn count_due(
        &self,
        graph: &StateGraph,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| is_due_in(i, graph, policy, now))
            .count())
    }

    async fn commit(&self, commit: Commit) -> Result<Instance, StoreError> {
        let mut instances = self.instances.write().await;

        let instance = instances
            .get_mut(&commit.id)
            .ok_or(StoreError::NotFound(commit.id))?;

        if instance.state != commit.expected_state {
            return Err(StoreError::StateConflict {
                id: commit.id,
                expected: commit.expected_state,
                actual: instance.state.clone(),
            });
        }
        if let CommitGuard::Lease(token) = commit.guard {
            if instance.lease.map(|l| l.token) != Some(token) {
                return Err(StoreError::StaleClaim(commit.id));
            }
        }

        match commit.change {
            Change::Transition {
                to,
                at,
                attempted_at,
                data,
            } => {
                instance.state = to;
                instance.state_changed_at = at;
                instance.state_attempted_at = attempted_at;
                instance.state_attempts = 0;
                if let Some(data) = data {
                    instance.data = data;
                }
            }
            Change::Attempted { at } => {
                instance.state_attempted_at = Some(at);
                instance.state_attempts = instance.state_attempts.saturating_add(1);
            }
        }
        instance.lease = None;
        let updated = instance.clone();

        for spawned in commit.spawn {
            instances.entry(spawned.id).or_insert(spawned);
        }

        Ok(updated)
    }

    async fn clean_locks(&self, graph: &str, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut instances = self.instances.write().await;
        let mut released = 0;
        for instance in instances.values_mut().filter(|i| i.graph == graph) {
            // The token stays so a slow holder can still commit
            if let Some(lease) = instance
                .lease
                .as_mut()
                .filter(|l| l.until.is_some_and(|until| until <= now))
            {
                lease.until = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn clear_attempted(&self, id: InstanceId) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        let instance = instances.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        instance.state_attempted_at = None;
        Ok(())
    }
}
