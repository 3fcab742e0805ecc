//! Shared harness for federation tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use flock_activities::{
    ActivitiesConfig, Context, Delivery, DeliveryError, Directory, Federation, Identity,
    IdentityId, RecordingDelivery,
};
use flock_stator::{InstanceId, MemoryStore, Runner, RunnerConfig};

pub const BASE: &str = "https://flock.test";

/// A delivery collaborator whose remote inboxes always refuse.
pub struct RefusingDelivery;

#[async_trait]
impl Delivery for RefusingDelivery {
    async fn deliver(
        &self,
        _signer: &Identity,
        inbox: &str,
        _activity: &Value,
    ) -> Result<(), DeliveryError> {
        Err(DeliveryError::Rejected {
            inbox: inbox.to_string(),
            status: 503,
            body: "unavailable".to_string(),
        })
    }
}

pub struct Harness {
    pub federation: Federation,
    pub delivery: Arc<RecordingDelivery>,
    pub runner: Runner,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ActivitiesConfig::default())
    }

    pub fn with_config(config: ActivitiesConfig) -> Self {
        let delivery = Arc::new(RecordingDelivery::new());
        Self::build(delivery.clone(), delivery, config)
    }

    /// A harness whose deliveries go to `sender`; `delivered()` stays empty.
    pub fn with_delivery(sender: Arc<dyn Delivery>, config: ActivitiesConfig) -> Self {
        Self::build(sender, Arc::new(RecordingDelivery::new()), config)
    }

    fn build(
        sender: Arc<dyn Delivery>,
        recorder: Arc<RecordingDelivery>,
        config: ActivitiesConfig,
    ) -> Self {
        let ctx = Context::new(
            Arc::new(Directory::new()),
            sender,
            Arc::new(MemoryStore::new()),
            config,
        );
        let federation = Federation::new(ctx).expect("graphs are valid");
        let runner = Runner::new(
            federation.stator().clone(),
            RunnerConfig {
                concurrency: 200,
                concurrency_per_graph: 200,
                ..RunnerConfig::default()
            },
        );
        Self {
            federation,
            delivery: recorder,
            runner,
        }
    }

    pub async fn local(&self, handle: &str) -> IdentityId {
        self.federation
            .directory()
            .add_identity(Identity::local(handle, BASE))
            .await
    }

    pub async fn remote(&self, handle: &str) -> Identity {
        let identity = Identity::remote(
            handle,
            &format!("https://remote.test/users/{}", handle),
            &format!("https://remote.test/users/{}/inbox", handle),
        );
        self.federation
            .directory()
            .add_identity(identity.clone())
            .await;
        identity
    }

    pub async fn actor_uri(&self, id: IdentityId) -> String {
        self.federation
            .directory()
            .identity(id)
            .await
            .expect("identity exists")
            .actor_uri
    }

    /// Run scheduler passes until one finds nothing due. Returns the number
    /// of attempts made.
    pub async fn settle(&self) -> usize {
        let mut total = 0;
        for _ in 0..20 {
            let reports = self.runner.run_single_cycle().await.expect("cycle succeeds");
            for report in &reports {
                assert!(report.outcome.is_ok(), "attempt failed: {:?}", report);
            }
            if reports.is_empty() {
                return total;
            }
            total += reports.len();
        }
        panic!("scheduler did not settle");
    }

    pub async fn state(&self, id: InstanceId) -> String {
        self.federation
            .stator()
            .get(id)
            .await
            .expect("instance exists")
            .state
    }

    /// States of every instance in `graph`, sorted.
    pub async fn states(&self, graph: &str) -> Vec<String> {
        let mut states: Vec<String> = self
            .federation
            .stator()
            .list(graph)
            .await
            .expect("list succeeds")
            .into_iter()
            .map(|i| i.state)
            .collect();
        states.sort();
        states
    }

    /// Types of recorded deliveries, in order.
    pub async fn delivered_types(&self) -> Vec<String> {
        self.delivery
            .delivered()
            .await
            .iter()
            .map(|d| d.activity["type"].as_str().unwrap_or("?").to_string())
            .collect()
    }

    /// Make `remote` an accepted follower of the local `target`.
    pub async fn remote_follows(&self, remote: &Identity, target: IdentityId) {
        let target_uri = self.actor_uri(target).await;
        self.federation
            .receive(&serde_json::json!({
                "type": "Follow",
                "id": format!("{}/follows/{}", remote.actor_uri, target),
                "actor": remote.actor_uri,
                "object": target_uri,
            }))
            .await
            .expect("follow accepted");
        self.settle().await;
    }
}
