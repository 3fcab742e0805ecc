//! The `run` command: the activity graphs driven by one runner.
//!
//! State lives in memory. A fixture seeds the directory of identities and
//! posts, and its inbox is replayed through inbound handling before the
//! runner starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::{Result, miette};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use flock_activities::{
    ActivitiesConfig, Context, Delivery, Directory, DirectorySeed, Federation, HttpDelivery,
    RecordingDelivery,
};
use flock_stator::{MemoryStore, RetryPolicy, Runner, RunnerConfig};

pub struct RunOptions {
    pub fixture: Option<PathBuf>,
    pub dry_run: bool,
    pub runner: RunnerConfig,
    pub activities: ActivitiesConfig,
    pub retry: RetryPolicy,
}

/// Startup data for a run.
#[derive(Debug, Default, Deserialize)]
pub struct Fixture {
    #[serde(flatten)]
    pub directory: DirectorySeed,
    /// Activities handled as if they had just arrived, in order.
    #[serde(default)]
    pub inbox: Vec<Value>,
}

pub async fn load_fixture(path: &Path) -> Result<Fixture> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| miette!("failed to read fixture {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| miette!("invalid fixture {}: {}", path.display(), e))
}

/// Build the federation for `options`, replay the fixture inbox and return
/// the federation ready to run.
pub async fn prepare(options: &RunOptions) -> Result<Federation> {
    let fixture = match &options.fixture {
        Some(path) => load_fixture(path).await?,
        None => Fixture::default(),
    };

    let delivery: Arc<dyn Delivery> = if options.dry_run {
        info!("dry run, deliveries are recorded and not sent");
        Arc::new(RecordingDelivery::new())
    } else {
        Arc::new(HttpDelivery::new().map_err(|e| miette!("failed to build HTTP client: {}", e))?)
    };

    info!(
        identities = fixture.directory.identities.len(),
        posts = fixture.directory.posts.len(),
        "seeding directory"
    );
    let ctx = Context::new(
        Arc::new(Directory::from_seed(fixture.directory)),
        delivery,
        Arc::new(MemoryStore::new()),
        options.activities.clone(),
    );
    let federation = Federation::new(ctx)
        .map_err(|e| miette!("invalid graph: {}", e))?
        .with_policy(options.retry);

    let mut rejected = 0;
    for activity in &fixture.inbox {
        if let Err(e) = federation.receive(activity).await {
            warn!(error = %e, "inbox activity rejected");
            rejected += 1;
        }
    }
    if !fixture.inbox.is_empty() {
        info!(
            accepted = fixture.inbox.len() - rejected,
            rejected, "inbox replayed"
        );
    }

    Ok(federation)
}

/// Run until ctrl-c, the configured run time, or a fatal error. Returns
/// attempts handled per graph.
pub async fn run(options: RunOptions) -> Result<BTreeMap<String, u64>> {
    let federation = prepare(&options).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        // Receiver may already be gone
        let _ = shutdown_tx.send(true);
    });

    let runner = Runner::new(federation.stator().clone(), options.runner);
    let handled = runner
        .run(shutdown_rx)
        .await
        .map_err(|e| miette!("runner stopped: {}", e))?;

    for (graph, count) in &handled {
        info!(graph = %graph, count, "attempts handled");
    }
    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_activities::{Identity, follow_id};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    fn options(fixture: Option<PathBuf>) -> RunOptions {
        RunOptions {
            fixture,
            dry_run: true,
            runner: RunnerConfig {
                loop_delay_ms: 10,
                run_for_secs: Some(1),
                ..RunnerConfig::default()
            },
            activities: ActivitiesConfig::default(),
            retry: RetryPolicy::Fixed,
        }
    }

    fn write_fixture(value: &Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(value.to_string().as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_prepare_replays_inbox() {
        let alice = Identity::local("alice", "https://flock.test");
        let bob = Identity::remote(
            "bob",
            "https://remote.test/users/bob",
            "https://remote.test/users/bob/inbox",
        );
        let file = write_fixture(&json!({
            "identities": [alice, bob],
            "inbox": [
                {
                    "type": "Follow",
                    "id": "https://remote.test/follows/1",
                    "actor": bob.actor_uri,
                    "object": alice.actor_uri,
                },
                {"type": "Follow", "actor": "https://nowhere.test/ghost", "object": alice.actor_uri},
            ],
        }));

        let federation = prepare(&options(Some(file.path().to_path_buf())))
            .await
            .unwrap();

        let follow = federation
            .stator()
            .get(follow_id(bob.id, alice.id))
            .await
            .unwrap();
        assert_eq!(follow.state, "remote_requested");
        assert_eq!(federation.stator().list("follow").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_without_fixture_stops_after_run_time() {
        let handled = run(options(None)).await.unwrap();
        assert!(handled.values().all(|&count| count == 0));
    }

    #[tokio::test]
    async fn test_demo_fixture_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/demo.json");
        let fixture = load_fixture(&path).await.unwrap();
        assert_eq!(fixture.directory.identities.len(), 2);
        assert_eq!(fixture.inbox.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_fixture_is_an_error() {
        let result = prepare(&options(Some(PathBuf::from("/nonexistent/fixture.json")))).await;
        assert!(result.is_err());
    }
}
