//! The scheduler loop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::DueQuery;
use crate::{AttemptOutcome, InstanceId, StateGraph, Stator, StatorError, Stats};

/// Runner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum attempts in flight at once.
    pub concurrency: usize,
    /// Maximum instances claimed from one graph per fetch pass.
    pub concurrency_per_graph: usize,
    /// Seconds between housekeeping passes.
    pub schedule_interval_secs: u64,
    /// Seconds a claim is held before another runner may take the instance.
    pub lock_expiry_secs: u64,
    /// Pause between fetch passes.
    pub loop_delay_ms: u64,
    /// Stop after this many seconds instead of running until shutdown.
    pub run_for_secs: Option<u64>,
    /// File touched on every housekeeping pass.
    pub liveness_file: Option<PathBuf>,
    /// Stop the loop after the first fatal attempt error.
    pub halt_on_fatal: bool,
    /// Log a warning once an instance has been attempted this many times in
    /// one state without progressing.
    pub attempt_warning: Option<u32>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            concurrency_per_graph: 20,
            schedule_interval_secs: 30,
            lock_expiry_secs: 300,
            loop_delay_ms: 500,
            run_for_secs: None,
            liveness_file: None,
            halt_on_fatal: true,
            attempt_warning: None,
        }
    }
}

/// Result of one attempt, as collected by the runner.
#[derive(Debug)]
pub struct AttemptReport {
    pub graph: String,
    pub instance: InstanceId,
    pub outcome: Result<AttemptOutcome, StatorError>,
}

/// Drives every registered graph: claims due instances, attempts them with
/// bounded concurrency and keeps housekeeping and statistics up to date.
pub struct Runner {
    id: Uuid,
    stator: Stator,
    config: RunnerConfig,
    graphs: Vec<Arc<StateGraph>>,
    stats: Arc<Stats>,
    /// Attempts started since the last housekeeping pass, per graph.
    pending_handled: DashMap<String, u64>,
}

impl Runner {
    /// A runner over every graph registered with `stator`.
    pub fn new(stator: Stator, config: RunnerConfig) -> Self {
        let graphs = stator.registry().graphs().cloned().collect();
        Self {
            id: Uuid::new_v4(),
            stator,
            config,
            graphs,
            stats: Arc::new(Stats::new()),
            pending_handled: DashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn stator(&self) -> &Stator {
        &self.stator
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.lock_expiry_secs as i64)
    }

    /// Run until shutdown is signalled, `run_for_secs` elapses, or (with
    /// `halt_on_fatal`) an attempt fails fatally.
    ///
    /// In-flight attempts are always drained before returning. Returns the
    /// number of attempts completed per graph.
    #[tracing::instrument(skip_all, fields(runner = %self.id))]
    pub async fn run(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<BTreeMap<String, u64>, StatorError> {
        info!(
            graphs = self.graphs.len(),
            concurrency = self.config.concurrency,
            "runner starting"
        );

        let started = Instant::now();
        let schedule_interval = Duration::from_secs(self.config.schedule_interval_secs);
        let loop_delay = Duration::from_millis(self.config.loop_delay_ms);
        let run_for = self.config.run_for_secs.map(Duration::from_secs);

        let mut last_housekeeping: Option<Instant> = None;
        let mut tasks: JoinSet<AttemptReport> = JoinSet::new();
        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        let mut fatal: Option<StatorError> = None;

        loop {
            if *shutdown_rx.borrow() {
                info!("runner shutting down");
                break;
            }

            if last_housekeeping.is_none_or(|at| at.elapsed() >= schedule_interval) {
                if let Err(e) = self.housekeeping().await {
                    error!(error = %e, "housekeeping failed");
                }
                last_housekeeping = Some(Instant::now());
            }

            while let Some(joined) = tasks.try_join_next() {
                self.collect(joined, &mut totals, &mut fatal);
            }
            if fatal.is_some() && self.config.halt_on_fatal {
                error!("fatal attempt error, halting runner");
                break;
            }

            if let Err(e) = self.fetch_and_spawn(&mut tasks).await {
                error!(error = %e, "failed to fetch due instances");
            }

            if run_for.is_some_and(|limit| started.elapsed() >= limit) {
                info!("run time limit reached");
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        // Sender gone; nobody can signal shutdown any more
                        sleep(loop_delay).await;
                    } else if *shutdown_rx.borrow() {
                        info!("runner received shutdown signal");
                    }
                }
                _ = sleep(loop_delay) => {}
            }
        }

        info!(in_flight = tasks.len(), "waiting for attempts to complete");
        while let Some(joined) = tasks.join_next().await {
            self.collect(joined, &mut totals, &mut fatal);
        }

        if let Err(e) = self.housekeeping().await {
            error!(error = %e, "final housekeeping failed");
        }
        info!(?totals, "runner stopped");

        match fatal {
            Some(e) if self.config.halt_on_fatal => Err(e),
            _ => Ok(totals),
        }
    }

    /// One fetch pass, then wait for every attempt it started.
    pub async fn run_single_cycle(&self) -> Result<Vec<AttemptReport>, StatorError> {
        let mut tasks = JoinSet::new();
        self.fetch_and_spawn(&mut tasks).await?;

        let mut reports = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    self.inspect(&report);
                    reports.push(report);
                }
                Err(e) => error!(error = %e, "attempt task failed to join"),
            }
        }
        Ok(reports)
    }

    /// Release expired leases, record queue depth and handled counts, trim
    /// statistics and touch the liveness file.
    #[tracing::instrument(skip_all, fields(runner = %self.id))]
    pub async fn housekeeping(&self) -> Result<(), StatorError> {
        let now = Utc::now();
        let store = self.stator.store();

        for graph in &self.graphs {
            let name = graph.name();
            let released = store.clean_locks(name, now).await?;
            if released > 0 {
                debug!(graph = name, released, "released expired claims");
            }

            let queued = store.count_due(graph, self.stator.policy(), now).await?;
            self.stats.set_queued_at(name, queued, now);

            let handled = self
                .pending_handled
                .remove(name)
                .map(|(_, count)| count)
                .unwrap_or(0);
            self.stats.add_handled_at(name, handled, now);

            info!(graph = name, handled, queued, "housekeeping");
        }
        self.stats.trim_at(now);

        if let Some(path) = &self.config.liveness_file {
            tokio::fs::write(path, now.timestamp().to_string()).await?;
        }
        Ok(())
    }

    /// Claim due instances across all graphs, up to the free concurrency,
    /// and spawn an attempt for each.
    async fn fetch_and_spawn(&self, tasks: &mut JoinSet<AttemptReport>) -> Result<usize, StatorError> {
        let mut space = self.config.concurrency.saturating_sub(tasks.len());
        let mut spawned = 0;

        for graph in &self.graphs {
            if space == 0 {
                break;
            }
            let claims = self
                .stator
                .store()
                .claim_due(&DueQuery {
                    graph,
                    policy: self.stator.policy(),
                    now: Utc::now(),
                    limit: space.min(self.config.concurrency_per_graph),
                    lease: self.lease(),
                })
                .await?;

            for claim in claims {
                let stator = self.stator.clone();
                let graph = claim.instance.graph.clone();
                let instance = claim.instance.id;
                debug!(graph = %graph, instance = %instance, state = %claim.instance.state, "attempting");
                *self.pending_handled.entry(graph.clone()).or_default() += 1;

                tasks.spawn(async move {
                    // Inner task so a panicking handler becomes a report
                    let outcome = match tokio::spawn(async move { stator.attempt(claim).await }).await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(StatorError::AttemptPanicked(e.to_string())),
                    };
                    AttemptReport {
                        graph,
                        instance,
                        outcome,
                    }
                });
                space = space.saturating_sub(1);
                spawned += 1;
            }
        }
        Ok(spawned)
    }

    fn collect(
        &self,
        joined: Result<AttemptReport, tokio::task::JoinError>,
        totals: &mut BTreeMap<String, u64>,
        fatal: &mut Option<StatorError>,
    ) {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "attempt task failed to join");
                return;
            }
        };
        self.inspect(&report);
        *totals.entry(report.graph).or_default() += 1;
        if let Err(e) = report.outcome {
            if e.is_fatal() && fatal.is_none() {
                *fatal = Some(e);
            }
        }
    }

    /// Log a finished attempt and count fatal errors.
    fn inspect(&self, report: &AttemptReport) {
        match &report.outcome {
            Ok(AttemptOutcome::NoTransition { attempts }) => {
                if self.config.attempt_warning.is_some_and(|limit| *attempts >= limit) {
                    warn!(
                        graph = %report.graph,
                        instance = %report.instance,
                        attempts,
                        "instance keeps failing to progress"
                    );
                }
            }
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                self.stats.record_fatal(&report.graph);
                error!(graph = %report.graph, instance = %report.instance, error = %e, "fatal attempt error");
            }
            Err(e) => {
                error!(graph = %report.graph, instance = %report.instance, error = %e, "attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.concurrency, 50);
        assert_eq!(config.concurrency_per_graph, 20);
        assert_eq!(config.schedule_interval_secs, 30);
        assert_eq!(config.lock_expiry_secs, 300);
        assert_eq!(config.loop_delay_ms, 500);
        assert!(config.halt_on_fatal);
        assert!(config.run_for_secs.is_none());
    }

    #[test]
    fn test_config_partial_deserialize() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{"concurrency": 4, "run_for_secs": 10}"#).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.run_for_secs, Some(10));
        assert_eq!(config.concurrency_per_graph, 20);
    }
}
