//! Per-graph processing statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Time series for one graph, keyed by bucket start (unix seconds).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    /// Due instances observed per minute (a gauge).
    pub queued: BTreeMap<i64, usize>,
    /// Attempts handled per hour.
    pub hourly: BTreeMap<i64, u64>,
    /// Attempts handled per day.
    pub daily: BTreeMap<i64, u64>,
    /// Attempts handled per month.
    pub monthly: BTreeMap<i64, u64>,
    /// Fatal attempt errors seen since startup.
    pub fatal: u64,
}

impl GraphStats {
    fn add_handled_at(&mut self, count: u64, now: DateTime<Utc>) {
        let (hour, day, month) = buckets(now);
        *self.hourly.entry(hour).or_default() += count;
        *self.daily.entry(day).or_default() += count;
        *self.monthly.entry(month).or_default() += count;
    }

    fn trim_at(&mut self, now: DateTime<Utc>) {
        let horizon = |d: Duration| (now - d).timestamp();
        let queued = horizon(Duration::hours(2));
        let hourly = horizon(Duration::hours(50));
        let daily = horizon(Duration::days(62));
        let monthly = horizon(Duration::days(3653));
        self.queued.retain(|ts, _| *ts >= queued);
        self.hourly.retain(|ts, _| *ts >= hourly);
        self.daily.retain(|ts, _| *ts >= daily);
        self.monthly.retain(|ts, _| *ts >= monthly);
    }
}

/// Start of the hour, day and month containing `now`, as unix seconds.
fn buckets(now: DateTime<Utc>) -> (i64, i64, i64) {
    let secs = now.timestamp();
    let hour = secs - secs.rem_euclid(3600);
    let day = secs - secs.rem_euclid(86_400);
    let month = now
        .date_naive()
        .with_day(1)
        .map(|d| d.and_time(NaiveTime::MIN).and_utc().timestamp())
        .unwrap_or(day);
    (hour, day, month)
}

fn minute(now: DateTime<Utc>) -> i64 {
    now.timestamp() - i64::from(now.second())
}

/// Statistics for every graph a runner handles.
#[derive(Debug, Default)]
pub struct Stats {
    graphs: DashMap<String, GraphStats>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how many instances were due.
    pub fn set_queued(&self, graph: &str, count: usize) {
        self.set_queued_at(graph, count, Utc::now());
    }

    pub fn set_queued_at(&self, graph: &str, count: usize, now: DateTime<Utc>) {
        self.graphs
            .entry(graph.to_string())
            .or_default()
            .queued
            .insert(minute(now), count);
    }

    /// Add to the handled counters.
    pub fn add_handled(&self, graph: &str, count: u64) {
        self.add_handled_at(graph, count, Utc::now());
    }

    pub fn add_handled_at(&self, graph: &str, count: u64, now: DateTime<Utc>) {
        self.graphs
            .entry(graph.to_string())
            .or_default()
            .add_handled_at(count, now);
    }

    pub fn record_fatal(&self, graph: &str) {
        self.graphs.entry(graph.to_string()).or_default().fatal += 1;
    }

    /// Drop data points older than each series keeps.
    pub fn trim(&self) {
        self.trim_at(Utc::now());
    }

    pub fn trim_at(&self, now: DateTime<Utc>) {
        for mut entry in self.graphs.iter_mut() {
            entry.value_mut().trim_at(now);
        }
    }

    /// Latest queued gauge value for a graph.
    pub fn most_recent_queued(&self, graph: &str) -> Option<usize> {
        self.graphs
            .get(graph)
            .and_then(|s| s.queued.last_key_value().map(|(_, v)| *v))
    }

    /// Handled count in the current hour bucket, or zero.
    pub fn most_recent_handled(&self, graph: &str) -> u64 {
        self.graphs
            .get(graph)
            .and_then(|s| s.hourly.last_key_value().map(|(_, v)| *v))
            .unwrap_or(0)
    }

    pub fn fatal_count(&self, graph: &str) -> u64 {
        self.graphs.get(graph).map(|s| s.fatal).unwrap_or(0)
    }

    /// Copy of one graph's series.
    pub fn snapshot(&self, graph: &str) -> Option<GraphStats> {
        self.graphs.get(graph).map(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_buckets_truncate() {
        let now = at(2024, 3, 17, 14, 25, 9);
        let (hour, day, month) = buckets(now);
        assert_eq!(hour, at(2024, 3, 17, 14, 0, 0).timestamp());
        assert_eq!(day, at(2024, 3, 17, 0, 0, 0).timestamp());
        assert_eq!(month, at(2024, 3, 1, 0, 0, 0).timestamp());
        assert_eq!(minute(now), at(2024, 3, 17, 14, 25, 0).timestamp());
    }

    #[test]
    fn test_handled_accumulates_per_bucket() {
        let stats = Stats::new();
        stats.add_handled_at("follow", 3, at(2024, 3, 17, 14, 1, 0));
        stats.add_handled_at("follow", 2, at(2024, 3, 17, 14, 59, 0));
        stats.add_handled_at("follow", 4, at(2024, 3, 17, 15, 0, 0));

        let snapshot = stats.snapshot("follow").unwrap();
        assert_eq!(snapshot.hourly.len(), 2);
        assert_eq!(snapshot.hourly[&at(2024, 3, 17, 14, 0, 0).timestamp()], 5);
        assert_eq!(snapshot.daily[&at(2024, 3, 17, 0, 0, 0).timestamp()], 9);
        assert_eq!(snapshot.monthly[&at(2024, 3, 1, 0, 0, 0).timestamp()], 9);
        assert_eq!(stats.most_recent_handled("follow"), 4);
    }

    #[test]
    fn test_queued_is_a_gauge() {
        let stats = Stats::new();
        stats.set_queued_at("post", 10, at(2024, 3, 17, 14, 1, 5));
        stats.set_queued_at("post", 7, at(2024, 3, 17, 14, 1, 40));
        assert_eq!(stats.most_recent_queued("post"), Some(7));
        assert_eq!(stats.snapshot("post").unwrap().queued.len(), 1);
        assert_eq!(stats.most_recent_queued("missing"), None);
    }

    #[test]
    fn test_trim_drops_old_points() {
        let stats = Stats::new();
        let now = at(2024, 3, 17, 14, 0, 0);
        stats.set_queued_at("post", 1, now - Duration::hours(3));
        stats.set_queued_at("post", 2, now);
        stats.add_handled_at("post", 1, now - Duration::hours(60));
        stats.add_handled_at("post", 1, now);

        stats.trim_at(now);

        let snapshot = stats.snapshot("post").unwrap();
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(snapshot.hourly.len(), 1);
        // Still within the daily and monthly horizons
        assert_eq!(snapshot.daily.len(), 2);
        assert_eq!(snapshot.monthly.len(), 1);
    }

    #[test]
    fn test_fatal_counter() {
        let stats = Stats::new();
        assert_eq!(stats.fatal_count("post"), 0);
        stats.record_fatal("post");
        stats.record_fatal("post");
        assert_eq!(stats.fatal_count("post"), 2);
    }
}
