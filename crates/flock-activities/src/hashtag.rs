//! Per-hashtag usage statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, Utc};
use flock_stator::{
    GraphBuilder, GraphError, HandlerError, Instance, InstanceId, NewInstance, Outcome, StateDef,
    StateGraph, StateKind, Transition,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{Handled, bind};
use crate::{ActivityError, Context, Federation, Post};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashtagState {
    Outdated,
    Updated,
}

impl StateKind for HashtagState {
    const GRAPH: &'static str = "hashtag";

    fn name(self) -> &'static str {
        match self {
            HashtagState::Outdated => "outdated",
            HashtagState::Updated => "updated",
        }
    }

    fn all() -> &'static [Self] {
        &[HashtagState::Outdated, HashtagState::Updated]
    }
}

/// Payload of a hashtag instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashtagData {
    pub tag: String,
    /// Post counts keyed by `total`, a day (`2024-03-17`), a month
    /// (`2024-03`) or a year (`2024`).
    #[serde(default)]
    pub stats: BTreeMap<String, u64>,
    #[serde(default)]
    pub stats_updated: Option<DateTime<Utc>>,
}

pub fn hashtag_id(tag: &str) -> InstanceId {
    InstanceId::derived(HashtagState::GRAPH, tag)
}

/// A hashtag record for `tag`; creating it again is a no-op.
pub(crate) fn record(tag: &str) -> Result<NewInstance, HandlerError> {
    let data = HashtagData {
        tag: tag.to_string(),
        stats: BTreeMap::new(),
        stats_updated: None,
    };
    Ok(NewInstance::derived(
        HashtagState::GRAPH,
        tag,
        serde_json::to_value(&data)?,
    ))
}

/// `#` followed by tag characters, not glued to a preceding word.
static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\B#([a-zA-Z0-9(_)]+)").unwrap());

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Longest prefix of `run` that ends on a word boundary and is not followed
/// by `;` (so HTML entities like `&#39;` are not tags).
fn trim_tag<'a>(run: &'a str, rest: &str) -> Option<&'a str> {
    let next_after_run = rest.chars().next();
    run.char_indices().rev().find_map(|(i, last)| {
        let end = i + last.len_utf8();
        let next = run[end..].chars().next().or(next_after_run);
        let boundary = is_word(last) != next.is_some_and(is_word);
        (boundary && next != Some(';')).then(|| &run[..end])
    })
}

/// Lowercased `#tags` in post content, sorted and without duplicates.
pub fn hashtags_in(content: &str) -> Vec<String> {
    let tags: BTreeSet<String> = HASHTAG_RE
        .captures_iter(content)
        .filter_map(|caps| {
            let run = caps.get(1)?;
            trim_tag(run.as_str(), &content[run.end()..])
        })
        .map(str::to_lowercase)
        .collect();
    tags.into_iter().collect()
}

pub(crate) fn graph(ctx: &Context) -> Result<StateGraph, GraphError> {
    GraphBuilder::<HashtagState>::new()
        .state(HashtagState::Outdated, StateDef::try_every(300).initial())
        .state(HashtagState::Updated, StateDef::try_every(3600).delayed())
        .transition(HashtagState::Outdated, HashtagState::Updated)
        .transition(HashtagState::Updated, HashtagState::Outdated)
        .handler(HashtagState::Outdated, bind(ctx, handle_outdated))
        .handler(HashtagState::Updated, bind(ctx, handle_updated))
        .build()
}

/// Counts of `posts` overall and for the day, month and year of `now`.
pub fn compute_stats(posts: &[Post], now: DateTime<Utc>) -> BTreeMap<String, u64> {
    let today = now.date_naive();
    let count = |pred: &dyn Fn(&Post) -> bool| posts.iter().filter(|p| pred(p)).count() as u64;

    BTreeMap::from([
        ("total".to_string(), posts.len() as u64),
        (
            today.format("%Y-%m-%d").to_string(),
            count(&|p| p.created_at.date_naive() == today),
        ),
        (
            today.format("%Y-%m").to_string(),
            count(&|p| p.created_at.year() == today.year() && p.created_at.month() == today.month()),
        ),
        (
            today.format("%Y").to_string(),
            count(&|p| p.created_at.year() == today.year()),
        ),
    ])
}

/// Recount the tag's local public posts.
async fn handle_outdated(ctx: Context, instance: Instance) -> Handled<HashtagState> {
    let mut hashtag: HashtagData = instance.data_as()?;
    let posts = ctx.directory.local_public_posts_tagged(&hashtag.tag).await;
    if posts.is_empty() {
        return Ok(Outcome::to(HashtagState::Updated));
    }

    let now = Utc::now();
    hashtag.stats.extend(compute_stats(&posts, now));
    hashtag.stats_updated = Some(now);
    debug!(tag = %hashtag.tag, total = posts.len(), "hashtag stats updated");
    Ok(Outcome::Transition(
        Transition::to(HashtagState::Updated).with_data(serde_json::to_value(&hashtag)?),
    ))
}

/// Mark the stats outdated once they are old enough.
async fn handle_updated(ctx: Context, instance: Instance) -> Handled<HashtagState> {
    if instance.state_age() > Duration::seconds(ctx.config.hashtag_stats_max_age_secs) {
        return Ok(Outcome::to(HashtagState::Outdated));
    }
    Ok(Outcome::Stay)
}

impl Federation {
    /// The tag's record, if any post has used it.
    pub async fn hashtag(&self, tag: &str) -> Result<Option<HashtagData>, ActivityError> {
        match self.find(hashtag_id(&tag.to_lowercase())).await? {
            Some(instance) => Ok(Some(serde_json::from_value(instance.data)?)),
            None => Ok(None),
        }
    }
}
