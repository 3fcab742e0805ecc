//! Settings for the activity graphs.

use serde::{Deserialize, Serialize};

/// Tunables the activity graphs read when they are built or run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitiesConfig {
    /// Seconds before hashtag statistics are recomputed.
    pub hashtag_stats_max_age_secs: i64,
    /// Seconds a fan-out keeps retrying before it is marked failed.
    pub fan_out_timeout_secs: i64,
}

impl Default for ActivitiesConfig {
    fn default() -> Self {
        Self {
            hashtag_stats_max_age_secs: 86_400,
            fan_out_timeout_secs: 3 * 86_400,
        }
    }
}
