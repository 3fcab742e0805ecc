//! Retry cadence for automatic states.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// How the wait between attempts grows with repeated attempts in one state.
///
/// Entering a new state resets the attempt counter, so the policy only ever
/// stretches retries of a state that keeps failing to progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Always wait exactly the state's try interval.
    #[default]
    Fixed,
    /// Double the interval per attempt, up to `max_doublings` times, never
    /// waiting longer than `ceiling_secs` (or less than the base interval).
    Exponential { max_doublings: u32, ceiling_secs: i64 },
}

impl RetryPolicy {
    /// Wait before the next attempt of a state with interval `base` that has
    /// already been attempted `attempts` times.
    pub fn interval_for(&self, base: Duration, attempts: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed => base,
            RetryPolicy::Exponential {
                max_doublings,
                ceiling_secs,
            } => {
                // Shift stays well inside i64 for any realistic interval
                let shift = attempts.min(max_doublings).min(30);
                let secs = base.num_seconds().saturating_mul(1i64 << shift);
                let ceiling = ceiling_secs.max(base.num_seconds());
                Duration::seconds(secs.min(ceiling))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // === Unit Tests ===

    #[test]
    fn test_fixed_ignores_attempts() {
        let base = Duration::seconds(300);
        assert_eq!(RetryPolicy::Fixed.interval_for(base, 0), base);
        assert_eq!(RetryPolicy::Fixed.interval_for(base, 50), base);
    }

    #[test]
    fn test_exponential_doubles_then_caps() {
        // 5min, 10min, 20min, 40min, max 1hr
        let policy = RetryPolicy::Exponential {
            max_doublings: 4,
            ceiling_secs: 3600,
        };
        let base = Duration::seconds(300);
        assert_eq!(policy.interval_for(base, 0).num_seconds(), 300);
        assert_eq!(policy.interval_for(base, 1).num_seconds(), 600);
        assert_eq!(policy.interval_for(base, 2).num_seconds(), 1200);
        assert_eq!(policy.interval_for(base, 3).num_seconds(), 2400);
        assert_eq!(policy.interval_for(base, 5).num_seconds(), 3600);
    }

    #[test]
    fn test_ceiling_below_base_keeps_base() {
        let policy = RetryPolicy::Exponential {
            max_doublings: 4,
            ceiling_secs: 10,
        };
        assert_eq!(policy.interval_for(Duration::seconds(60), 3).num_seconds(), 60);
    }

    #[test]
    fn test_default_is_fixed() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::Fixed);
    }

    #[test]
    fn test_deserializes_from_config() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"kind":"exponential","max_doublings":3,"ceiling_secs":900}"#)
                .unwrap();
        assert_eq!(
            policy,
            RetryPolicy::Exponential {
                max_doublings: 3,
                ceiling_secs: 900
            }
        );
    }

    // === Property-Based Tests ===

    proptest! {
        #[test]
        fn exponential_is_bounded_and_monotonic(
            base in 1i64..100_000,
            attempts in 0u32..1_000,
            max_doublings in 0u32..64,
            ceiling in 0i64..1_000_000,
        ) {
            let policy = RetryPolicy::Exponential { max_doublings, ceiling_secs: ceiling };
            let base = Duration::seconds(base);
            let now = policy.interval_for(base, attempts);
            let next = policy.interval_for(base, attempts + 1);

            prop_assert!(now >= base);
            prop_assert!(now.num_seconds() <= ceiling.max(base.num_seconds()));
            prop_assert!(next >= now);
        }
    }
}
