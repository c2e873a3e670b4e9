//! Exponential backoff with jitter, shared by the in-document `Try` retry
//! policy and the outbox's per-row redelivery backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// `initial * multiplier^(attempt-1)`, capped at `max` (if set), with a
/// uniform `±jitter` fraction applied, then clamped to `floor`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Backoff {
    #[serde(with = "duration_millis")]
    pub initial: Duration,
    pub multiplier: f64,
    /// Fraction in `[0, 1]`; `0.2` means `±20%`.
    pub jitter: f64,
    #[serde(with = "option_duration_millis", default)]
    pub max: Option<Duration>,
    #[serde(with = "duration_millis", default)]
    pub floor: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
            max: None,
            floor: Duration::ZERO,
        }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_floor(mut self, floor: Duration) -> Self {
        self.floor = floor;
        self
    }

    /// `attempt` is 1-based: attempt 1 (the initial try) has zero delay;
    /// attempt 2 is the first retry.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 1;
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retry_num as i32 - 1);
        let capped = match self.max {
            Some(max) => base.min(max.as_secs_f64()),
            None => base,
        };

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            (capped + rng.gen_range(-range..range)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered).max(self.floor)
    }
}

/// The outbox's backoff defaults: `initialDelay * 2^(attemptCount-1)` with
/// ±20% jitter, clamped to a 100 ms floor.
pub fn outbox_backoff(initial_delay: Duration) -> Backoff {
    Backoff::new(initial_delay, 2.0, 0.2).with_floor(Duration::from_millis(100))
}

/// Attempt/duration budget and retry predicate for a `Try` task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TryRetryPolicy {
    pub limit_attempt_count: u32,
    #[serde(with = "option_duration_millis", default)]
    pub limit_duration: Option<Duration>,
    pub backoff: Backoff,
    /// JQ predicate; if present, must be truthy to retry.
    pub when: Option<String>,
    /// JQ predicate; if present and truthy, retry is suppressed.
    pub except_when: Option<String>,
}

impl TryRetryPolicy {
    /// Pure eligibility check: does NOT evaluate `when`/`except_when`
    /// (those require scope access and are evaluated by the caller).
    pub fn within_budget(&self, attempt_index: u32, elapsed: Duration) -> bool {
        if attempt_index >= self.limit_attempt_count {
            return false;
        }
        if let Some(limit) = self.limit_duration {
            if elapsed >= limit {
                return false;
            }
        }
        true
    }

    /// `attempt_index` is 0 on the first failure (the one about to be
    /// retried for the first time), matching [`Self::within_budget`]'s
    /// convention. `Backoff::delay_for_attempt` is 1-based with its first
    /// retry at `attempt` 2, so the first retry here (`attempt_index` 0)
    /// must map to `attempt` 2, not 1.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt_index + 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, 0.0);
        assert_eq!(backoff.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, 0.0).with_max(Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn outbox_backoff_delay_lies_within_twenty_percent_jitter_band() {
        let backoff = outbox_backoff(Duration::from_secs(1));
        for attempt in 2..6 {
            let delay = backoff.delay_for_attempt(attempt);
            let retry_num = (attempt - 1) as i32;
            let expected = 1.0 * 2f64.powi(retry_num - 1);
            let lo = Duration::from_secs_f64((expected * 0.8).max(0.1));
            let hi = Duration::from_secs_f64(expected * 1.2);
            assert!(delay >= lo && delay <= hi, "attempt {attempt}: {delay:?} not in [{lo:?}, {hi:?}]");
        }
    }

    #[test]
    fn outbox_backoff_floor_is_honored() {
        let backoff = outbox_backoff(Duration::from_millis(1));
        assert!(backoff.delay_for_attempt(2) >= Duration::from_millis(100));
    }

    #[test]
    fn try_retry_policy_respects_attempt_and_duration_budget() {
        let policy = TryRetryPolicy {
            limit_attempt_count: 3,
            limit_duration: Some(Duration::from_secs(10)),
            backoff: Backoff::new(Duration::from_secs(1), 2.0, 0.0),
            when: None,
            except_when: None,
        };
        assert!(policy.within_budget(0, Duration::from_secs(1)));
        assert!(policy.within_budget(2, Duration::from_secs(1)));
        assert!(!policy.within_budget(3, Duration::from_secs(1)));
        assert!(!policy.within_budget(0, Duration::from_secs(11)));
    }

    #[test]
    fn try_retry_policy_delay_matches_the_backoff_curve_without_an_off_by_one() {
        let policy = TryRetryPolicy {
            limit_attempt_count: 5,
            limit_duration: None,
            backoff: Backoff::new(Duration::from_secs(1), 2.0, 0.0),
            when: None,
            except_when: None,
        };
        // attempt_index 0: the first failure, about to be retried for the
        // first time, gets the initial delay, not zero.
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }
}
