//! Retry backoff scheduling (spec §4.6.3).

use std::time::Duration;

use orc_types::RetryPolicy;

/// `initial_delay_ms * backoff_multiplier^(attempt-1)`, jittered by up to
/// 20% (uniformly either side), never negative. `attempt` is the attempt
/// number that just failed (1-indexed); the result is the delay before the
/// next attempt.
pub fn next_delay(policy: &RetryPolicy, attempt: u32, jitter_unit: f64) -> Duration {
    let jitter_unit = jitter_unit.clamp(-1.0, 1.0);
    let exponent = attempt.saturating_sub(1) as i32;
    let base_ms = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
    let jitter = base_ms * 0.20 * jitter_unit;
    let delayed_ms = (base_ms + jitter).max(0.0);
    Duration::from_millis(delayed_ms.round() as u64)
}

/// Whether a StepDef's retry policy still has attempts remaining after
/// `attempt` has failed.
pub fn has_attempts_remaining(policy: &RetryPolicy, attempt: u32) -> bool {
    attempt < policy.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn delay_grows_exponentially_at_zero_jitter() {
        assert_eq!(next_delay(&policy(), 1, 0.0), Duration::from_millis(1000));
        assert_eq!(next_delay(&policy(), 2, 0.0), Duration::from_millis(2000));
        assert_eq!(next_delay(&policy(), 3, 0.0), Duration::from_millis(4000));
    }

    #[test]
    fn jitter_stays_within_20_percent_band() {
        let base = 1000.0;
        let max_jitter = base * 0.20;
        let high = next_delay(&policy(), 1, 1.0).as_millis() as f64;
        let low = next_delay(&policy(), 1, -1.0).as_millis() as f64;
        assert!((high - base).abs() <= max_jitter + 1.0);
        assert!((base - low).abs() <= max_jitter + 1.0);
    }

    #[test]
    fn attempts_remaining_respects_max() {
        let p = policy();
        assert!(has_attempts_remaining(&p, 1));
        assert!(has_attempts_remaining(&p, 2));
        assert!(!has_attempts_remaining(&p, 3));
    }
}
