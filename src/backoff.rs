//! Retry pacing.
//!
//! Two kinds of waiting happen in a worker: retrying a failed store flush
//! (grow the gap each attempt) and spreading periodic work across peers
//! (jitter a fixed interval). Both helpers live here.

use rand::Rng;
use std::time::Duration;

/// Doubling retry window with full jitter.
///
/// Each attempt draws uniformly from (0, ceiling], where the ceiling
/// doubles per attempt up to `cap`. Sleeping the whole ceiling would march
/// every retrying worker in lockstep against the same struggling store;
/// drawing from the full window spreads them out.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    first: Duration,
    cap: Duration,
}

impl RetrySchedule {
    pub const fn starting_at(first: Duration, cap: Duration) -> Self {
        Self { first, cap }
    }

    /// Window ceiling for the given zero-based attempt.
    fn ceiling(&self, attempt: u32) -> Duration {
        self.first
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.cap)
    }

    /// Randomized delay before retrying `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(1..=ceiling_ms))
    }
}

/// Spread a fixed interval by +/- `fraction` so peer workers desynchronize.
///
/// Used for idle polls, lease-contention waits, and the stale-claim sweep
/// cadence.
pub fn jittered(base: Duration, fraction: f64) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 || fraction <= 0.0 {
        return base;
    }
    let spread = ((base_ms as f64) * fraction) as u64;
    let lo = base_ms.saturating_sub(spread);
    let hi = base_ms + spread;
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_up_to_cap() {
        let schedule =
            RetrySchedule::starting_at(Duration::from_millis(80), Duration::from_secs(2));
        assert_eq!(schedule.ceiling(0), Duration::from_millis(80));
        assert_eq!(schedule.ceiling(1), Duration::from_millis(160));
        assert_eq!(schedule.ceiling(3), Duration::from_millis(640));
        assert_eq!(schedule.ceiling(10), Duration::from_secs(2));
        assert_eq!(schedule.ceiling(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_stays_inside_window() {
        let schedule =
            RetrySchedule::starting_at(Duration::from_millis(50), Duration::from_millis(400));
        for attempt in 0..8 {
            let delay = schedule.delay(attempt);
            assert!(delay > Duration::ZERO);
            assert!(delay <= schedule.ceiling(attempt), "attempt {}", attempt);
        }
    }

    #[test]
    fn test_jittered_bounds() {
        let base = Duration::from_secs(60);
        for _ in 0..32 {
            let d = jittered(base, 0.25);
            assert!(d >= Duration::from_secs(45));
            assert!(d <= Duration::from_secs(75));
        }
    }

    #[test]
    fn test_jittered_zero_fraction() {
        assert_eq!(jittered(Duration::from_secs(5), 0.0), Duration::from_secs(5));
    }
}
