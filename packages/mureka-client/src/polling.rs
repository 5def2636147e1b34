//! Adaptive poll interval calculation.
//!
//! Generation jobs usually finish within two minutes; polling starts
//! frequent and backs off as the job drags on, to reduce load on the
//! provider and stay clear of its rate limits.

use std::time::Duration;

/// Poll interval tiers.
#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    /// Used while elapsed time is under two minutes.
    pub short: Duration,
    /// Used between two and five minutes.
    pub medium: Duration,
    /// Used past five minutes.
    pub long: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(5),
            medium: Duration::from_secs(15),
            long: Duration::from_secs(30),
        }
    }
}

/// Elapsed time past which the medium interval applies.
pub const MEDIUM_THRESHOLD: Duration = Duration::from_secs(120);
/// Elapsed time past which the long interval applies.
pub const LONG_THRESHOLD: Duration = Duration::from_secs(300);

/// Map elapsed wall-clock time since polling began to a poll delay.
pub fn adaptive_poll_interval(intervals: &PollIntervals, elapsed: Duration) -> Duration {
    if elapsed < MEDIUM_THRESHOLD {
        intervals.short
    } else if elapsed < LONG_THRESHOLD {
        intervals.medium
    } else {
        intervals.long
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_breakpoints() {
        let tiers = PollIntervals::default();

        assert_eq!(
            adaptive_poll_interval(&tiers, Duration::from_secs(0)),
            tiers.short
        );
        assert_eq!(
            adaptive_poll_interval(&tiers, Duration::from_secs(119)),
            tiers.short
        );
        assert_eq!(
            adaptive_poll_interval(&tiers, Duration::from_secs(120)),
            tiers.medium
        );
        assert_eq!(
            adaptive_poll_interval(&tiers, Duration::from_secs(299)),
            tiers.medium
        );
        assert_eq!(
            adaptive_poll_interval(&tiers, Duration::from_secs(300)),
            tiers.long
        );
        assert_eq!(
            adaptive_poll_interval(&tiers, Duration::from_secs(3600)),
            tiers.long
        );
    }

    #[test]
    fn interval_is_non_decreasing() {
        let tiers = PollIntervals::default();
        let mut last = Duration::ZERO;
        for secs in (0..600).step_by(10) {
            let interval = adaptive_poll_interval(&tiers, Duration::from_secs(secs));
            assert!(interval >= last, "interval decreased at {secs}s");
            last = interval;
        }
    }
}
