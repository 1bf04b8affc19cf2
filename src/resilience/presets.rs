//! Retry presets and schedules
//!
//! A [`RetrySchedule`] is a pure description, usable independently of
//! `Resilience::run`. Delays follow decorrelated jitter: the first delay is
//! the base, each subsequent delay is drawn uniformly from
//! `[base, 3 * previous]`, clamped to the schedule's cap. `up_to` bounds the
//! total elapsed time across the whole retry chain.

use rand::Rng;
use std::time::Duration;

/// Named, immutable retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPreset {
    /// Two quick attempts for interactive paths
    Brief,
    /// The workhorse: three attempts within thirty seconds
    Default,
    /// Slow dependencies that are worth waiting for
    Patient,
    /// Background work that should keep trying
    Persistent,
}

/// First-class retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// First delay, and the lower bound for every jittered draw
    pub base: Duration,
    /// Total invocations, including the first
    pub max_attempts: u32,
    /// Nominal growth factor between attempts
    pub factor: u32,
    /// Bound on total elapsed time across the chain
    pub up_to: Option<Duration>,
}

/// Retrieve the schedule for a preset
pub fn schedule(preset: RetryPreset) -> RetrySchedule {
    match preset {
        RetryPreset::Brief => RetrySchedule {
            base: Duration::from_millis(50),
            max_attempts: 2,
            factor: 2,
            up_to: None,
        },
        RetryPreset::Default => RetrySchedule {
            base: Duration::from_millis(100),
            max_attempts: 3,
            factor: 2,
            up_to: Some(Duration::from_secs(30)),
        },
        RetryPreset::Patient => RetrySchedule {
            base: Duration::from_millis(500),
            max_attempts: 5,
            factor: 2,
            up_to: Some(Duration::from_secs(300)),
        },
        RetryPreset::Persistent => RetrySchedule {
            base: Duration::from_millis(100),
            max_attempts: 5,
            factor: 2,
            up_to: None,
        },
    }
}

impl RetrySchedule {
    /// Draw the next decorrelated-jitter delay
    pub fn next_delay(&self, previous: Option<Duration>) -> Duration {
        let Some(previous) = previous else {
            return self.base;
        };
        let base_ms = self.base.as_millis() as u64;
        let upper_ms = (previous.as_millis() as u64).saturating_mul(3);
        let cap_ms = self
            .up_to
            .map(|cap| cap.as_millis() as u64)
            .unwrap_or(u64::MAX);
        let upper_ms = upper_ms.min(cap_ms).max(base_ms);
        if upper_ms <= base_ms {
            return self.base;
        }
        Duration::from_millis(rand::rng().random_range(base_ms..=upper_ms))
    }

    /// The worst-case delay sequence, for sizing timeouts
    pub fn max_total_delay(&self) -> Duration {
        if let Some(up_to) = self.up_to {
            return up_to;
        }
        let mut total = Duration::ZERO;
        let mut delay = self.base;
        for _ in 1..self.max_attempts {
            total += delay;
            delay = delay.saturating_mul(3);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_table() {
        let brief = schedule(RetryPreset::Brief);
        assert_eq!(brief.base, Duration::from_millis(50));
        assert_eq!(brief.max_attempts, 2);
        assert_eq!(brief.up_to, None);

        let default = schedule(RetryPreset::Default);
        assert_eq!(default.base, Duration::from_millis(100));
        assert_eq!(default.max_attempts, 3);
        assert_eq!(default.up_to, Some(Duration::from_secs(30)));

        let patient = schedule(RetryPreset::Patient);
        assert_eq!(patient.base, Duration::from_millis(500));
        assert_eq!(patient.max_attempts, 5);
        assert_eq!(patient.up_to, Some(Duration::from_secs(300)));

        let persistent = schedule(RetryPreset::Persistent);
        assert_eq!(persistent.max_attempts, 5);
        assert_eq!(persistent.up_to, None);
    }

    #[test]
    fn test_first_delay_is_base() {
        let schedule = schedule(RetryPreset::Default);
        assert_eq!(schedule.next_delay(None), schedule.base);
    }

    #[test]
    fn test_jitter_bounds() {
        let schedule = schedule(RetryPreset::Default);
        let mut previous = schedule.next_delay(None);
        for _ in 0..50 {
            let next = schedule.next_delay(Some(previous));
            assert!(next >= schedule.base, "delay below base: {next:?}");
            assert!(
                next <= previous.saturating_mul(3).max(schedule.base),
                "delay above 3x previous: {next:?}"
            );
            if let Some(cap) = schedule.up_to {
                assert!(next <= cap);
            }
            previous = next;
        }
    }

    #[test]
    fn test_schedule_is_a_value() {
        // Retrieving a schedule twice yields the same pure description.
        assert_eq!(
            schedule(RetryPreset::Patient),
            schedule(RetryPreset::Patient)
        );
    }
}
