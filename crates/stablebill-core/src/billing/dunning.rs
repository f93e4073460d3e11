//! Dunning schedule
//!
//! Recoverable payment failures retry on a bounded schedule. The default
//! spans five attempts over roughly three weeks (1d, 3d, 5d, 7d, 5d); once
//! the schedule is exhausted the processor moves the subscription to
//! Unpaid.

use chrono::{DateTime, Duration, Utc};

use crate::config::BillingConfig;

/// Bounded retry schedule for recoverable payment failures
#[derive(Debug, Clone)]
pub struct DunningSchedule {
    intervals: Vec<Duration>,
}

impl DunningSchedule {
    pub fn new(interval_days: &[u32]) -> Self {
        Self {
            intervals: interval_days
                .iter()
                .map(|d| Duration::days(*d as i64))
                .collect(),
        }
    }

    pub fn from_config(config: &BillingConfig) -> Self {
        Self::new(&config.dunning_intervals_days)
    }

    /// Max retry attempts for one failure episode
    pub fn max_attempts(&self) -> u32 {
        self.intervals.len() as u32
    }

    /// Deadline for the retry after `attempts_so_far` failures, or `None`
    /// once the schedule is exhausted.
    ///
    /// `attempts_so_far` counts failures already recorded: the first
    /// failure (0 so far) schedules the first interval.
    pub fn next_retry_at(&self, attempts_so_far: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts_so_far < 0 {
            return Some(now + self.intervals[0]);
        }
        self.intervals
            .get(attempts_so_far as usize)
            .map(|interval| now + *interval)
    }

    /// Whether `attempts` failures exhaust the schedule
    pub fn is_exhausted(&self, attempts: i32) -> bool {
        attempts >= self.intervals.len() as i32
    }
}

impl Default for DunningSchedule {
    fn default() -> Self {
        Self::new(&[1, 3, 5, 7, 5])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_spans_five_attempts() {
        let schedule = DunningSchedule::default();
        assert_eq!(schedule.max_attempts(), 5);

        let now = Utc::now();
        assert_eq!(schedule.next_retry_at(0, now), Some(now + Duration::days(1)));
        assert_eq!(schedule.next_retry_at(1, now), Some(now + Duration::days(3)));
        assert_eq!(schedule.next_retry_at(2, now), Some(now + Duration::days(5)));
        assert_eq!(schedule.next_retry_at(3, now), Some(now + Duration::days(7)));
        assert_eq!(schedule.next_retry_at(4, now), Some(now + Duration::days(5)));
        assert_eq!(schedule.next_retry_at(5, now), None);
    }

    #[test]
    fn test_exhaustion_bound() {
        let schedule = DunningSchedule::default();
        assert!(!schedule.is_exhausted(4));
        assert!(schedule.is_exhausted(5));
        assert!(schedule.is_exhausted(6));
    }

    #[test]
    fn test_configured_schedule() {
        let schedule = DunningSchedule::new(&[2, 4]);
        let now = Utc::now();
        assert_eq!(schedule.max_attempts(), 2);
        assert_eq!(schedule.next_retry_at(0, now), Some(now + Duration::days(2)));
        assert_eq!(schedule.next_retry_at(1, now), Some(now + Duration::days(4)));
        assert_eq!(schedule.next_retry_at(2, now), None);
    }

    #[test]
    fn test_total_window_is_about_three_weeks() {
        let schedule = DunningSchedule::default();
        let total: i64 = [1, 3, 5, 7, 5].iter().sum();
        assert_eq!(total, 21);
        assert_eq!(schedule.max_attempts() as i64, 5);
    }
}
