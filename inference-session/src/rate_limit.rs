//! Per-category admission control.
//!
//! Fail-fast sliding window: a refused request gets `RateLimitExceeded`
//! immediately, never a queue slot. Waiting is the retry policy's job.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::{ChargePolicy, RateLimitConfig};
use crate::error::ProtocolError;
use crate::types::RateCategory;

/// `retry_after` reported for a category configured with zero capacity.
const CLOSED_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    capacity: usize,
    length: Duration,
    admissions: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.admissions.front() {
            if now.duration_since(oldest) >= self.length {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    fn until_next_slot(&self, now: Instant) -> Duration {
        if self.capacity == 0 {
            // Closed category: nothing ever ages out to make room.
            return self.length.max(CLOSED_RETRY_AFTER);
        }
        if self.admissions.len() < self.capacity {
            return Duration::ZERO;
        }
        // Full: the slot frees when the admission that makes room ages out.
        let freeing = self.admissions[self.admissions.len() - self.capacity];
        (freeing + self.length).saturating_duration_since(now)
    }
}

/// Sliding-window limiter shared by every request on a session.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<RateCategory, Window>>,
    charge_policy: ChargePolicy,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut windows = HashMap::new();
        for category in [RateCategory::Chat, RateCategory::Image, RateCategory::Vector] {
            if let Some(bucket) = config.bucket(category) {
                windows.insert(
                    category,
                    Window {
                        capacity: bucket.capacity as usize,
                        length: bucket.window(),
                        admissions: VecDeque::new(),
                    },
                );
            }
        }

        Self {
            windows: Mutex::new(windows),
            charge_policy: config.charge_policy,
        }
    }

    pub fn charge_policy(&self) -> ChargePolicy {
        self.charge_policy
    }

    /// Whether a request of this category would be admitted now.
    pub fn can_admit(&self, category: RateCategory) -> bool {
        self.time_until_next_slot(category).is_zero()
    }

    /// Time until the next admissible slot; zero when one is free.
    pub fn time_until_next_slot(&self, category: RateCategory) -> Duration {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        match windows.get_mut(&category) {
            Some(window) => {
                window.prune(now);
                window.until_next_slot(now)
            }
            None => Duration::ZERO,
        }
    }

    /// Admission check; does not consume quota.
    pub fn check(&self, category: RateCategory) -> Result<(), ProtocolError> {
        let retry_after = self.time_until_next_slot(category);
        if retry_after.is_zero() {
            Ok(())
        } else {
            debug!(?category, ?retry_after, "Admission refused");
            Err(ProtocolError::RateLimitExceeded {
                category,
                retry_after,
            })
        }
    }

    /// Consume one slot.
    pub fn record_admission(&self, category: RateCategory) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(window) = windows.get_mut(&category) {
            window.prune(now);
            window.admissions.push_back(now);
        }
    }

    /// Number of admissions currently inside the window.
    pub fn in_window(&self, category: RateCategory) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows
            .get_mut(&category)
            .map(|w| {
                w.prune(now);
                w.admissions.len()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BucketConfig;

    fn limiter(capacity: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            image: BucketConfig::new(capacity, window),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_capacity() {
        let limiter = limiter(2, Duration::from_secs(10));

        assert!(limiter.can_admit(RateCategory::Image));
        limiter.record_admission(RateCategory::Image);
        assert!(limiter.can_admit(RateCategory::Image));
        limiter.record_admission(RateCategory::Image);
        assert!(!limiter.can_admit(RateCategory::Image));

        // Other categories are independent
        assert!(limiter.can_admit(RateCategory::Chat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_next_slot() {
        let limiter = limiter(2, Duration::from_secs(10));
        limiter.record_admission(RateCategory::Image);
        tokio::time::advance(Duration::from_secs(3)).await;
        limiter.record_admission(RateCategory::Image);

        assert_eq!(
            limiter.time_until_next_slot(RateCategory::Image),
            Duration::from_secs(7)
        );

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(limiter.can_admit(RateCategory::Image));
        assert_eq!(limiter.in_window(RateCategory::Image), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_does_not_consume() {
        let limiter = limiter(1, Duration::from_secs(5));
        limiter.record_admission(RateCategory::Image);

        let err = limiter.check(RateCategory::Image).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert!(limiter.check(RateCategory::Image).is_err());
        assert_eq!(limiter.in_window(RateCategory::Image), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_never_admits() {
        let limiter = limiter(0, Duration::from_secs(30));

        let err = limiter.check(RateCategory::Image).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!limiter.can_admit(RateCategory::Image));

        let instant = self::limiter(0, Duration::ZERO);
        assert_eq!(
            instant.time_until_next_slot(RateCategory::Image),
            CLOSED_RETRY_AFTER
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_category_unlimited() {
        let limiter = limiter(1, Duration::from_secs(5));
        limiter.record_admission(RateCategory::Remote);
        assert!(limiter.can_admit(RateCategory::Remote));
    }
}
