//! Sliding-window rate limiter keyed by `(scope value, guard name)`.
//!
//! Each key keeps the timestamps of the calls admitted within the last
//! `period`. A call is admitted while fewer than `max_calls` timestamps are
//! in the window; otherwise `retry_after` is the time until the oldest one
//! leaves it. Expiring by timestamp, not by bucket, means no counted call is
//! lost at a window boundary.

use crate::errors::GuardError;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub scope_value: String,
    pub guard_name: String,
}

impl RateKey {
    pub fn new(scope_value: impl Into<String>, guard_name: impl Into<String>) -> Self {
        Self {
            scope_value: scope_value.into(),
            guard_name: guard_name.into(),
        }
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.guard_name, self.scope_value)
    }
}

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<RateKey, VecDeque<DateTime<Utc>>>,
    /// Longest period any call was admitted under.
    longest: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    windows: Arc<Mutex<Windows>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(
        &self,
        key: &RateKey,
        max_calls: u32,
        period: Duration,
    ) -> Result<u32, GuardError> {
        self.allow_at(Utc::now(), key, max_calls, period)
    }

    /// Admit one call at `now`, returning how many more fit in the window.
    pub fn allow_at(
        &self,
        now: DateTime<Utc>,
        key: &RateKey,
        max_calls: u32,
        period: Duration,
    ) -> Result<u32, GuardError> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        if period > windows.longest {
            windows.longest = period;
        }
        let window = windows.by_key.entry(key.clone()).or_default();
        evict(window, now, period);

        if window.len() >= max_calls as usize {
            let retry_after = window
                .front()
                .map(|oldest| match oldest.checked_add_signed(period) {
                    Some(frees_at) => (frees_at - now).to_std().unwrap_or_default(),
                    None => std::time::Duration::MAX,
                })
                .unwrap_or_default();
            tracing::debug!(key = %key, ?retry_after, "rate limit reached");
            return Err(GuardError::RateLimited {
                key: key.to_string(),
                max_calls,
                period: period.to_std().unwrap_or_default(),
                retry_after,
            });
        }

        window.push_back(now);
        Ok(max_calls - window.len() as u32)
    }

    /// Calls counted in the window ending at `now`.
    pub fn in_window_at(&self, now: DateTime<Utc>, key: &RateKey, period: Duration) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        match windows.by_key.get_mut(key) {
            Some(window) => {
                evict(window, now, period);
                window.len()
            }
            None => 0,
        }
    }

    /// Drop keys whose windows have fully drained, judged against the
    /// longest period this limiter has seen.
    pub fn prune_at(&self, now: DateTime<Utc>) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let period = windows.longest;
        windows.by_key.retain(|_, window| {
            evict(window, now, period);
            !window.is_empty()
        });
    }

    /// Keys currently holding a window.
    pub fn len(&self) -> usize {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, period: Duration) {
    while let Some(oldest) = window.front() {
        if oldest.checked_add_signed(period).map_or(false, |end| end <= now) {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_exactly_max_calls_per_window() {
        let limiter = RateLimiter::new();
        let key = RateKey::new("session:s1", "search");
        let period = Duration::seconds(60);

        for i in 0..10 {
            let at = t0() + Duration::seconds(i);
            assert!(limiter.allow_at(at, &key, 10, period).is_ok(), "call {}", i + 1);
        }

        let err = limiter
            .allow_at(t0() + Duration::seconds(10), &key, 10, period)
            .unwrap_err();
        match err {
            GuardError::RateLimited { retry_after, .. } => {
                // Oldest call at t0 frees its slot at t0+60.
                assert_eq!(retry_after, std::time::Duration::from_secs(50));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_window_slides_from_first_call() {
        let limiter = RateLimiter::new();
        let key = RateKey::new("session:s1", "search");
        let period = Duration::seconds(60);

        limiter.allow_at(t0(), &key, 2, period).unwrap();
        limiter
            .allow_at(t0() + Duration::seconds(30), &key, 2, period)
            .unwrap();
        assert!(limiter
            .allow_at(t0() + Duration::seconds(59), &key, 2, period)
            .is_err());

        // First call leaves the window exactly at t0+60; the second is still in it.
        assert!(limiter
            .allow_at(t0() + Duration::seconds(60), &key, 2, period)
            .is_ok());
        assert!(limiter
            .allow_at(t0() + Duration::seconds(61), &key, 2, period)
            .is_err());
        assert_eq!(
            limiter.in_window_at(t0() + Duration::seconds(61), &key, period),
            2
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let period = Duration::seconds(60);
        let a = RateKey::new("user:alice", "search");
        let b = RateKey::new("user:bob", "search");

        limiter.allow_at(t0(), &a, 1, period).unwrap();
        assert!(limiter.allow_at(t0(), &a, 1, period).is_err());
        assert!(limiter.allow_at(t0(), &b, 1, period).is_ok());
    }

    #[test]
    fn test_prune_drops_drained_keys() {
        let limiter = RateLimiter::new();
        let short = RateKey::new("*", "ping");
        let long = RateKey::new("*", "export");
        limiter.allow_at(t0(), &short, 5, Duration::seconds(1)).unwrap();
        limiter.allow_at(t0(), &long, 5, Duration::seconds(60)).unwrap();

        // Pruning uses the longest period, so neither key is dropped early.
        limiter.prune_at(t0() + Duration::seconds(5));
        assert_eq!(limiter.len(), 2);

        limiter.prune_at(t0() + Duration::seconds(60));
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_period_past_calendar_range_keeps_calls() {
        let limiter = RateLimiter::new();
        let key = RateKey::new("*", "ping");
        let forever = Duration::days(1_000_000_000);
        limiter.allow_at(t0(), &key, 1, forever).unwrap();

        let err = limiter
            .allow_at(t0() + Duration::days(3650), &key, 1, forever)
            .unwrap_err();
        assert!(matches!(
            err,
            GuardError::RateLimited { retry_after, .. } if retry_after == std::time::Duration::MAX
        ));
        limiter.prune_at(t0() + Duration::days(3650));
        assert_eq!(limiter.len(), 1);
    }
}
