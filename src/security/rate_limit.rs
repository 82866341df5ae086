//! Dual-window token bucket admission control.
//!
//! Each identity owns a minute bucket and an hour bucket. A request takes a
//! token from both or from neither: the minute token is reserved first, the
//! hour token second, and a failed hour reservation rolls the minute one back.
//! The whole sequence runs under the identity's map entry guard, so no other
//! caller can observe the intermediate state.

use serde::Serialize;

use dashmap::DashMap;

use crate::clock::{elapsed_secs, SharedClock, MILLIS_PER_SEC};
use crate::config::RateLimitConfig;
use crate::error::{ShieldError, ShieldResult};
use crate::observability::metrics;
use crate::security::eviction;

const MINUTE_SECS: u64 = 60;
const HOUR_SECS: u64 = 60 * 60;

/// Which bucket rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
        }
    }
}

/// A token taken from a bucket, pending commit or rollback.
#[must_use = "a reservation must be committed or rolled back"]
#[derive(Debug)]
pub struct Reservation {
    window: Window,
}

impl Reservation {
    /// Keep the token.
    pub fn commit(self) {}
}

/// A fixed-capacity bucket refilled in full once per window.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    window: Window,
    capacity: u32,
    window_secs: u64,
    tokens: u32,
    last_refill: u64,
}

impl TokenBucket {
    pub fn new(window: Window, capacity: u32, window_secs: u64, now: u64) -> Self {
        Self {
            window,
            capacity,
            window_secs,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: u64) {
        if now.saturating_sub(self.last_refill) >= self.window_secs * MILLIS_PER_SEC {
            self.tokens = self.capacity;
            self.last_refill = now;
        }
    }

    /// Take one token, or report how long until the next refill.
    pub fn reserve(&mut self, now: u64) -> Result<Reservation, u64> {
        self.refill(now);
        if self.tokens == 0 {
            return Err(self.retry_after_secs(now));
        }
        self.tokens -= 1;
        Ok(Reservation {
            window: self.window,
        })
    }

    /// Return a reserved token.
    pub fn rollback(&mut self, reservation: Reservation) {
        debug_assert_eq!(reservation.window, self.window);
        self.tokens = (self.tokens + 1).min(self.capacity);
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// `max(1, ceil(window - elapsed))`.
    pub fn retry_after_secs(&self, now: u64) -> u64 {
        let remaining = self.window_secs as f64 - elapsed_secs(self.last_refill, now);
        remaining.ceil().max(1.0) as u64
    }

    /// Tokens available at `now` without mutating the bucket.
    fn available_at(&self, now: u64) -> u32 {
        let mut projected = self.clone();
        projected.refill(now);
        projected.tokens
    }
}

#[derive(Debug)]
struct IdentityQuota {
    minute: TokenBucket,
    hour: TokenBucket,
    consecutive_blocks: u32,
    abuse_count: u32,
    last_seen: u64,
}

impl IdentityQuota {
    fn new(config: &RateLimitConfig, now: u64) -> Self {
        Self {
            minute: TokenBucket::new(Window::Minute, config.requests_per_minute, MINUTE_SECS, now),
            hour: TokenBucket::new(Window::Hour, config.requests_per_hour, HOUR_SECS, now),
            consecutive_blocks: 0,
            abuse_count: 0,
            last_seen: now,
        }
    }

    /// Count a rejection; returns true when it completed an escalation strike.
    fn note_block(&mut self, threshold: u32) -> bool {
        self.consecutive_blocks += 1;
        if self.consecutive_blocks >= threshold {
            self.consecutive_blocks = 0;
            self.abuse_count += 1;
            true
        } else {
            false
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Smaller of the two buckets' remaining tokens after this call.
    pub remaining: u32,
    /// Set only on rejection.
    pub retry_after_secs: Option<u64>,
    /// Per-minute capacity.
    pub limit: u32,
    /// Bucket that rejected the request.
    pub exceeded_window: Option<Window>,
    /// This rejection incremented the identity's abuse counter.
    pub escalated: bool,
}

/// Non-consuming view of an identity's quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub identity: String,
    pub minute_remaining: u32,
    pub hour_remaining: u32,
    pub limit: u32,
    pub consecutive_blocks: u32,
    pub abuse_count: u32,
}

/// Per-identity dual-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    quotas: DashMap<String, IdentityQuota>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> ShieldResult<Self> {
        config.validate().map_err(ShieldError::InvalidConfig)?;
        Ok(Self {
            config,
            clock,
            quotas: DashMap::new(),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one request for `identity` if both windows allow it.
    pub fn check(&self, identity: &str) -> RateLimitDecision {
        let limit = self.config.requests_per_minute;
        if !self.config.enabled {
            return RateLimitDecision {
                allowed: true,
                remaining: limit,
                retry_after_secs: None,
                limit,
                exceeded_window: None,
                escalated: false,
            };
        }

        let now = self.clock.now_millis();
        eviction::make_room(
            &self.quotas,
            identity,
            self.config.max_tracked_identities,
            |q| q.last_seen,
        );

        let mut entry = self
            .quotas
            .entry(identity.to_string())
            .or_insert_with(|| IdentityQuota::new(&self.config, now));
        let quota = entry.value_mut();
        quota.last_seen = now;

        let minute = match quota.minute.reserve(now) {
            Ok(reservation) => reservation,
            Err(retry_after) => {
                return self.reject(identity, quota, Window::Minute, retry_after);
            }
        };

        let hour = match quota.hour.reserve(now) {
            Ok(reservation) => reservation,
            Err(retry_after) => {
                quota.minute.rollback(minute);
                return self.reject(identity, quota, Window::Hour, retry_after);
            }
        };

        minute.commit();
        hour.commit();
        quota.consecutive_blocks = 0;

        RateLimitDecision {
            allowed: true,
            remaining: quota.minute.tokens().min(quota.hour.tokens()),
            retry_after_secs: None,
            limit,
            exceeded_window: None,
            escalated: false,
        }
    }

    fn reject(
        &self,
        identity: &str,
        quota: &mut IdentityQuota,
        window: Window,
        retry_after: u64,
    ) -> RateLimitDecision {
        let escalated = quota.note_block(self.config.escalation_threshold);

        tracing::warn!(
            identity = %identity,
            window = window.as_str(),
            retry_after_secs = retry_after,
            abuse_count = quota.abuse_count,
            escalated,
            "Rate limit exceeded"
        );
        metrics::record_rate_limited(window.as_str());

        RateLimitDecision {
            allowed: false,
            remaining: 0,
            retry_after_secs: Some(retry_after),
            limit: self.config.requests_per_minute,
            exceeded_window: Some(window),
            escalated,
        }
    }

    /// Number of escalation strikes recorded for `identity`.
    pub fn abuse_count(&self, identity: &str) -> u32 {
        self.quotas
            .get(identity)
            .map(|q| q.abuse_count)
            .unwrap_or(0)
    }

    /// Restore both buckets to capacity and clear the consecutive-block counter.
    pub fn reset(&self, identity: &str) {
        let now = self.clock.now_millis();
        if let Some(mut quota) = self.quotas.get_mut(identity) {
            let abuse_count = quota.abuse_count;
            *quota = IdentityQuota::new(&self.config, now);
            quota.abuse_count = abuse_count;
            tracing::info!(identity = %identity, "Rate limit reset");
        }
    }

    /// Current quota without consuming a token.
    pub fn peek(&self, identity: &str) -> QuotaStatus {
        let now = self.clock.now_millis();
        match self.quotas.get(identity) {
            Some(quota) => QuotaStatus {
                identity: identity.to_string(),
                minute_remaining: quota.minute.available_at(now),
                hour_remaining: quota.hour.available_at(now),
                limit: self.config.requests_per_minute,
                consecutive_blocks: quota.consecutive_blocks,
                abuse_count: quota.abuse_count,
            },
            None => QuotaStatus {
                identity: identity.to_string(),
                minute_remaining: self.config.requests_per_minute,
                hour_remaining: self.config.requests_per_hour,
                limit: self.config.requests_per_minute,
                consecutive_blocks: 0,
                abuse_count: 0,
            },
        }
    }

    /// Drop identities that have been idle longer than the configured TTL.
    pub fn cleanup_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let removed = eviction::sweep_idle(
            &self.quotas,
            now,
            self.config.idle_ttl_secs * MILLIS_PER_SEC,
            |q| q.last_seen,
        );
        metrics::record_tracked("rate_limiter", self.quotas.len());
        removed
    }

    pub fn tracked_identities(&self) -> usize {
        self.quotas.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter(per_minute: u32, per_hour: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = RateLimitConfig {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
            ..Default::default()
        };
        (RateLimiter::new(config, clock.clone()).unwrap(), clock)
    }

    #[test]
    fn test_minute_window_scenario() {
        let (limiter, clock) = limiter(2, 1000);

        let first = limiter.check("k1");
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = limiter.check("k1");
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        clock.advance(Duration::from_secs(30));
        let third = limiter.check("k1");
        assert!(!third.allowed);
        assert_eq!(third.exceeded_window, Some(Window::Minute));
        let retry = third.retry_after_secs.unwrap();
        assert!((1..=60).contains(&retry));
        assert_eq!(retry, 30);
    }

    #[test]
    fn test_refill_after_window() {
        let (limiter, clock) = limiter(1, 1000);
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);

        clock.advance(Duration::from_secs(60));
        assert!(limiter.check("a").allowed);
    }

    #[test]
    fn test_retry_after_never_below_one() {
        let (limiter, clock) = limiter(1, 1000);
        assert!(limiter.check("a").allowed);
        clock.advance(Duration::from_millis(59_900));
        assert_eq!(limiter.check("a").retry_after_secs, Some(1));
    }

    #[test]
    fn test_hour_rejection_refunds_minute_token() {
        let (limiter, _clock) = limiter(10, 2);
        assert!(limiter.check("a").allowed);
        assert!(limiter.check("a").allowed);

        let before = limiter.peek("a").minute_remaining;
        let decision = limiter.check("a");
        assert!(!decision.allowed);
        assert_eq!(decision.exceeded_window, Some(Window::Hour));
        assert_eq!(limiter.peek("a").minute_remaining, before);
    }

    #[test]
    fn test_remaining_is_min_of_windows() {
        let (limiter, _clock) = limiter(10, 3);
        assert_eq!(limiter.check("a").remaining, 2);
    }

    #[test]
    fn test_escalation_every_three_blocks() {
        let (limiter, _clock) = limiter(1, 1000);
        assert!(limiter.check("a").allowed);

        assert!(!limiter.check("a").escalated);
        assert!(!limiter.check("a").escalated);
        assert!(limiter.check("a").escalated);
        assert_eq!(limiter.abuse_count("a"), 1);

        for _ in 0..3 {
            limiter.check("a");
        }
        assert_eq!(limiter.abuse_count("a"), 2);
    }

    #[test]
    fn test_allowed_request_clears_consecutive_blocks() {
        let (limiter, clock) = limiter(1, 1000);
        assert!(limiter.check("a").allowed);
        limiter.check("a");
        limiter.check("a");
        clock.advance(Duration::from_secs(60));
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").escalated);
        assert_eq!(limiter.peek("a").consecutive_blocks, 1);
    }

    #[test]
    fn test_reset_restores_capacity() {
        let (limiter, _clock) = limiter(5, 1000);
        for _ in 0..7 {
            limiter.check("a");
        }
        limiter.reset("a");

        let decision = limiter.check("a");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(limiter.peek("a").consecutive_blocks, 0);
    }

    #[test]
    fn test_identities_are_independent() {
        let (limiter, _clock) = limiter(1, 1000);
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
    }

    #[test]
    fn test_never_exceeds_capacity_within_window() {
        let (limiter, clock) = limiter(60, 1000);
        let mut allowed = 0;
        for _ in 0..240 {
            if limiter.check("a").allowed {
                allowed += 1;
            }
            clock.advance(Duration::from_millis(200));
        }
        // 240 calls over 48 seconds never cross a refill.
        assert_eq!(allowed, 60);
    }

    #[test]
    fn test_hour_capacity_holds_across_minutes() {
        let (limiter, clock) = limiter(60, 100);
        let mut allowed = 0;
        for _ in 0..30 {
            for _ in 0..60 {
                if limiter.check("a").allowed {
                    allowed += 1;
                }
            }
            clock.advance(Duration::from_secs(60));
        }
        assert_eq!(allowed, 100);
    }

    #[test]
    fn test_disabled_allows_everything() {
        let clock = Arc::new(ManualClock::new(0));
        let config = RateLimitConfig {
            enabled: false,
            requests_per_minute: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config, clock).unwrap();
        for _ in 0..10 {
            assert!(limiter.check("a").allowed);
        }
        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let config = RateLimitConfig {
            requests_per_minute: 0,
            ..Default::default()
        };
        assert!(matches!(
            RateLimiter::new(config, clock),
            Err(ShieldError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_cleanup_idle_and_capacity_bound() {
        let clock = Arc::new(ManualClock::new(0));
        let config = RateLimitConfig {
            max_tracked_identities: 2,
            idle_ttl_secs: 10,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config, clock.clone()).unwrap();
        limiter.check("a");
        clock.advance(Duration::from_secs(1));
        limiter.check("b");
        clock.advance(Duration::from_secs(1));
        limiter.check("c");
        assert_eq!(limiter.tracked_identities(), 2);
        assert_eq!(limiter.peek("a").consecutive_blocks, 0);

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.cleanup_idle(), 2);
        assert_eq!(limiter.tracked_identities(), 0);
    }
}
