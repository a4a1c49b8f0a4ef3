//! Sliding-window rate limiting keyed by client identifier (spec.md §4.9):
//! user id when authenticated, else forwarded IP, else `"default"`.
//!
//! Uses `governor`'s GCRA implementation the same way
//! `sven-gateway::http::auth::AuthState` uses it for per-IP auth-failure
//! throttling, but keyed generically and applied to every request rather
//! than only failed auth attempts.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::Clock;
use governor::clock::DefaultClock;
use governor::state::keyed::DashMapStateStore;
use governor::Quota;
use governor::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Option<Duration>,
    pub limit: u32,
    pub reset: Duration,
}

/// The pluggable seam spec.md §4.9 describes ("optional pluggable
/// distributed backend"): anything that can answer "is this key still
/// within budget" can back a `ClientRateLimiter`. The in-process GCRA
/// limiter below is the only implementation shipped here; a distributed
/// backend (Redis, e.g.) would implement this trait against a shared
/// counter instead of the in-memory `DashMapStateStore`.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn check(&self, key: &str) -> RateLimitDecision;
}

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

struct GovernorBackend {
    limiter: KeyedLimiter,
    limit: u32,
}

impl GovernorBackend {
    fn new(window: Duration, max_requests: u32) -> Self {
        let per_window = NonZeroU32::new(max_requests).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(window)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(per_window);
        Self {
            limiter: RateLimiter::keyed(quota),
            limit: max_requests,
        }
    }
}

#[async_trait]
impl RateLimitBackend for GovernorBackend {
    async fn check(&self, key: &str) -> RateLimitDecision {
        match self.limiter.check_key(&key.to_string()) {
            Ok(_) => RateLimitDecision {
                allowed: true,
                remaining: self.limit.saturating_sub(1),
                retry_after: None,
                limit: self.limit,
                reset: Duration::from_secs(0),
            },
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after: Some(wait),
                    limit: self.limit,
                    reset: wait,
                }
            }
        }
    }
}

/// Front door for the middleware in `server.rs`: delegates the actual
/// counting to a `RateLimitBackend` and owns the skip-paths list.
pub struct ClientRateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    skip_paths: Vec<String>,
}

impl ClientRateLimiter {
    /// Default in-process limiter backed by `governor`'s GCRA.
    pub fn new(window: Duration, max_requests: u32, skip_paths: Vec<String>) -> Self {
        Self::with_backend(Arc::new(GovernorBackend::new(window, max_requests)), skip_paths)
    }

    /// Swaps in a distributed or otherwise custom backend, keeping the
    /// same skip-paths and middleware wiring.
    pub fn with_backend(backend: Arc<dyn RateLimitBackend>, skip_paths: Vec<String>) -> Self {
        Self { backend, skip_paths }
    }

    pub fn is_skipped(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| p == path)
    }

    pub async fn check(&self, key: &str) -> RateLimitDecision {
        self.backend.check(key).await
    }
}

/// `user id -> forwarded IP -> "default"`, per spec.md §4.9's key
/// derivation order.
pub fn rate_limit_key(subject: Option<&str>, forwarded_ip: Option<&str>) -> String {
    subject
        .or(forwarded_ip)
        .unwrap_or("default")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_key_prefers_subject_then_ip_then_default() {
        assert_eq!(rate_limit_key(Some("user-1"), Some("1.2.3.4")), "user-1");
        assert_eq!(rate_limit_key(None, Some("1.2.3.4")), "1.2.3.4");
        assert_eq!(rate_limit_key(None, None), "default");
    }

    #[tokio::test]
    async fn within_burst_requests_are_allowed() {
        let limiter = ClientRateLimiter::new(Duration::from_secs(60), 3, Vec::new());
        assert!(limiter.check("client-a").await.allowed);
        assert!(limiter.check("client-a").await.allowed);
        assert!(limiter.check("client-a").await.allowed);
    }

    #[tokio::test]
    async fn exceeding_the_limit_is_rejected_with_retry_after() {
        let limiter = ClientRateLimiter::new(Duration::from_secs(60), 1, Vec::new());
        assert!(limiter.check("client-b").await.allowed);
        let decision = limiter.check("client-b").await;
        assert!(!decision.allowed);
        assert!(decision.retry_after.is_some());
    }

    #[tokio::test]
    async fn different_keys_do_not_share_a_budget() {
        let limiter = ClientRateLimiter::new(Duration::from_secs(60), 1, Vec::new());
        assert!(limiter.check("client-c").await.allowed);
        assert!(limiter.check("client-d").await.allowed);
    }

    #[test]
    fn skip_paths_are_recognized() {
        let limiter = ClientRateLimiter::new(Duration::from_secs(60), 1, vec!["/health".to_string()]);
        assert!(limiter.is_skipped("/health"));
        assert!(!limiter.is_skipped("/rpc"));
    }
}
