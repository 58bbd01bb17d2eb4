//! Per-client token buckets.
//!
//! Each identity (usually a client IP) gets a bucket holding up to `burst`
//! tokens, refilled continuously at `requests_per_minute`. A request costs
//! one token; a request that finds less than one is rejected. Buckets idle
//! for longer than the cleanup interval are forgotten.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Settings {
    /// Sustained refill rate.
    pub requests_per_minute: u32,
    /// Bucket capacity; how many requests a fresh or rested client may fire
    /// at once.
    pub burst: u32,
    /// How often idle buckets are swept, and how long a bucket must be idle
    /// to be swept.
    pub cleanup: Duration,
}
impl Default for Settings {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 10,
            cleanup: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token bucket table. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    settings: Settings,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spend one token of `identity`'s bucket, if it has one.
    pub fn allow(&self, identity: &str) -> bool {
        let now = Instant::now();
        let burst = f64::from(self.settings.burst);
        let mut buckets = self.buckets();
        let Some(bucket) = buckets.get_mut(identity) else {
            // First sight: full bucket, minus this request.
            buckets.insert(
                identity.to_string(),
                Bucket {
                    tokens: burst - 1.0,
                    last_refill: now,
                },
            );
            return true;
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refill = elapsed.as_secs_f64() * f64::from(self.settings.requests_per_minute) / 60.0;
        bucket.tokens = (bucket.tokens + refill).min(burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            tracing::debug!(identity, tokens = bucket.tokens, "Rate limit exceeded");
            false
        }
    }

    /// Forget buckets that have been idle for longer than the cleanup
    /// interval. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let cleanup = self.settings.cleanup;
        let mut buckets = self.buckets();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= cleanup);
        before - buckets.len()
    }

    /// Number of identities currently tracked.
    pub fn len(&self) -> usize {
        self.buckets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep idle buckets every cleanup interval until cancelled.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.settings.cleanup);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let swept = limiter.sweep();
                        if swept > 0 {
                            tracing::debug!(swept, remaining = limiter.len(), "Swept idle rate limit buckets");
                        }
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn limiter(requests_per_minute: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(Settings {
            requests_per_minute,
            burst,
            cleanup: Duration::from_secs(300),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let limiter = limiter(60, 10);
        for _ in 0..10 {
            assert!(limiter.allow("10.0.0.1"));
        }
        assert!(!limiter.allow("10.0.0.1"));

        tokio::time::advance(Duration::from_secs(60)).await;
        // Refill is capped at the burst size.
        for _ in 0..10 {
            assert!(limiter.allow("10.0.0.1"));
        }
        assert!(!limiter.allow("10.0.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn identities_are_independent() {
        let limiter = limiter(60, 1);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.len(), 2);
    }

    #[rstest]
    #[case(500, false)]
    #[case(1000, true)]
    #[tokio::test(start_paused = true)]
    async fn fractional_tokens_accumulate(#[case] wait_millis: u64, #[case] allowed: bool) {
        // One token per second.
        let limiter = limiter(60, 1);
        assert!(limiter.allow("a"));
        tokio::time::advance(Duration::from_millis(wait_millis / 2)).await;
        assert!(!limiter.allow("a"));
        tokio::time::advance(Duration::from_millis(wait_millis - wait_millis / 2)).await;
        assert_eq!(limiter.allow("a"), allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_forgets_idle_buckets() {
        let limiter = limiter(60, 10);
        limiter.allow("idle");
        tokio::time::advance(Duration::from_secs(200)).await;
        limiter.allow("active");
        tokio::time::advance(Duration::from_secs(200)).await;

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.len(), 1);
        // A forgotten client starts over with a full bucket.
        for _ in 0..10 {
            assert!(limiter.allow("idle"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_cancelled() {
        let limiter = limiter(60, 10);
        let cancel = CancellationToken::new();
        let sweeper = limiter.spawn_sweeper(cancel.clone());
        limiter.allow("a");

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert!(limiter.is_empty());

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
