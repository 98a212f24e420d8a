//! Per-model admission control for outgoing calls.
//!
//! Each model key gets its own bucket: a semaphore bounding in-flight calls
//! and a next-free-slot clock spacing call starts by a minimum interval.
//! Buckets are created on first use and live as long as the limiter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("request cancelled")]
pub struct Cancelled;

/// Limits applied to one model key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    pub max_concurrent: usize,
    /// Minimum spacing between the starts of two calls.
    pub min_interval: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            min_interval: Duration::ZERO,
        }
    }
}

impl RateLimit {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            min_interval,
        }
    }

    /// Spacing that yields at most `rpm` call starts per minute.
    pub fn per_minute(max_concurrent: usize, rpm: u32) -> Self {
        let min_interval = if rpm == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / rpm
        };
        Self::new(max_concurrent, min_interval)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default: RateLimit,
    /// Overrides keyed by model key.
    pub models: HashMap<String, RateLimit>,
}

impl RateLimitConfig {
    /// Default limit from `PROMPTGRID_MAX_CONCURRENT` and
    /// `PROMPTGRID_REQUESTS_PER_MINUTE`; unset or unparsable values keep
    /// the built-in defaults.
    pub fn from_env() -> Self {
        let base = RateLimit::default();
        let max_concurrent = env_parse::<usize>("PROMPTGRID_MAX_CONCURRENT").unwrap_or(base.max_concurrent);
        let default = match env_parse::<u32>("PROMPTGRID_REQUESTS_PER_MINUTE") {
            Some(rpm) => RateLimit::per_minute(max_concurrent, rpm),
            None => RateLimit::new(max_concurrent, base.min_interval),
        };
        Self {
            default,
            models: HashMap::new(),
        }
    }

    pub fn with_default(mut self, limit: RateLimit) -> Self {
        self.default = limit;
        self
    }

    pub fn with_model_limit(mut self, model_key: impl Into<String>, limit: RateLimit) -> Self {
        self.models.insert(model_key.into(), limit);
        self
    }

    pub fn limit_for(&self, model_key: &str) -> RateLimit {
        self.models.get(model_key).copied().unwrap_or(self.default)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable rate limit setting");
            None
        }
    }
}

struct Bucket {
    limit: RateLimit,
    semaphore: Arc<Semaphore>,
    next_slot: tokio::sync::Mutex<Instant>,
}

impl Bucket {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit.max_concurrent.max(1))),
            next_slot: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    /// Reserve the next start slot and sleep until it arrives.
    async fn wait_for_slot(&self) {
        if self.limit.min_interval.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.limit.min_interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Shared per-model throttle. Construct once and share via `Arc` to
/// throttle across pipelines.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(RateLimitConfig::from_env())
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn bucket(&self, model_key: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(model_key.to_string())
            .or_insert_with(|| Arc::new(Bucket::new(self.config.limit_for(model_key))))
            .clone()
    }

    /// Run `perform` once a permit and a start slot for `model_key` are
    /// available.
    ///
    /// `should_cancel` is checked immediately before `perform` is invoked and
    /// again right after it completes; either positive check yields
    /// [`Cancelled`] and, in the first case, `perform` never runs.
    pub async fn throttle<F, Fut, T>(
        &self,
        model_key: &str,
        should_cancel: &(dyn Fn() -> bool + Send + Sync),
        perform: F,
    ) -> Result<T, Cancelled>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let bucket = self.bucket(model_key);
        let _permit = bucket
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Cancelled)?;
        bucket.wait_for_slot().await;

        if should_cancel() {
            tracing::debug!(model = model_key, "cancelled before call");
            return Err(Cancelled);
        }
        let out = perform().await;
        if should_cancel() {
            tracing::debug!(model = model_key, "cancelled after call");
            return Err(Cancelled);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn never() -> impl Fn() -> bool + Send + Sync {
        || false
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrent_per_model() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default().with_default(RateLimit::new(2, Duration::ZERO)),
        ));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let cancel = never();
                limiter
                    .throttle("m", &cancel, || async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn models_do_not_block_each_other() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default().with_default(RateLimit::new(1, Duration::ZERO)),
        ));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let blocked = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let cancel = never();
                limiter
                    .throttle("slow", &cancel, || async {
                        release_rx.await.ok();
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancel = never();
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            limiter.throttle("fast", &cancel, || async { 7 }),
        )
        .await
        .expect("other model was blocked");
        assert_eq!(other, Ok(7));

        release_tx.send(()).unwrap();
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn spaces_call_starts_by_min_interval() {
        let limiter = RateLimiter::new(
            RateLimitConfig::default()
                .with_model_limit("spaced", RateLimit::new(4, Duration::from_millis(40))),
        );
        let cancel = never();
        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.throttle("spaced", &cancel, || async {}).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(80));

        let unspaced = std::time::Instant::now();
        for _ in 0..3 {
            limiter.throttle("other", &cancel, || async {}).await.unwrap();
        }
        assert!(unspaced.elapsed() < Duration::from_millis(80));
    }

    #[tokio::test]
    async fn cancellation_before_call_skips_perform() {
        let limiter = RateLimiter::default();
        let called = AtomicBool::new(false);
        let cancel = || true;
        let result = limiter
            .throttle("m", &cancel, || async {
                called.store(true, Ordering::SeqCst);
            })
            .await;
        assert_eq!(result, Err(Cancelled));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellation_during_call_discards_result() {
        let limiter = RateLimiter::default();
        let flag = Arc::new(AtomicBool::new(false));
        let cancel = {
            let flag = flag.clone();
            move || flag.load(Ordering::SeqCst)
        };
        let result = limiter
            .throttle("m", &cancel, || async {
                flag.store(true, Ordering::SeqCst);
                "done"
            })
            .await;
        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn per_minute_converts_to_interval() {
        assert_eq!(RateLimit::per_minute(1, 120).min_interval, Duration::from_millis(500));
        assert_eq!(RateLimit::per_minute(1, 0).min_interval, Duration::ZERO);
        assert_eq!(RateLimit::new(0, Duration::ZERO).max_concurrent, 1);
    }

    #[test]
    fn model_overrides_fall_back_to_default() {
        let config = RateLimitConfig::default()
            .with_default(RateLimit::new(3, Duration::ZERO))
            .with_model_limit("gpt", RateLimit::new(1, Duration::from_secs(1)));
        assert_eq!(config.limit_for("gpt").max_concurrent, 1);
        assert_eq!(config.limit_for("claude").max_concurrent, 3);
    }
}
