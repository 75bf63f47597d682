use std::hash::Hash;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Interval between sweeps of idle per-key buckets.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Token-bucket settings. A non-positive `per_second` disables limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSettings {
    pub per_second: i64,
    pub burst: u32,
}

impl RateSettings {
    pub const DISABLED: RateSettings = RateSettings {
        per_second: -1,
        burst: 1,
    };

    pub fn new(per_second: i64, burst: u32) -> Self {
        Self { per_second, burst }
    }

    fn quota(&self) -> Option<Quota> {
        if self.per_second <= 0 {
            return None;
        }
        let rate = NonZeroU32::new(u32::try_from(self.per_second).unwrap_or(u32::MAX))?;
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        Some(Quota::per_second(rate).allow_burst(burst))
    }
}

struct Buckets<K: Hash + Eq + Clone> {
    keyed: DefaultKeyedRateLimiter<K>,
    global: Option<DefaultDirectRateLimiter>,
}

/// Per-key token buckets with an optional global bucket in front.
///
/// Buckets are created on first use of a key. `sweep` drops buckets that
/// have refilled completely, which keeps memory bounded by the number of
/// recently active keys. A disabled limiter allocates nothing and admits
/// every call.
pub struct RateLimiter<K: Hash + Eq + Clone> {
    buckets: Option<Buckets<K>>,
}

impl<K: Hash + Eq + Clone> RateLimiter<K> {
    pub fn new(settings: RateSettings) -> Self {
        let buckets = settings.quota().map(|quota| Buckets {
            keyed: DefaultKeyedRateLimiter::keyed(quota),
            global: None,
        });
        Self { buckets }
    }

    pub fn disabled() -> Self {
        Self { buckets: None }
    }

    /// Caps aggregate throughput independent of per-key limits. Has no
    /// effect on a disabled limiter.
    pub fn with_global(mut self, settings: RateSettings) -> Self {
        if let (Some(buckets), Some(quota)) = (self.buckets.as_mut(), settings.quota()) {
            buckets.global = Some(DefaultDirectRateLimiter::direct(quota));
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.buckets.is_some()
    }

    /// Non-blocking check; consumes a token when one is available.
    pub fn allow(&self, key: &K) -> bool {
        let Some(buckets) = &self.buckets else {
            return true;
        };
        // a sender over its own limit must not spend the shared budget
        if buckets.keyed.check_key(key).is_err() {
            return false;
        }
        match &buckets.global {
            Some(global) => global.check().is_ok(),
            None => true,
        }
    }

    /// Waits until both the global and the per-key bucket admit a call.
    pub async fn wait(&self, key: &K) {
        let Some(buckets) = &self.buckets else {
            return;
        };
        if let Some(global) = &buckets.global {
            global.until_ready().await;
        }
        buckets.keyed.until_key_ready(key).await;
    }

    /// Number of per-key buckets currently held.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.as_ref().map_or(0, |b| b.keyed.len())
    }

    /// Removes buckets that are back at full burst. Returns how many went.
    pub fn sweep(&self) -> usize {
        let Some(buckets) = &self.buckets else {
            return 0;
        };
        let before = buckets.keyed.len();
        buckets.keyed.retain_recent();
        buckets.keyed.shrink_to_fit();
        before.saturating_sub(buckets.keyed.len())
    }

    /// Runs `sweep` every `interval` until `cancel` fires.
    pub async fn run_sweeper(&self, interval: Duration, cancel: CancellationToken) {
        if !self.is_enabled() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        info!(removed, remaining = self.tracked_keys(), "swept idle rate buckets");
                    } else {
                        debug!(remaining = self.tracked_keys(), "rate bucket sweep found nothing idle");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_always_allows() {
        let limiter: RateLimiter<i64> = RateLimiter::new(RateSettings::DISABLED);
        assert!(!limiter.is_enabled());
        for _ in 0..1000 {
            assert!(limiter.allow(&42));
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_zero_rate_is_disabled() {
        let limiter: RateLimiter<i64> = RateLimiter::new(RateSettings::new(0, 5));
        assert!(!limiter.is_enabled());
        assert!(limiter.allow(&1));
    }

    #[test]
    fn test_exactly_burst_calls_pass() {
        let limiter = RateLimiter::new(RateSettings::new(1, 3));
        assert!(limiter.allow(&7));
        assert!(limiter.allow(&7));
        assert!(limiter.allow(&7));
        assert!(!limiter.allow(&7));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(RateSettings::new(1, 1));
        assert!(limiter.allow(&1));
        assert!(!limiter.allow(&1));
        assert!(limiter.allow(&2));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_refill_after_interval() {
        let limiter = RateLimiter::new(RateSettings::new(20, 1));
        assert!(limiter.allow(&1));
        assert!(!limiter.allow(&1));
        std::thread::sleep(Duration::from_millis(80));
        assert!(limiter.allow(&1));
    }

    #[test]
    fn test_global_bucket_caps_all_keys() {
        let limiter =
            RateLimiter::new(RateSettings::new(1, 10)).with_global(RateSettings::new(1, 2));
        assert!(limiter.allow(&1));
        assert!(limiter.allow(&2));
        assert!(!limiter.allow(&3));
    }

    #[test]
    fn test_denied_key_leaves_global_budget() {
        let limiter =
            RateLimiter::new(RateSettings::new(1, 1)).with_global(RateSettings::new(1, 2));
        assert!(limiter.allow(&1));
        for _ in 0..5 {
            assert!(!limiter.allow(&1));
        }
        assert!(limiter.allow(&2));
        assert!(!limiter.allow(&3));
    }

    #[test]
    fn test_sweep_removes_idle_buckets() {
        let limiter = RateLimiter::new(RateSettings::new(1000, 1));
        assert!(limiter.allow(&1));
        assert!(limiter.allow(&2));
        assert_eq!(limiter.tracked_keys(), 2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_sweep_keeps_busy_buckets() {
        let limiter = RateLimiter::new(RateSettings::new(1, 1));
        assert!(limiter.allow(&1));
        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_refill() {
        let limiter = RateLimiter::new(RateSettings::new(20, 1));
        let started = std::time::Instant::now();
        limiter.wait(&1).await;
        limiter.wait(&1).await;
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
