//! Rate limiters gating how fast the sender-task pool submits batches.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::{Interval, MissedTickBehavior};

/// Something that can delay a caller to respect a rate.
pub trait RateLimiter: Send {
    fn wait(&mut self) -> impl Future<Output = ()> + Send;

    fn target_rate(&self) -> Option<f64> {
        None
    }
}

/// Object-safe counterpart of [`RateLimiter`], for dynamic dispatch in the
/// resilient-sender builder.
pub trait RateLimiterBoxed: Send {
    fn wait_boxed(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
    fn target_rate(&self) -> Option<f64>;
}

impl<R: RateLimiter> RateLimiterBoxed for R {
    fn wait_boxed(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.wait())
    }

    fn target_rate(&self) -> Option<f64> {
        RateLimiter::target_rate(self)
    }
}

/// Fixed-interval limiter: one permit every `1 / rate_per_sec` seconds.
pub struct IntervalRateLimiter {
    interval: Option<Interval>,
    rate_per_sec: f64,
}

impl IntervalRateLimiter {
    pub fn new(period: Duration) -> Self {
        let rate_per_sec = if period.is_zero() {
            0.0
        } else {
            1.0 / period.as_secs_f64()
        };
        let mut interval = tokio::time::interval(period.max(Duration::from_nanos(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval: Some(interval),
            rate_per_sec,
        }
    }

    pub fn from_rate(rate_per_sec: f64) -> Self {
        assert!(rate_per_sec > 0.0, "rate_per_sec must be positive");
        Self::new(Duration::from_secs_f64(1.0 / rate_per_sec))
    }

    pub fn unlimited() -> Self {
        Self {
            interval: None,
            rate_per_sec: 0.0,
        }
    }
}

impl RateLimiter for IntervalRateLimiter {
    async fn wait(&mut self) {
        if let Some(interval) = &mut self.interval {
            interval.tick().await;
        }
    }

    fn target_rate(&self) -> Option<f64> {
        self.interval.as_ref().map(|_| self.rate_per_sec)
    }
}

/// A classic token bucket: refills continuously at `rate_per_sec`, capped at
/// `burst`. Unlike [`IntervalRateLimiter`] this lets callers spend a burst of
/// saved-up tokens instantly, then throttles once the bucket is empty.
pub struct TokenBucketRateLimiter {
    rate_per_sec: f64,
    burst: f64,
    tokens: Mutex<(f64, Instant)>,
}

impl TokenBucketRateLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        assert!(rate_per_sec > 0.0, "rate_per_sec must be positive");
        Self {
            rate_per_sec,
            burst,
            tokens: Mutex::new((burst, Instant::now())),
        }
    }

    fn refill_and_take(&self) -> Option<Duration> {
        let mut guard = self.tokens.lock().unwrap();
        let (tokens, last) = &mut *guard;
        let elapsed = last.elapsed();
        *tokens = (*tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.burst);
        *last = Instant::now();

        if *tokens >= 1.0 {
            *tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - *tokens;
            Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
        }
    }
}

impl RateLimiter for TokenBucketRateLimiter {
    async fn wait(&mut self) {
        loop {
            match self.refill_and_take() {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    fn target_rate(&self) -> Option<f64> {
        Some(self.rate_per_sec)
    }
}

/// No rate control of its own — just yields, relying entirely on upstream
/// backpressure (a full ring, a saturated semaphore) to pace submissions.
pub struct YieldingRateLimiter;

impl RateLimiter for YieldingRateLimiter {
    async fn wait(&mut self) {
        tokio::task::yield_now().await;
    }
}

/// A handle to a [`TunableRateLimiter`]'s shared rate slot. Cloning shares
/// the same underlying rate — the check-in tunable-apply path holds one of
/// these and calls [`set_rate`](Self::set_rate) whenever the backend pushes
/// a new limit, which the limiter's next `wait()` picks up without either
/// side needing to coordinate beyond the atomic.
#[derive(Clone)]
pub struct RateLimiterHandle(Arc<AtomicU64>);

impl RateLimiterHandle {
    /// Sets the target rate in requests/sec. A non-positive rate means
    /// unlimited.
    pub fn set_rate(&self, rate_per_sec: f64) {
        self.0.store(rate_per_sec.to_bits(), Ordering::Relaxed);
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// A token-bucket limiter whose rate can be retuned from outside while
/// submissions are in flight, via a cloned [`RateLimiterHandle`] — unlike
/// [`TokenBucketRateLimiter`], which fixes its rate at construction.
pub struct TunableRateLimiter {
    rate_bits: Arc<AtomicU64>,
    burst: f64,
    tokens: Mutex<(f64, Instant)>,
}

impl TunableRateLimiter {
    pub fn new(initial_rate_per_sec: f64, burst: f64) -> Self {
        Self {
            rate_bits: Arc::new(AtomicU64::new(initial_rate_per_sec.to_bits())),
            burst,
            tokens: Mutex::new((burst, Instant::now())),
        }
    }

    pub fn handle(&self) -> RateLimiterHandle {
        RateLimiterHandle(self.rate_bits.clone())
    }

    fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    fn refill_and_take(&self, rate: f64) -> Option<Duration> {
        let mut guard = self.tokens.lock().unwrap();
        let (tokens, last) = &mut *guard;
        let elapsed = last.elapsed();
        *tokens = (*tokens + elapsed.as_secs_f64() * rate).min(self.burst);
        *last = Instant::now();

        if *tokens >= 1.0 {
            *tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - *tokens;
            Some(Duration::from_secs_f64(deficit / rate))
        }
    }
}

impl RateLimiter for TunableRateLimiter {
    async fn wait(&mut self) {
        loop {
            let rate = self.rate();
            if rate <= 0.0 {
                return;
            }
            match self.refill_and_take(rate) {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    fn target_rate(&self) -> Option<f64> {
        let rate = self.rate();
        if rate > 0.0 {
            Some(rate)
        } else {
            None
        }
    }
}

/// Wraps a boxed [`RateLimiterBoxed`] back up as an ordinary [`RateLimiter`],
/// so the resilient-sender builder can hold one of several concrete limiter
/// types behind a single field.
pub struct BoxedRateLimiter(pub Box<dyn RateLimiterBoxed>);

impl RateLimiter for BoxedRateLimiter {
    async fn wait(&mut self) {
        self.0.wait_boxed().await;
    }

    fn target_rate(&self) -> Option<f64> {
        self.0.target_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_rate_means_unlimited_and_never_waits() {
        let mut limiter = TunableRateLimiter::new(0.0, 1.0);
        assert_eq!(limiter.target_rate(), None);
        limiter.wait().await;
    }

    #[tokio::test]
    async fn handle_retunes_the_rate_the_next_wait_observes() {
        let mut limiter = TunableRateLimiter::new(1_000.0, 1.0);
        let handle = limiter.handle();
        assert_eq!(handle.rate(), 1_000.0);

        handle.set_rate(50.0);
        assert_eq!(limiter.target_rate(), Some(50.0));
    }
}
