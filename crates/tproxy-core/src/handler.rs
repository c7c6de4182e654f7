//! Entity handler: the first stop for a decoded entity, before it reaches
//! the sender-task pool's ring channel.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tproxy_ring::{Channel, Config, Producer};
use tracing::warn;

use crate::entities::HandlerKey;
use crate::errors::ValidationError;
use crate::validation::{now_millis, TimestampBounds, Validate};

/// Lock-free counters for one handler. `Ordering::Relaxed` throughout: these
/// are statistics a periodic reporter samples, not synchronization points.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    pub received: AtomicU64,
    pub sent: AtomicU64,
    pub delivered: AtomicU64,
    pub blocked: AtomicU64,
    pub rejected: AtomicU64,
}

impl HandlerMetrics {
    pub fn snapshot(&self) -> HandlerMetricsSnapshot {
        HandlerMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerMetricsSnapshot {
    pub received: u64,
    pub sent: u64,
    pub delivered: u64,
    pub blocked: u64,
    pub rejected: u64,
}

/// A minimal running min/max/sum/count histogram, good enough for the
/// burst-rate and received-lag gauges the periodic stats reporter samples.
#[derive(Debug)]
pub struct RollingStat {
    inner: Mutex<RollingStatInner>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RollingStatInner {
    count: u64,
    sum: f64,
    max: f64,
}

impl Default for RollingStat {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RollingStatInner::default()),
        }
    }
}

impl RollingStat {
    pub fn record(&self, value: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.count += 1;
        inner.sum += value;
        inner.max = inner.max.max(value);
    }

    /// Returns `(mean, max)` and resets the window.
    pub fn take(&self) -> (f64, f64) {
        let mut inner = self.inner.lock().unwrap();
        let result = if inner.count == 0 {
            (0.0, 0.0)
        } else {
            (inner.sum / inner.count as f64, inner.max)
        };
        *inner = RollingStatInner::default();
        result
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("handler's sender-task pool ring channel is closed")]
    Closed,
    #[error("every producer ring is full")]
    Full,
    #[error("entity failed validation: {0}")]
    Rejected(#[from] ValidationError),
}

/// A token-bucket gate guarding a noisy log line: callers call
/// [`try_acquire`](Self::try_acquire) before logging and skip the line if it
/// returns `false`, so one misbehaving client can't flood the log.
pub struct LogRateGate {
    interval: Duration,
    last: Mutex<Instant>,
}

impl LogRateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(Instant::now() - interval),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Receives decoded entities for one `HandlerKey`, validates/logs them, and
/// hands accepted items to the sender-task pool through a lock-free MPSC
/// ring channel — one [`Producer`] per sender task.
pub struct EntityHandler<T> {
    key: HandlerKey,
    channel: Arc<Channel<T>>,
    producers: Vec<Producer<T>>,
    next_producer: AtomicUsize,
    metrics: Arc<HandlerMetrics>,
    burst_rate: RollingStat,
    received_lag: RollingStat,
    blocked_log_gate: LogRateGate,
    timestamp_bounds: TimestampBounds,
}

impl<T> EntityHandler<T> {
    /// Builds a handler with `sender_count` ring producers, one per sender
    /// task in the pool that will consume from `channel`.
    pub fn new(key: HandlerKey, channel: Arc<Channel<T>>, sender_count: usize) -> Self {
        let producers = (0..sender_count)
            .map(|_| channel.register().expect("sender_count <= channel's max_producers"))
            .collect();
        Self {
            key,
            channel,
            producers,
            next_producer: AtomicUsize::new(0),
            metrics: Arc::new(HandlerMetrics::default()),
            burst_rate: RollingStat::default(),
            received_lag: RollingStat::default(),
            blocked_log_gate: LogRateGate::new(Duration::from_secs(5)),
            timestamp_bounds: TimestampBounds::default(),
        }
    }

    /// Overrides the default acceptance window used to validate reported
    /// timestamps.
    pub fn with_timestamp_bounds(mut self, bounds: TimestampBounds) -> Self {
        self.timestamp_bounds = bounds;
        self
    }

    pub fn key(&self) -> &HandlerKey {
        &self.key
    }

    pub fn metrics(&self) -> Arc<HandlerMetrics> {
        self.metrics.clone()
    }

    /// Round-robin across producers, skipping ones whose ring looks
    /// unusually backed-up compared to the rest (worst-avoidance): a single
    /// slow sender task shouldn't starve the others of work.
    fn pick_producer(&self) -> usize {
        let count = self.producers.len();
        let start = self.next_producer.fetch_add(1, Ordering::Relaxed) % count;
        if count == 1 {
            return 0;
        }

        let lens: Vec<usize> = (0..count)
            .map(|i| self.channel.get_ring(i).map(|r| r.len()).unwrap_or(0))
            .collect();
        let avg: usize = lens.iter().sum::<usize>() / count;

        for offset in 0..count {
            let idx = (start + offset) % count;
            if lens[idx] <= avg.saturating_mul(3) / 2 || offset == count - 1 {
                return idx;
            }
        }
        start
    }
}

impl<T: Clone + Validate> EntityHandler<T> {
    /// Validates a preprocessed entity and, if it passes, hands it to the
    /// sender-task pool. Tries every producer before giving up so a single
    /// full ring doesn't drop work that another sender task has room for.
    pub fn report(&self, item: T) -> Result<(), SubmitError> {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        if self.channel.is_closed() {
            return Err(SubmitError::Closed);
        }
        if let Err(e) = item.validate(&self.timestamp_bounds, now_millis()) {
            self.reject(&e.to_string());
            return Err(SubmitError::Rejected(e));
        }

        let start = self.pick_producer();
        let count = self.producers.len();
        for offset in 0..count {
            let idx = (start + offset) % count;
            let candidate = if offset + 1 == count {
                item
            } else {
                item.clone()
            };
            if self.producers[idx].push(candidate) {
                self.metrics.sent.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            if offset + 1 == count {
                break;
            }
        }
        Err(SubmitError::Full)
    }

    /// Counts and logs a validated entity that a preprocessor rule or quota
    /// dropped before it ever reached the pool.
    pub fn block(&self, reason: &str) {
        self.metrics.blocked.fetch_add(1, Ordering::Relaxed);
        if self.blocked_log_gate.try_acquire() {
            warn!(
                entity_type = self.key.entity_type.as_str(),
                handle = %self.key.handle,
                reason,
                "blocking entity"
            );
        }
    }

    /// Counts a malformed entity that failed validation outright. A reject
    /// is also a block (the item never reaches the sender-task pool either
    /// way), so both counters move. Logged at full rate in addition to the
    /// shared rate-limited line, since rejects point at a client sending bad
    /// data and shouldn't get lost in the same throttling that protects
    /// against a noisy backlog of ordinary blocks.
    pub fn reject(&self, reason: &str) {
        self.metrics.blocked.fetch_add(1, Ordering::Relaxed);
        self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(
            entity_type = self.key.entity_type.as_str(),
            handle = %self.key.handle,
            reason,
            "rejecting entity"
        );
        if self.blocked_log_gate.try_acquire() {
            warn!(
                entity_type = self.key.entity_type.as_str(),
                handle = %self.key.handle,
                reason,
                "rejecting entity (rate-limited line)"
            );
        }
    }

    pub fn record_delivered(&self, n: u64) {
        self.metrics.delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_burst_rate(&self, items_per_sec: f64) {
        self.burst_rate.record(items_per_sec);
    }

    pub fn record_received_lag(&self, lag_ms: f64) {
        self.received_lag.record(lag_ms);
    }

    pub fn take_burst_rate(&self) -> (f64, f64) {
        self.burst_rate.take()
    }

    pub fn take_received_lag(&self) -> (f64, f64) {
        self.received_lag.take()
    }
}

/// Default ring sizing for a handler's channel: matches the teacher's
/// `CollectorConfig` defaults (4096-slot rings, metrics on).
pub fn default_channel_config(sender_count: usize) -> Config {
    Config::new(12, sender_count, true)
}
