//! Delta-counter and histogram accumulation between submission flushes.
//!
//! Backed by `RwLock<HashMap<..>>` with per-cell interior mutability rather
//! than a concurrent-map crate: the teacher's own code reaches for hand-rolled
//! atomics ahead of pulling in a crate it doesn't already depend on elsewhere,
//! and this follows the same instinct (see DESIGN.md).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::entities::{Histogram, HostMetricTagsPair};
use crate::errors::PreprocessorError;

/// A single delta-counter cell: accumulates via `fetch_add`, and flushing
/// reads-and-resets to zero atomically (so a concurrent increment during
/// flush is never lost, just attributed to the next window).
struct CounterCell {
    bits: AtomicU64,
    last_touched: Mutex<Instant>,
}

impl CounterCell {
    fn new() -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
            last_touched: Mutex::new(Instant::now()),
        }
    }

    fn add(&self, delta: f64) {
        *self.last_touched.lock().unwrap() = Instant::now();
        loop {
            let current = self.bits.load(Ordering::Relaxed);
            let new = (f64::from_bits(current) + delta).to_bits();
            if self
                .bits
                .compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Reads the accumulated value and resets the cell to zero, returning
    /// `None` if there was nothing to flush (so callers can skip emitting a
    /// zero-valued point).
    fn take(&self) -> Option<f64> {
        let value = f64::from_bits(self.bits.swap(0f64.to_bits(), Ordering::Relaxed));
        if value == 0.0 {
            None
        } else {
            Some(value)
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_touched.lock().unwrap().elapsed()
    }
}

/// Accumulates delta counters and histograms keyed by host/metric/tags,
/// flushed by a periodic task into the sender-task pool.
pub struct Accumulator {
    counters: RwLock<HashMap<HostMetricTagsPair, CounterCell>>,
    histograms: RwLock<HashMap<HostMetricTagsPair, Mutex<Histogram>>>,
    flush_interval: Duration,
}

impl Accumulator {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            flush_interval,
        }
    }

    /// Adds `delta` to the counter cell for `key`, creating it if absent.
    pub fn add_delta(&self, key: HostMetricTagsPair, delta: f64) {
        if let Some(cell) = self.counters.read().unwrap().get(&key) {
            cell.add(delta);
            return;
        }
        let mut counters = self.counters.write().unwrap();
        counters.entry(key).or_insert_with(CounterCell::new).add(delta);
    }

    /// Merges `histogram` into the accumulator cell for `key`, rejecting the
    /// merge (and leaving the existing cell untouched) if the incoming
    /// distribution's granularity is finer than what's already accumulated.
    pub fn put_histogram(
        &self,
        key: HostMetricTagsPair,
        histogram: Histogram,
    ) -> Result<(), PreprocessorError> {
        if let Some(cell) = self.histograms.read().unwrap().get(&key) {
            return cell.lock().unwrap().merge(histogram);
        }
        let mut histograms = self.histograms.write().unwrap();
        histograms
            .entry(key)
            .or_insert_with(|| Mutex::new(histogram_seed(&histogram)))
            .lock()
            .unwrap()
            .merge(histogram)
    }

    /// Reads-and-resets every non-zero counter, returning the delta points to
    /// emit this flush.
    pub fn flush_counters(&self) -> Vec<(HostMetricTagsPair, f64)> {
        let counters = self.counters.read().unwrap();
        counters
            .iter()
            .filter_map(|(key, cell)| cell.take().map(|value| (key.clone(), value)))
            .collect()
    }

    /// Drains every accumulated histogram, emptying the map.
    pub fn flush_histograms(&self) -> Vec<(HostMetricTagsPair, Histogram)> {
        let mut histograms = self.histograms.write().unwrap();
        histograms
            .drain()
            .map(|(key, cell)| (key, cell.into_inner().unwrap()))
            .collect()
    }

    /// Evicts counter cells idle for longer than 5x the flush interval, so a
    /// host/metric/tag combination that stops reporting doesn't pin memory
    /// forever. Any non-zero value still sitting in an evicted cell is
    /// returned for the caller to emit — eviction reclaims memory, it
    /// doesn't discard an unflushed delta.
    pub fn evict_idle(&self) -> Vec<(HostMetricTagsPair, f64)> {
        let ttl = self.flush_interval * 5;
        let stale: Vec<HostMetricTagsPair> = {
            let counters = self.counters.read().unwrap();
            counters
                .iter()
                .filter(|(_, cell)| cell.idle_for() >= ttl)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if stale.is_empty() {
            return Vec::new();
        }
        let mut counters = self.counters.write().unwrap();
        let mut emitted = Vec::new();
        for key in stale {
            // Re-check idleness under the write lock: a concurrent add()
            // between the scan above and taking this lock would otherwise
            // be discarded along with the cell.
            if counters
                .get(&key)
                .is_some_and(|cell| cell.idle_for() >= ttl)
            {
                if let Some(cell) = counters.remove(&key) {
                    if let Some(value) = cell.take() {
                        emitted.push((key, value));
                    }
                }
            }
        }
        emitted
    }

    pub fn counter_cell_count(&self) -> usize {
        self.counters.read().unwrap().len()
    }
}

fn histogram_seed(other: &Histogram) -> Histogram {
    Histogram {
        metric: other.metric.clone(),
        source: other.source.clone(),
        tags: other.tags.clone(),
        timestamp_ms: other.timestamp_ms,
        granularity: other.granularity,
        centroids: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(metric: &str) -> HostMetricTagsPair {
        HostMetricTagsPair {
            host: "host-a".into(),
            metric: metric.into(),
            tags: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn idle_eviction_emits_the_unflushed_delta_instead_of_discarding_it() {
        let accumulator = Accumulator::new(Duration::from_millis(1));
        accumulator.add_delta(key("my.ctr"), 7.0);
        std::thread::sleep(Duration::from_millis(20));

        let emitted = accumulator.evict_idle();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1, 7.0);
        assert_eq!(accumulator.counter_cell_count(), 0);
    }

    #[test]
    fn idle_eviction_drops_a_cell_with_nothing_pending() {
        let accumulator = Accumulator::new(Duration::from_millis(1));
        accumulator.add_delta(key("my.ctr"), 5.0);
        accumulator.flush_counters();
        std::thread::sleep(Duration::from_millis(20));

        let emitted = accumulator.evict_idle();
        assert!(emitted.is_empty());
        assert_eq!(accumulator.counter_cell_count(), 0);
    }
}
