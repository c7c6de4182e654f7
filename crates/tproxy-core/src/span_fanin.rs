//! Trace/span fan-in: sampling, forwarding, and RED-metric derivation shared
//! by every span listener protocol (Jaeger, Zipkin, the native format).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::entities::{Span, SpanLogs};

pub const APPLICATION_TAG_KEY: &str = "application";
pub const SERVICE_TAG_KEY: &str = "service";
pub const CLUSTER_TAG_KEY: &str = "cluster";
pub const SHARD_TAG_KEY: &str = "shard";
pub const COMPONENT_TAG_KEY: &str = "component";

/// Decides whether a span is sampled. `SpanFanIn` ORs this with
/// `always_sample_errors`, so a sampler that always returns `false` still
/// lets error spans through when that flag is set.
pub trait Sampler: Send + Sync {
    fn decide(&self, span: &Span) -> bool;
}

/// A handle to a [`ProbabilitySampler`]'s shared probability slot. The
/// check-in tunable-apply path holds one of these and retunes the sampling
/// rate the backend pushed without needing a reference to the sampler
/// itself.
#[derive(Clone)]
pub struct SamplerHandle(Arc<AtomicU64>);

impl SamplerHandle {
    pub fn set_probability(&self, probability: f64) {
        let clamped = probability.clamp(0.0, 1.0);
        self.0.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn probability(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Samples independently at a probability in `[0.0, 1.0]`, retunable at
/// runtime through a cloned [`SamplerHandle`].
pub struct ProbabilitySampler {
    probability: Arc<AtomicU64>,
}

impl ProbabilitySampler {
    pub fn new(probability: f64) -> Self {
        assert!((0.0..=1.0).contains(&probability), "probability must be in [0, 1]");
        Self {
            probability: Arc::new(AtomicU64::new(probability.to_bits())),
        }
    }

    pub fn handle(&self) -> SamplerHandle {
        SamplerHandle(self.probability.clone())
    }
}

impl Sampler for ProbabilitySampler {
    fn decide(&self, _span: &Span) -> bool {
        let probability = f64::from_bits(self.probability.load(Ordering::Relaxed));
        rand::random::<f64>() < probability
    }
}

/// Key under which request-count/error-count/latency contributions are
/// aggregated, independent of whether the originating span was sampled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedKey {
    pub application: String,
    pub service: String,
    pub cluster: String,
    pub shard: String,
    pub component: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RedSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub mean_latency_millis: f64,
}

/// Request/error/latency counters for one [`RedKey`].
#[derive(Debug, Default)]
pub struct RedMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    duration_sum_bits: AtomicU64,
    duration_count: AtomicU64,
}

impl RedMetrics {
    fn record(&self, duration_millis: i64, is_error: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        loop {
            let current = self.duration_sum_bits.load(Ordering::Relaxed);
            let updated = (f64::from_bits(current) + duration_millis as f64).to_bits();
            if self
                .duration_sum_bits
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn snapshot(&self) -> RedSnapshot {
        let count = self.duration_count.load(Ordering::Relaxed);
        let sum = f64::from_bits(self.duration_sum_bits.load(Ordering::Relaxed));
        RedSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            mean_latency_millis: if count == 0 { 0.0 } else { sum / count as f64 },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpanFanInConfig {
    pub always_sample_errors: bool,
    pub heartbeat_interval: Duration,
    /// A `RedKey` with no spans for this long stops being returned by
    /// [`SpanFanIn::due_heartbeats`].
    pub heartbeat_ttl: Duration,
}

impl Default for SpanFanInConfig {
    fn default() -> Self {
        Self {
            always_sample_errors: true,
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_ttl: Duration::from_secs(300),
        }
    }
}

pub enum FanInOutcome {
    /// Sampled: forward to the span handler.
    Forward(Span, Option<SpanLogs>),
    /// Not sampled this time; RED metrics were still updated.
    NotSampled,
    /// Missing `application` or `service` tag; never forwarded or counted.
    Discarded,
}

/// Extracts the RED-metric key from a span's annotations.
///
/// Carries over a known fall-through in the upstream switch this was
/// translated from: the `SERVICE_TAG_KEY` and `CLUSTER_TAG_KEY` annotations
/// both write into `service`, so a span carrying both ends up with `service`
/// set to whichever of the two annotations is read last, and `cluster` is
/// never populated from these two keys at all. Left as-is; not our call to
/// silently change the key shape downstream consumers already depend on.
fn extract_red_key(span: &Span, source: &str) -> Option<RedKey> {
    let mut application = None;
    let mut service = None;
    let mut shard = None;
    let mut component = None;

    for (key, value) in &span.annotations {
        match key.as_str() {
            APPLICATION_TAG_KEY => application = Some(value.clone()),
            SERVICE_TAG_KEY | CLUSTER_TAG_KEY => service = Some(value.clone()),
            SHARD_TAG_KEY => shard = Some(value.clone()),
            COMPONENT_TAG_KEY => component = Some(value.clone()),
            _ => {}
        }
    }

    Some(RedKey {
        application: application?,
        service: service?,
        cluster: String::new(),
        shard: shard.unwrap_or_default(),
        component: component.unwrap_or_default(),
        source: source.to_string(),
    })
}

/// Samples, forwards, and derives RED metrics from decoded spans, with a
/// heartbeat registry tracking every distinct `RedKey` seen recently.
pub struct SpanFanIn<S> {
    sampler: S,
    config: SpanFanInConfig,
    red_metrics: RwLock<HashMap<RedKey, RedMetrics>>,
    heartbeats: Mutex<HashMap<RedKey, Instant>>,
    discarded: AtomicU64,
    sampled: AtomicU64,
}

impl<S: Sampler> SpanFanIn<S> {
    pub fn new(sampler: S, config: SpanFanInConfig) -> Self {
        Self {
            sampler,
            config,
            red_metrics: RwLock::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            discarded: AtomicU64::new(0),
            sampled: AtomicU64::new(0),
        }
    }

    /// Decodes, samples, forwards-if-sampled, and always updates RED metrics
    /// (regardless of sampling) for the span's key. `span_logs` is carried
    /// through unsampled spans untouched — it only matters if the span ends
    /// up forwarded.
    pub fn process(&self, span: Span, span_logs: Option<SpanLogs>) -> FanInOutcome {
        let Some(key) = extract_red_key(&span, &span.source) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return FanInOutcome::Discarded;
        };

        self.touch_heartbeat(&key);
        self.record_red(&key, span.duration_millis, span.has_error_tag());

        let sampled = self.sampler.decide(&span) || (self.config.always_sample_errors && span.has_error_tag());
        if sampled {
            self.sampled.fetch_add(1, Ordering::Relaxed);
            FanInOutcome::Forward(span, span_logs)
        } else {
            FanInOutcome::NotSampled
        }
    }

    /// Read-lock fast path, write-lock fallback to insert a fresh cell — the
    /// same shape as [`crate::accumulator::Accumulator::add_delta`].
    fn record_red(&self, key: &RedKey, duration_millis: i64, is_error: bool) {
        if let Some(metrics) = self.red_metrics.read().unwrap().get(key) {
            metrics.record(duration_millis, is_error);
            return;
        }
        let mut red_metrics = self.red_metrics.write().unwrap();
        red_metrics
            .entry(key.clone())
            .or_insert_with(RedMetrics::default)
            .record(duration_millis, is_error);
    }

    fn touch_heartbeat(&self, key: &RedKey) {
        self.heartbeats.lock().unwrap().insert(key.clone(), Instant::now());
    }

    /// Called by the caller's 60s heartbeat worker: prunes RedKeys that
    /// haven't been seen within the TTL and returns the survivors, one
    /// heartbeat point due per key.
    pub fn due_heartbeats(&self) -> Vec<RedKey> {
        let ttl = self.config.heartbeat_ttl;
        let now = Instant::now();
        let mut heartbeats = self.heartbeats.lock().unwrap();
        heartbeats.retain(|_, last_seen| now.duration_since(*last_seen) < ttl);
        heartbeats.keys().cloned().collect()
    }

    pub fn red_snapshot(&self, key: &RedKey) -> Option<RedSnapshot> {
        self.red_metrics.read().unwrap().get(key).map(|m| m.snapshot())
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn sampled_count(&self) -> u64 {
        self.sampled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(annotations: Vec<(&str, &str)>, duration_millis: i64) -> Span {
        Span {
            trace_id: 1,
            span_id: 1,
            parent_span_id: None,
            name: "op".into(),
            source: "host-a".into(),
            start_millis: 0,
            duration_millis,
            annotations: annotations
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    struct NeverSample;
    impl Sampler for NeverSample {
        fn decide(&self, _span: &Span) -> bool {
            false
        }
    }

    #[test]
    fn missing_service_or_application_is_discarded() {
        let fanin = SpanFanIn::new(NeverSample, SpanFanInConfig::default());
        let s = span(vec![(APPLICATION_TAG_KEY, "app")], 10);
        assert!(matches!(fanin.process(s, None), FanInOutcome::Discarded));
        assert_eq!(fanin.discarded_count(), 1);
    }

    // Scenario 5: ten spans, three tagged as errors, sampler probability 0
    // with always-sample-errors on — only the three error spans forward.
    #[test]
    fn scenario_5_zero_probability_sampler_still_forwards_error_spans() {
        let fanin = SpanFanIn::new(
            ProbabilitySampler::new(0.0),
            SpanFanInConfig {
                always_sample_errors: true,
                ..SpanFanInConfig::default()
            },
        );

        let mut forwarded = 0;
        for i in 0..10 {
            let mut annotations = vec![(APPLICATION_TAG_KEY, "app"), (SERVICE_TAG_KEY, "svc")];
            if i < 3 {
                annotations.push(("error", "true"));
            }
            let outcome = fanin.process(span(annotations, 5), None);
            if matches!(outcome, FanInOutcome::Forward(..)) {
                forwarded += 1;
            }
        }

        assert_eq!(forwarded, 3);
        assert_eq!(fanin.sampled_count(), 3);
    }

    #[test]
    fn sampler_handle_retunes_the_live_probability() {
        let sampler = ProbabilitySampler::new(0.0);
        let handle = sampler.handle();
        assert_eq!(handle.probability(), 0.0);

        handle.set_probability(1.0);
        let s = span(vec![(APPLICATION_TAG_KEY, "app"), (SERVICE_TAG_KEY, "svc")], 1);
        assert!(sampler.decide(&s));
    }

    #[test]
    fn error_spans_always_forward_even_with_zero_probability_sampler() {
        let fanin = SpanFanIn::new(
            NeverSample,
            SpanFanInConfig {
                always_sample_errors: true,
                ..SpanFanInConfig::default()
            },
        );

        let mut forwarded = 0;
        for i in 0..10 {
            let mut annotations = vec![(APPLICATION_TAG_KEY, "app"), (SERVICE_TAG_KEY, "svc")];
            if i < 3 {
                annotations.push(("error", "true"));
            }
            let outcome = fanin.process(span(annotations, 5), None);
            if matches!(outcome, FanInOutcome::Forward(..)) {
                forwarded += 1;
            }
        }

        assert_eq!(forwarded, 3);
        assert_eq!(fanin.sampled_count(), 3);
        let key = RedKey {
            application: "app".into(),
            service: "svc".into(),
            cluster: String::new(),
            shard: String::new(),
            component: String::new(),
            source: "host-a".into(),
        };
        assert_eq!(fanin.red_snapshot(&key).unwrap().requests, 10);
    }

    #[test]
    fn cluster_annotation_overwrites_service_via_the_preserved_fallthrough() {
        let s = span(
            vec![(APPLICATION_TAG_KEY, "app"), (SERVICE_TAG_KEY, "svc"), (CLUSTER_TAG_KEY, "clstr")],
            1,
        );
        let key = extract_red_key(&s, &s.source).unwrap();
        assert_eq!(key.service, "clstr");
        assert_eq!(key.cluster, "");
    }

    #[test]
    fn heartbeat_keys_expire_after_ttl() {
        let fanin = SpanFanIn::new(
            NeverSample,
            SpanFanInConfig {
                heartbeat_ttl: Duration::from_millis(0),
                ..SpanFanInConfig::default()
            },
        );
        let s = span(vec![(APPLICATION_TAG_KEY, "app"), (SERVICE_TAG_KEY, "svc")], 1);
        fanin.process(s, None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(fanin.due_heartbeats().is_empty());
    }
}
