//! Core telemetry-proxy pipeline: entity handling, preprocessing,
//! accumulation, submission, spooling, check-in, and trace fan-in.
//!
//! Wiring a listener protocol to this crate means decoding wire bytes into
//! the types in [`entities`], running them through [`preprocessor`] and
//! [`accumulator`], and handing them to an [`handler::EntityHandler`]. A
//! [`tproxy`](../tproxy/index.html) binary owns the listeners themselves —
//! this crate stops at the decoded-entity boundary.

pub mod accumulator;
pub mod backend_client;
pub mod checkin;
pub mod entities;
pub mod errors;
pub mod handler;
pub mod preprocessor;
pub mod rate_limiter;
pub mod resilient_sender;
pub mod sender;
pub mod span_fanin;
pub mod validation;

pub use accumulator::Accumulator;
pub use backend_client::{
    BackendClient, BackendClientBoxed, CannedResponse, RecordingBackendClient, ReqwestBackendClient,
};
pub use checkin::{
    AgentConfiguration, CheckinClient, CheckinConfig, CheckinController, CheckinOutcome, CheckinRequest,
    ReqwestCheckinClient, CHECKIN_INTERVAL, METRICS_SNAPSHOT_INTERVAL,
};
pub use entities::{
    apply_source_tag, EntityBatch, EntityType, HandlerKey, Histogram, HistogramGranularity,
    HostMetricTagsPair, Point, SourceTag, SourceTagAction, SourceTagOp, Span, SpanLogEntry, SpanLogs,
    SpanTag,
};
pub use errors::{CheckinError, PreprocessorError, SendError, ValidationError};
pub use handler::{
    default_channel_config, EntityHandler, HandlerMetrics, HandlerMetricsSnapshot, LogRateGate,
    RollingStat, SubmitError,
};
pub use preprocessor::{
    extract_span_annotation, rewrite_span_annotations, PointPreprocessor, PointRule, RuleMetrics,
};
pub use rate_limiter::{
    BoxedRateLimiter, IntervalRateLimiter, RateLimiter, RateLimiterBoxed, RateLimiterHandle,
    TokenBucketRateLimiter, TunableRateLimiter, YieldingRateLimiter,
};
pub use resilient_sender::{
    CircuitBreakerConfig, CircuitBreakerSender, CircuitState, RateLimitedSender, ResilientSenderBuilder,
    RetryConfig, RetryingSender,
};
pub use sender::{adaptive_batch_size, SenderPoolConfig, SenderTask, SenderTunables};
pub use span_fanin::{
    FanInOutcome, ProbabilitySampler, RedKey, RedMetrics, RedSnapshot, Sampler, SamplerHandle, SpanFanIn,
    SpanFanInConfig, APPLICATION_TAG_KEY, CLUSTER_TAG_KEY, COMPONENT_TAG_KEY, SERVICE_TAG_KEY, SHARD_TAG_KEY,
};
pub use validation::{TimestampBounds, Validate};
