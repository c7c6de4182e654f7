//! Per-component error enums. Each component owns one; there is no shared
//! "god error" type for the whole crate.

use thiserror::Error;

use crate::entities::HistogramGranularity;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("metric name is empty")]
    EmptyMetricName,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("value is not finite: {0}")]
    NonFiniteValue(f64),
    #[error("timestamp {0}ms is outside the accepted window")]
    TimestampOutOfRange(i64),
    #[error("annotation key {0:?} is not a valid identifier")]
    InvalidAnnotationKey(String),
}

#[derive(Debug, Error)]
pub enum PreprocessorError {
    #[error("regex pattern failed to compile: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("cannot merge histogram accumulated at {got:?} granularity into one at {have:?}")]
    GranularityMismatch {
        have: HistogramGranularity,
        got: HistogramGranularity,
    },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("backend rejected the batch as too large (HTTP 406)")]
    PayloadTooLarge,
    #[error("backend is unavailable or overloaded (HTTP {status}), retry later")]
    Retryable { status: u16 },
    #[error("backend rejected the batch (HTTP {status}), dropping")]
    Rejected { status: u16 },
    #[error("network error talking to backend: {0}")]
    Network(String),
    #[error("sender-task pool is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum CheckinError {
    #[error("network error during check-in: {0}")]
    Network(String),
    #[error("check-in backend returned HTTP {status}")]
    HttpError { status: u16 },
    #[error("check-in response body could not be parsed: {0}")]
    Malformed(#[from] serde_json::Error),
}
