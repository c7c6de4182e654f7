//! Per-entity validation an [`crate::handler::EntityHandler`] runs on every
//! item before it reaches the ring channel.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::entities::{Histogram, Point, Span, SpanLogs, SourceTag};
use crate::errors::ValidationError;

/// Acceptable window around "now" for a reported timestamp.
#[derive(Debug, Clone, Copy)]
pub struct TimestampBounds {
    pub max_past: Duration,
    pub max_future: Duration,
}

impl Default for TimestampBounds {
    fn default() -> Self {
        Self {
            max_past: Duration::from_secs(7 * 24 * 3600),
            max_future: Duration::from_secs(24 * 3600),
        }
    }
}

impl TimestampBounds {
    fn check(&self, timestamp_ms: i64, now_ms: i64) -> Result<(), ValidationError> {
        let earliest = now_ms.saturating_sub(self.max_past.as_millis() as i64);
        let latest = now_ms.saturating_add(self.max_future.as_millis() as i64);
        if timestamp_ms < earliest || timestamp_ms > latest {
            return Err(ValidationError::TimestampOutOfRange(timestamp_ms));
        }
        Ok(())
    }
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn annotation_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*$").unwrap())
}

fn validate_tags(tags: &std::collections::BTreeMap<String, String>) -> Result<(), ValidationError> {
    let pattern = annotation_key_pattern();
    for key in tags.keys() {
        if !pattern.is_match(key) {
            return Err(ValidationError::InvalidAnnotationKey(key.clone()));
        }
    }
    Ok(())
}

/// Dispatches the per-type checks `EntityHandler::report` runs before an item
/// is accepted onto the ring.
pub trait Validate {
    fn validate(&self, bounds: &TimestampBounds, now_ms: i64) -> Result<(), ValidationError>;
}

impl Validate for Point {
    fn validate(&self, bounds: &TimestampBounds, now_ms: i64) -> Result<(), ValidationError> {
        if self.metric.is_empty() {
            return Err(ValidationError::EmptyMetricName);
        }
        if self.source.is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        if !self.value.is_finite() {
            return Err(ValidationError::NonFiniteValue(self.value));
        }
        bounds.check(self.timestamp_ms, now_ms)?;
        validate_tags(&self.tags)
    }
}

impl Validate for Histogram {
    fn validate(&self, bounds: &TimestampBounds, now_ms: i64) -> Result<(), ValidationError> {
        if self.metric.is_empty() {
            return Err(ValidationError::EmptyMetricName);
        }
        if self.source.is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        bounds.check(self.timestamp_ms, now_ms)?;
        validate_tags(&self.tags)
    }
}

impl Validate for Span {
    fn validate(&self, bounds: &TimestampBounds, now_ms: i64) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if self.source.is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        bounds.check(self.start_millis, now_ms)
    }
}

impl Validate for SpanLogs {
    fn validate(&self, _bounds: &TimestampBounds, _now_ms: i64) -> Result<(), ValidationError> {
        if self.logs.is_empty() {
            return Err(ValidationError::MissingField("logs"));
        }
        Ok(())
    }
}

impl Validate for SourceTag {
    fn validate(&self, _bounds: &TimestampBounds, _now_ms: i64) -> Result<(), ValidationError> {
        if self.source.is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn point() -> Point {
        Point {
            metric: "cpu.load".into(),
            value: 1.0,
            timestamp_ms: now_millis(),
            source: "host-a".into(),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn rejects_empty_metric_name() {
        let mut p = point();
        p.metric.clear();
        assert!(matches!(
            p.validate(&TimestampBounds::default(), now_millis()),
            Err(ValidationError::EmptyMetricName)
        ));
    }

    #[test]
    fn rejects_non_finite_value() {
        let mut p = point();
        p.value = f64::NAN;
        assert!(matches!(
            p.validate(&TimestampBounds::default(), now_millis()),
            Err(ValidationError::NonFiniteValue(_))
        ));
    }

    #[test]
    fn rejects_timestamp_far_in_the_past() {
        let mut p = point();
        p.timestamp_ms = 0;
        assert!(matches!(
            p.validate(&TimestampBounds::default(), now_millis()),
            Err(ValidationError::TimestampOutOfRange(0))
        ));
    }

    #[test]
    fn rejects_invalid_annotation_key() {
        let mut p = point();
        p.tags.insert("has space".into(), "x".into());
        assert!(matches!(
            p.validate(&TimestampBounds::default(), now_millis()),
            Err(ValidationError::InvalidAnnotationKey(_))
        ));
    }

    #[test]
    fn accepts_a_well_formed_point() {
        assert!(point().validate(&TimestampBounds::default(), now_millis()).is_ok());
    }
}
