//! The wire-level entities the proxy accepts, preprocesses and submits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tproxy_spool::SpoolPayload;

/// Which entity pipeline a `HandlerKey` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Point,
    Histogram,
    Span,
    SpanLogs,
    SourceTag,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Point => "points",
            EntityType::Histogram => "histograms",
            EntityType::Span => "spans",
            EntityType::SpanLogs => "spanLogs",
            EntityType::SourceTag => "sourceTags",
        }
    }
}

/// Routes an entity to the handler (and, transitively, pool and queue)
/// responsible for it. Each distinct `(entity_type, handle)` pair gets its
/// own handler, pool and spool directory — handles never share state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandlerKey {
    pub entity_type: EntityType,
    pub handle: String,
}

impl HandlerKey {
    pub fn new(entity_type: EntityType, handle: impl Into<String>) -> Self {
        Self {
            entity_type,
            handle: handle.into(),
        }
    }

    /// Directory-safe name for this key, used as the spool subdirectory.
    pub fn spool_dir_name(&self) -> String {
        format!("{}-{}", self.entity_type.as_str(), self.handle)
    }
}

/// Identifies one accumulator cell: a host/metric/tag-set combination whose
/// delta counters and histograms are aggregated between flushes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostMetricTagsPair {
    pub host: String,
    pub metric: String,
    pub tags: BTreeMap<String, String>,
}

/// A single numeric data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub metric: String,
    pub value: f64,
    pub timestamp_ms: i64,
    pub source: String,
    pub tags: BTreeMap<String, String>,
}

/// Granularity a histogram distribution was accumulated at. A distribution
/// can only be merged into another of the same or coarser granularity —
/// merging a finer one into a coarser one silently discards precision the
/// coarser bucket can't represent, so it is rejected instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HistogramGranularity {
    Minute,
    Hour,
    Day,
}

/// A t-digest-like centroid list: `(mean, count)` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub metric: String,
    pub source: String,
    pub tags: BTreeMap<String, String>,
    pub timestamp_ms: i64,
    pub granularity: HistogramGranularity,
    pub centroids: Vec<(f64, u32)>,
}

impl Histogram {
    pub fn point_count(&self) -> u32 {
        self.centroids.iter().map(|(_, count)| count).sum()
    }

    /// Merges `other`'s centroids into `self`, rejecting the merge if
    /// `other` was accumulated at a coarser granularity than `self` — a
    /// coarser distribution can't be folded into a finer one without
    /// fabricating precision it never had.
    pub fn merge(&mut self, other: Histogram) -> Result<(), crate::errors::PreprocessorError> {
        if other.granularity > self.granularity {
            return Err(crate::errors::PreprocessorError::GranularityMismatch {
                have: self.granularity,
                got: other.granularity,
            });
        }
        self.centroids.extend(other.centroids);
        Ok(())
    }
}

/// A span's key/value annotation. Spans preserve annotation order and allow
/// duplicate keys (unlike `Point::tags`), since span extraction rules need to
/// pick the first match among duplicates.
pub type SpanTag = (String, String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: u128,
    pub span_id: u64,
    pub parent_span_id: Option<u64>,
    pub name: String,
    pub source: String,
    pub start_millis: i64,
    pub duration_millis: i64,
    pub annotations: Vec<SpanTag>,
}

impl Span {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_error_tag(&self) -> bool {
        self.tag("error").is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLogEntry {
    pub timestamp_ms: i64,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLogs {
    pub trace_id: u128,
    pub span_id: u64,
    pub logs: Vec<SpanLogEntry>,
}

/// Which source-level attribute a [`SourceTag`] operation mutates: the
/// free-text description, or the set of tags on the source itself (as
/// distinct from tags on any individual point/span that source reports).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTagOp {
    SourceDescription,
    SourceTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTagAction {
    Add,
    Save,
    Delete,
}

/// A source-description or source-tag mutation. Unlike every other entity,
/// this isn't reported to a `/report/{entity_type}` batch endpoint — each one
/// becomes its own `PUT`/`DELETE /api/source/{source}/description|tag` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTag {
    pub op: SourceTagOp,
    pub action: SourceTagAction,
    pub source: String,
    pub annotations: Vec<String>,
}

/// Ensures `tags` carries `source` as an ordinary tag too, not just the
/// entity's distinguished `source` field — some downstream rules (and the
/// RED-metric reporter) key off tags alone and would otherwise never see it.
pub fn apply_source_tag(tags: &mut BTreeMap<String, String>, source: &str) {
    tags.entry("source".to_string())
        .or_insert_with(|| source.to_string());
}

/// The batch unit the sender-task pool assembles, submits and (on failure)
/// spools. One `EntityBatch` only ever holds entities of a single kind —
/// the variant itself is the type tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntityBatch {
    Points(Vec<Point>),
    Histograms(Vec<Histogram>),
    Spans(Vec<Span>),
    SpanLogs(Vec<SpanLogs>),
    SourceTags(Vec<SourceTag>),
}

impl EntityBatch {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityBatch::Points(_) => EntityType::Point,
            EntityBatch::Histograms(_) => EntityType::Histogram,
            EntityBatch::Spans(_) => EntityType::Span,
            EntityBatch::SpanLogs(_) => EntityType::SpanLogs,
            EntityBatch::SourceTags(_) => EntityType::SourceTag,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EntityBatch::Points(v) => v.len(),
            EntityBatch::Histograms(v) => v.len(),
            EntityBatch::Spans(v) => v.len(),
            EntityBatch::SpanLogs(v) => v.len(),
            EntityBatch::SourceTags(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

macro_rules! split_variant {
    ($variant:ident, $items:expr, $min:expr) => {{
        let items = $items;
        if (items.len() as u64) <= $min || items.len() < 2 {
            vec![EntityBatch::$variant(items)]
        } else {
            let mid = items.len() / 2;
            let mut items = items;
            let tail = items.split_off(mid);
            vec![EntityBatch::$variant(items), EntityBatch::$variant(tail)]
        }
    }};
}

impl SpoolPayload for EntityBatch {
    /// Every entity kind shares one discriminator: the variant tag inside
    /// the serialized enum is itself the forward-compatible type marker, so
    /// the framing format doesn't need a second one.
    const DISCRIMINATOR: u8 = 1;

    fn weight(&self) -> u64 {
        self.len() as u64
    }

    fn split(self, min_weight: u64, _max_weight: u64) -> Vec<Self> {
        match self {
            EntityBatch::Points(v) => split_variant!(Points, v, min_weight),
            EntityBatch::Histograms(v) => split_variant!(Histograms, v, min_weight),
            EntityBatch::Spans(v) => split_variant!(Spans, v, min_weight),
            EntityBatch::SpanLogs(v) => split_variant!(SpanLogs, v, min_weight),
            EntityBatch::SourceTags(v) => split_variant!(SourceTags, v, min_weight),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PreprocessorError;

    fn histogram(granularity: HistogramGranularity) -> Histogram {
        Histogram {
            metric: "request.latency".into(),
            source: "host-a".into(),
            tags: BTreeMap::new(),
            timestamp_ms: 0,
            granularity,
            centroids: vec![(1.0, 1)],
        }
    }

    // Testable property 3: a histogram merge accepts iff the incoming
    // distribution's granularity is no coarser than the accumulator's.
    #[test]
    fn merge_accepts_same_or_finer_granularity_and_rejects_coarser() {
        let mut minute = histogram(HistogramGranularity::Minute);
        assert!(minute.clone().merge(histogram(HistogramGranularity::Minute)).is_ok());

        let mut hour = histogram(HistogramGranularity::Hour);
        assert!(hour.merge(histogram(HistogramGranularity::Minute)).is_ok());
        assert_eq!(hour.point_count(), 2);

        let err = minute.merge(histogram(HistogramGranularity::Hour));
        assert!(matches!(
            err,
            Err(PreprocessorError::GranularityMismatch {
                have: HistogramGranularity::Minute,
                got: HistogramGranularity::Hour,
            })
        ));
    }
}
