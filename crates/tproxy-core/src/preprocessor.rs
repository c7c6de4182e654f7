//! Tag/name rewriting rules applied to points and spans before they reach the
//! accumulator or sender-task pool.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::entities::{Point, Span};
use crate::errors::PreprocessorError;

fn annotation_placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{annotation\.([^}]+)\}\}").unwrap())
}

/// Expands `{{source}}`, `{{metric}}` and `{{annotation.X}}` placeholders in
/// a rule's replacement/value string against a point's fields. An
/// `{{annotation.X}}` whose `X` isn't one of the point's tags expands to the
/// empty string rather than being left as the literal placeholder.
fn expand_point_placeholders(template: &str, point: &Point) -> String {
    let mut out = template.replace("{{source}}", &point.source);
    out = out.replace("{{metric}}", &point.metric);
    out = annotation_placeholder_pattern()
        .replace_all(&out, |caps: &regex::Captures| {
            point.tags.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned();
    out
}

/// How [`PointRule::LimitLength`] handles a value past its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LimitLengthAction {
    #[default]
    Truncate,
    TruncateWithEllipsis,
    Drop,
}

/// One rewrite step in a point preprocessor pipeline. Rules are applied in
/// declaration order; later rules see earlier rules' output.
pub enum PointRule {
    AddTag {
        key: String,
        value_template: String,
    },
    AddTagIfNotExists {
        key: String,
        value_template: String,
    },
    /// Drops every tag whose key matches `key_pattern`, and whose value (if
    /// `value_pattern` is set) also matches.
    DropTag {
        key_pattern: Regex,
        value_pattern: Option<Regex>,
    },
    /// Renames tag `from` to `to`, only if `value_pattern` (when set)
    /// matches the current value.
    RenameTag {
        from: String,
        to: String,
        value_pattern: Option<Regex>,
    },
    ExtractTag {
        key: String,
        source: String,
        pattern: Regex,
    },
    LimitLength {
        key: String,
        max_len: usize,
        action: LimitLengthAction,
    },
    /// Lowercases `key`'s value, only if `match_pattern` (when set) matches
    /// the current value.
    ForceLowercase {
        key: String,
        match_pattern: Option<Regex>,
    },
    ReplaceRegex {
        key: String,
        pattern: Regex,
        replacement: String,
    },
}

impl PointRule {
    pub fn drop_tag(key_pattern: &str, value_pattern: Option<&str>) -> Result<Self, PreprocessorError> {
        Ok(PointRule::DropTag {
            key_pattern: Regex::new(key_pattern)?,
            value_pattern: value_pattern.map(Regex::new).transpose()?,
        })
    }

    pub fn rename_tag(
        from: impl Into<String>,
        to: impl Into<String>,
        value_pattern: Option<&str>,
    ) -> Result<Self, PreprocessorError> {
        Ok(PointRule::RenameTag {
            from: from.into(),
            to: to.into(),
            value_pattern: value_pattern.map(Regex::new).transpose()?,
        })
    }

    pub fn force_lowercase(key: impl Into<String>, match_pattern: Option<&str>) -> Result<Self, PreprocessorError> {
        Ok(PointRule::ForceLowercase {
            key: key.into(),
            match_pattern: match_pattern.map(Regex::new).transpose()?,
        })
    }

    pub fn extract_tag(key: impl Into<String>, source: impl Into<String>, pattern: &str) -> Result<Self, PreprocessorError> {
        Ok(PointRule::ExtractTag {
            key: key.into(),
            source: source.into(),
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn replace_regex(
        key: impl Into<String>,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, PreprocessorError> {
        Ok(PointRule::ReplaceRegex {
            key: key.into(),
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    fn apply(&self, point: &mut Point) {
        match self {
            PointRule::AddTag { key, value_template } => {
                let value = expand_point_placeholders(value_template, point);
                point.tags.insert(key.clone(), value);
            }
            PointRule::AddTagIfNotExists { key, value_template } => {
                if !point.tags.contains_key(key) {
                    let value = expand_point_placeholders(value_template, point);
                    point.tags.insert(key.clone(), value);
                }
            }
            PointRule::DropTag { key_pattern, value_pattern } => {
                let to_drop: Vec<String> = point
                    .tags
                    .iter()
                    .filter(|(k, v)| {
                        key_pattern.is_match(k) && value_pattern.as_ref().map_or(true, |p| p.is_match(v))
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in to_drop {
                    point.tags.remove(&key);
                }
            }
            PointRule::RenameTag { from, to, value_pattern } => {
                let should_rename = point
                    .tags
                    .get(from)
                    .is_some_and(|v| value_pattern.as_ref().map_or(true, |p| p.is_match(v)));
                if should_rename {
                    if let Some(value) = point.tags.remove(from) {
                        point.tags.insert(to.clone(), value);
                    }
                }
            }
            PointRule::ExtractTag { key, source, pattern } => {
                let haystack = match source.as_str() {
                    "source" => Some(point.source.clone()),
                    "metric" => Some(point.metric.clone()),
                    other => point.tags.get(other).cloned(),
                };
                if let Some(haystack) = haystack {
                    if let Some(captures) = pattern.captures(&haystack) {
                        let extracted = captures
                            .get(1)
                            .or_else(|| captures.get(0))
                            .map(|m| m.as_str().to_string());
                        if let Some(extracted) = extracted {
                            point.tags.insert(key.clone(), extracted);
                        }
                    }
                }
            }
            PointRule::LimitLength { key, max_len, action } => {
                let over_limit = point.tags.get(key).is_some_and(|v| v.len() > *max_len);
                if over_limit {
                    match action {
                        LimitLengthAction::Truncate => {
                            if let Some(value) = point.tags.get_mut(key) {
                                value.truncate(*max_len);
                            }
                        }
                        LimitLengthAction::TruncateWithEllipsis => {
                            if let Some(value) = point.tags.get_mut(key) {
                                value.truncate(max_len.saturating_sub(3));
                                value.push_str("...");
                            }
                        }
                        LimitLengthAction::Drop => {
                            point.tags.remove(key);
                        }
                    }
                }
            }
            PointRule::ForceLowercase { key, match_pattern } => {
                let gate_passes = point
                    .tags
                    .get(key)
                    .is_some_and(|v| match_pattern.as_ref().map_or(true, |p| p.is_match(v)));
                if gate_passes {
                    if let Some(value) = point.tags.get_mut(key) {
                        *value = value.to_lowercase();
                    }
                }
            }
            PointRule::ReplaceRegex {
                key,
                pattern,
                replacement,
            } => {
                if let Some(value) = point.tags.get_mut(key) {
                    *value = pattern.replace_all(value, replacement.as_str()).into_owned();
                }
            }
        }
    }
}

/// A per-rule applied/skipped counter, for diagnosing a misconfigured
/// preprocessor pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleMetrics {
    pub applied: u64,
}

/// An ordered pipeline of [`PointRule`]s applied to every point a handle
/// receives, with per-rule application counts.
pub struct PointPreprocessor {
    rules: Vec<PointRule>,
    applied: Vec<std::sync::atomic::AtomicU64>,
}

impl PointPreprocessor {
    pub fn new(rules: Vec<PointRule>) -> Self {
        let applied = rules.iter().map(|_| std::sync::atomic::AtomicU64::new(0)).collect();
        Self { rules, applied }
    }

    pub fn report(&self, mut point: Point) -> Point {
        for (rule, counter) in self.rules.iter().zip(&self.applied) {
            let before = point.tags.len();
            rule.apply(&mut point);
            if point.tags.len() != before || matches!(rule, PointRule::ReplaceRegex { .. } | PointRule::ForceLowercase { .. } | PointRule::LimitLength { .. }) {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        point
    }

    pub fn rule_metrics(&self) -> Vec<RuleMetrics> {
        self.applied
            .iter()
            .map(|c| RuleMetrics {
                applied: c.load(std::sync::atomic::Ordering::Relaxed),
            })
            .collect()
    }
}

/// Extracts annotations from a span into standalone tags (e.g. to surface a
/// nested annotation at the top level for downstream rules). When a span has
/// duplicate annotation keys (spans preserve order and allow duplicates,
/// unlike point tags), only the first match is used.
pub fn extract_span_annotation(span: &Span, key: &str) -> Option<&str> {
    span.annotations
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Applies a flat key rewrite map to a span's annotations in place, used by
/// span preprocessor rules that are simple renames (the regex/extract rule
/// kinds above are point-only in this proxy; span rules are limited to
/// renaming and dropping, matching the narrower span annotation model).
pub fn rewrite_span_annotations(span: &mut Span, renames: &BTreeMap<String, String>) {
    for (key, _) in span.annotations.iter_mut() {
        if let Some(new_key) = renames.get(key) {
            *key = new_key.clone();
        }
    }
}
