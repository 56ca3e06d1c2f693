//! Numeric claim extraction from free-text answers.
//!
//! Each [`ClaimPattern`] is one independent recognizer. [`ClaimExtractor`]
//! runs them in order and deduplicates on `(name, slice, value)`, so the
//! structured facts block, which runs first, wins over prose mentioning the
//! same number.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// A numeric assertion found in an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Claim {
    pub name: String,
    #[serde(default)]
    pub slice: Option<String>,
    pub value: f64,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub from_facts_block: bool,
}

impl Claim {
    fn dedup_key(&self) -> (String, Option<String>, u64) {
        (self.name.clone(), self.slice.clone(), self.value.to_bits())
    }
}

/// A single claim recognizer.
pub trait ClaimPattern: Send + Sync {
    fn label(&self) -> &'static str;
    fn extract(&self, text: &str) -> Vec<Claim>;
}

/// Parse a captured numeric token. A trailing sentence period is dropped;
/// anything else that does not parse to a finite number is skipped.
fn parse_number(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim_end_matches('.').parse().ok()?;
    value.is_finite().then_some(value)
}

fn group<'t>(caps: &Captures<'t>, index: usize) -> &'t str {
    caps.get(index).map_or("", |m| m.as_str())
}

static FACTS_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```facts\s*\n(.*?)\n```").expect("valid facts block regex")
});

/// Fenced ```` ```facts ```` JSON block with `metrics` and optional
/// `filters`.
pub struct FactsBlockPattern;

impl FactsBlockPattern {
    fn slice_from_filters(filters: Option<&Value>) -> Option<String> {
        let filters = filters?.as_object()?;
        let render = |value: &Value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let parts: Vec<String> = ["team", "resource"]
            .iter()
            .filter_map(|key| filters.get(*key).map(|v| format!("{key}={}", render(v))))
            .collect();
        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

impl ClaimPattern for FactsBlockPattern {
    fn label(&self) -> &'static str {
        "facts_block"
    }

    fn extract(&self, text: &str) -> Vec<Claim> {
        let mut claims = Vec::new();
        for caps in FACTS_BLOCK_RE.captures_iter(text) {
            let Ok(facts) = serde_json::from_str::<Value>(group(&caps, 1).trim()) else {
                tracing::debug!("Skipping facts block that is not valid JSON");
                continue;
            };
            let slice = Self::slice_from_filters(facts.get("filters"));
            let Some(metrics) = facts.get("metrics").and_then(Value::as_object) else {
                continue;
            };
            for (name, value) in metrics {
                let Some(value) = value.as_f64().filter(|v| v.is_finite()) else {
                    continue;
                };
                claims.push(Claim {
                    name: name.clone(),
                    slice: slice.clone(),
                    value,
                    units: String::new(),
                    raw_text: format!("{name}={value}"),
                    from_facts_block: true,
                });
            }
        }
        claims
    }
}

static ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\w+(?:_\w+)*)\s*[=:]\s*([\d.]+)\s*([%a-zA-Z]*)")
        .expect("valid assignment regex")
});

/// `name = value unit` or `name: value unit`.
pub struct AssignmentPattern;

impl ClaimPattern for AssignmentPattern {
    fn label(&self) -> &'static str {
        "assignment"
    }

    fn extract(&self, text: &str) -> Vec<Claim> {
        ASSIGNMENT_RE
            .captures_iter(text)
            .filter_map(|caps| {
                Some(Claim {
                    name: group(&caps, 1).to_lowercase(),
                    slice: None,
                    value: parse_number(group(&caps, 2))?,
                    units: group(&caps, 3).to_string(),
                    raw_text: group(&caps, 0).to_string(),
                    from_facts_block: false,
                })
            })
            .collect()
    }
}

static SLICED_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)([\d.]+)\s+(\w+)\s+(?:by|for|in)\s+(?:"([^"',.!?\n]+)"|'([^"',.!?\n]+)'|([^"',.!?\n]+))"#,
    )
    .expect("valid sliced count regex")
});

/// `value unit by|for|in <slice>`, slice optionally quoted.
pub struct SlicedCountPattern;

impl ClaimPattern for SlicedCountPattern {
    fn label(&self) -> &'static str {
        "sliced_count"
    }

    fn extract(&self, text: &str) -> Vec<Claim> {
        SLICED_COUNT_RE
            .captures_iter(text)
            .filter_map(|caps| {
                let unit = group(&caps, 2).to_string();
                let slice = (3..=5)
                    .find_map(|i| caps.get(i))
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|s| !s.is_empty());
                Some(Claim {
                    name: unit.to_lowercase(),
                    slice,
                    value: parse_number(group(&caps, 1))?,
                    units: unit,
                    raw_text: group(&caps, 0).to_string(),
                    from_facts_block: false,
                })
            })
            .collect()
    }
}

static AGGREGATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:average|mean|median|avg)\s+(\w+(?:_\w+)*)\s+(?:is|of|=)\s*([\d.]+)\s*([%a-zA-Z]*)",
    )
    .expect("valid aggregate regex")
});

/// `average|mean|median|avg <metric> is|of|= value unit`.
pub struct AggregatePattern;

impl ClaimPattern for AggregatePattern {
    fn label(&self) -> &'static str {
        "aggregate"
    }

    fn extract(&self, text: &str) -> Vec<Claim> {
        AGGREGATE_RE
            .captures_iter(text)
            .filter_map(|caps| {
                Some(Claim {
                    name: format!("avg_{}", group(&caps, 1).to_lowercase()),
                    slice: None,
                    value: parse_number(group(&caps, 2))?,
                    units: group(&caps, 3).to_string(),
                    raw_text: group(&caps, 0).to_string(),
                    from_facts_block: false,
                })
            })
            .collect()
    }
}

static PERCENTAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([\d.]+)\s*(?:%|percent)\s+(?:of\s+)?(\w+(?:_\w+)*)")
        .expect("valid percentage regex")
});

/// `value% [of] metric`, stored as a fraction.
pub struct PercentagePattern;

impl ClaimPattern for PercentagePattern {
    fn label(&self) -> &'static str {
        "percentage"
    }

    fn extract(&self, text: &str) -> Vec<Claim> {
        PERCENTAGE_RE
            .captures_iter(text)
            .filter_map(|caps| {
                Some(Claim {
                    name: group(&caps, 2).to_lowercase(),
                    slice: None,
                    value: parse_number(group(&caps, 1))? / 100.0,
                    units: "%".to_string(),
                    raw_text: group(&caps, 0).to_string(),
                    from_facts_block: false,
                })
            })
            .collect()
    }
}

/// Ordered set of claim patterns.
pub struct ClaimExtractor {
    patterns: Vec<Box<dyn ClaimPattern>>,
}

impl Default for ClaimExtractor {
    fn default() -> Self {
        Self::new(vec![
            Box::new(FactsBlockPattern),
            Box::new(AssignmentPattern),
            Box::new(SlicedCountPattern),
            Box::new(AggregatePattern),
            Box::new(PercentagePattern),
        ])
    }
}

impl ClaimExtractor {
    pub fn new(patterns: Vec<Box<dyn ClaimPattern>>) -> Self {
        Self { patterns }
    }

    pub fn pattern_labels(&self) -> Vec<&'static str> {
        self.patterns.iter().map(|p| p.label()).collect()
    }

    /// Extract claims from every pattern, keeping the first claim for each
    /// `(name, slice, value)`.
    pub fn extract(&self, text: &str) -> Vec<Claim> {
        let mut seen = HashSet::new();
        let mut claims = Vec::new();
        for pattern in &self.patterns {
            for claim in pattern.extract(text) {
                if seen.insert(claim.dedup_key()) {
                    claims.push(claim);
                }
            }
        }
        claims
    }
}

pub fn extract_numeric_claims(text: &str) -> Vec<Claim> {
    ClaimExtractor::default().extract(text)
}
