//! Abuse metric events and their bounded metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum number of metadata entries kept on one event.
pub const MAX_METADATA_ENTRIES: usize = 32;
/// Maximum byte length of a text metadata value or key.
pub const MAX_METADATA_TEXT_LEN: usize = 512;

/// Kinds of abuse signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// A request was denied by its token bucket
    RateLimitExceeded,
    /// A request was denied after repeated concurrent-update conflicts
    UpdateConflict,
}

impl MetricType {
    /// The persisted name of this metric type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::RateLimitExceeded => "rate_limit_exceeded",
            MetricType::UpdateConflict => "update_conflict",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limit_exceeded" => Ok(MetricType::RateLimitExceeded),
            "update_conflict" => Ok(MetricType::UpdateConflict),
            other => Err(format!("unknown metric type '{}'", other)),
        }
    }
}

/// A single scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// A metadata value: a scalar or a flat list of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Scalar(Scalar),
    List(Vec<Scalar>),
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Scalar(Scalar::Bool(v))
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Scalar(Scalar::Integer(v))
    }
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        MetadataValue::Scalar(Scalar::Integer(i64::from(v)))
    }
}

impl From<u64> for MetadataValue {
    fn from(v: u64) -> Self {
        MetadataValue::Scalar(Scalar::Integer(i64::try_from(v).unwrap_or(i64::MAX)))
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Scalar(Scalar::Float(v))
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Scalar(Scalar::Text(truncate(v).to_string()))
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::from(v.as_str())
    }
}

impl From<Vec<Scalar>> for MetadataValue {
    fn from(v: Vec<Scalar>) -> Self {
        MetadataValue::List(v.into_iter().map(bound_scalar).collect())
    }
}

fn bound_scalar(scalar: Scalar) -> Scalar {
    match scalar {
        Scalar::Text(s) => Scalar::Text(truncate(&s).to_string()),
        other => other,
    }
}

fn truncate(s: &str) -> &str {
    if s.len() <= MAX_METADATA_TEXT_LEN {
        return s;
    }
    let mut end = MAX_METADATA_TEXT_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Bounded, string-keyed event metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMetadata(BTreeMap<String, MetadataValue>);

impl EventMetadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning `false` if the entry limit was reached.
    ///
    /// Replacing an existing key always succeeds.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> bool {
        let key = key.into();
        let key = truncate(&key).to_string();
        if self.0.len() >= MAX_METADATA_ENTRIES && !self.0.contains_key(&key) {
            return false;
        }
        self.0.insert(key, value.into());
        true
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no entries are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An append-only abuse signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbuseMetricEvent {
    pub id: Uuid,
    pub metric_type: MetricType,
    pub identifier: String,
    pub operation: String,
    pub metadata: EventMetadata,
    pub created_at: DateTime<Utc>,
}

impl AbuseMetricEvent {
    /// Create a new event stamped at `created_at`.
    pub fn new(
        metric_type: MetricType,
        identifier: impl Into<String>,
        operation: impl Into<String>,
        metadata: EventMetadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            metric_type,
            identifier: identifier.into(),
            operation: operation.into(),
            metadata,
            created_at,
        }
    }
}

/// A rolling-window count query over abuse events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricQuery {
    pub metric_type: MetricType,
    /// Only events created at or after this instant
    pub since: DateTime<Utc>,
    /// Restrict to one identifier; `None` counts every identifier
    pub identifier: Option<String>,
}
