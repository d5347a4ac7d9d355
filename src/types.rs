// ============================================================================
// CORE TYPES
// ============================================================================
// Records, attribute values, timestamps and per-record verdicts shared by
// every stage of the pipeline.
// ============================================================================

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::hash::Hasher;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use compact_str::{CompactString, ToCompactString};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

pub use quanta::{Clock, Instant};

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since the Unix epoch.
///
/// Records carry this; state machines use the monotonic [`Clock`] instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time.
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Saturating difference; never negative.
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

// ----------------------------------------------------------------------------
// Attribute Values
// ----------------------------------------------------------------------------

/// Scalar kind of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Int,
    Float,
    Bool,
    /// Either `Int` or `Float`; only meaningful as an expectation.
    Number,
}

impl ValueKind {
    /// Whether a value of kind `actual` satisfies this expectation.
    pub fn accepts(&self, actual: ValueKind) -> bool {
        match self {
            ValueKind::Number => matches!(actual, ValueKind::Int | ValueKind::Float),
            expected => *expected == actual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
        }
    }
}

/// A heterogeneous scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(CompactString),
}

impl AttributeValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            AttributeValue::Bool(_) => ValueKind::Bool,
            AttributeValue::Int(_) => ValueKind::Int,
            AttributeValue::Float(_) => ValueKind::Float,
            AttributeValue::Str(_) => ValueKind::String,
        }
    }

    /// Numeric view. Strings holding a number are accepted since collectors
    /// frequently stringify numeric columns.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Str(s) => s.trim().parse::<f64>().ok(),
            AttributeValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            AttributeValue::Int(v) => match v {
                0 => Some(false),
                1 => Some(true),
                _ => None,
            },
            AttributeValue::Float(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Canonical string rendering used for fingerprints and comparisons.
    pub fn render(&self) -> CompactString {
        match self {
            AttributeValue::Str(s) => s.clone(),
            AttributeValue::Int(v) => v.to_compact_string(),
            AttributeValue::Float(v) => {
                if v.fract() == 0.0 && v.abs() < 1e15 {
                    (*v as i64).to_compact_string()
                } else {
                    v.to_compact_string()
                }
            }
            AttributeValue::Bool(b) => b.to_compact_string(),
        }
    }

    /// Rendering normalised for fingerprinting: trimmed, lower-cased and with
    /// internal whitespace collapsed.
    pub fn normalized(&self) -> CompactString {
        match self {
            AttributeValue::Str(s) => {
                let mut out = CompactString::with_capacity(s.len());
                for (i, word) in s.split_whitespace().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    for c in word.chars() {
                        out.extend(c.to_lowercase());
                    }
                }
                out
            }
            other => other.render(),
        }
    }
}

impl Display for AttributeValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Str(CompactString::from(v))
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Str(CompactString::from(v))
    }
}

impl From<CompactString> for AttributeValue {
    fn from(v: CompactString) -> Self {
        AttributeValue::Str(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<usize> for AttributeValue {
    fn from(v: usize) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

/// Attribute map of a record.
pub type Attributes = HashMap<CompactString, AttributeValue, ahash::RandomState>;

// ----------------------------------------------------------------------------
// Records & Batches
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    #[default]
    Metric,
    Log,
}

/// A metric point or log entry flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub kind: RecordKind,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Record {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            timestamp: Timestamp::now(),
            kind,
            attributes: Attributes::default(),
        }
    }

    pub fn metric() -> Self {
        Self::new(RecordKind::Metric)
    }

    pub fn log() -> Self {
        Self::new(RecordKind::Log)
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    #[inline]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttributeValue::as_str)
    }

    #[inline]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(AttributeValue::as_f64)
    }

    #[inline]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(AttributeValue::as_bool)
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    #[inline]
    pub fn set(&mut self, key: &str, value: impl Into<AttributeValue>) {
        self.attributes.insert(CompactString::from(key), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<AttributeValue> {
        self.attributes.remove(key)
    }

    /// Attribute keys in sorted order.
    pub fn sorted_keys(&self) -> Vec<&CompactString> {
        let mut keys: Vec<_> = self.attributes.keys().collect();
        keys.sort_unstable();
        keys
    }

    /// Order-independent hash over every attribute (timestamp excluded).
    pub fn content_hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for key in self.sorted_keys() {
            hasher.write(key.as_bytes());
            hasher.write_u8(0x1f);
            if let Some(value) = self.attributes.get(key) {
                hasher.write(value.render().as_bytes());
            }
            hasher.write_u8(0x1e);
        }
        hasher.finish()
    }
}

/// An ordered batch of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }
}

impl From<Vec<Record>> for Batch {
    fn from(records: Vec<Record>) -> Self {
        Self::new(records)
    }
}

impl IntoIterator for Batch {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

// ----------------------------------------------------------------------------
// Per-record Verdicts
// ----------------------------------------------------------------------------

/// Why a stage removed a record from its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    CircuitOpen,
    Duplicate,
    SampledOut,
    QualityViolation,
    PiiDetected,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::CircuitOpen => "circuit_open",
            DropReason::Duplicate => "duplicate",
            DropReason::SampledOut => "sampled_out",
            DropReason::QualityViolation => "quality_violation",
            DropReason::PiiDetected => "pii_detected",
        }
    }
}

impl Display for DropReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of processing one record in one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the record (possibly with mutated attributes).
    Pass,
    /// Remove the record from the batch.
    Drop(DropReason),
}

impl Verdict {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_timestamp_conversions() {
        let ts = Timestamp::from_secs(10);
        assert_eq!(ts.as_millis(), 10_000);
        assert_eq!(ts.add_duration(Duration::from_millis(5)).as_millis(), 10_005);
        assert_eq!(Timestamp::from_secs(1).duration_since(ts), Duration::ZERO);
    }

    #[test]
    fn test_attribute_value_views() {
        assert_eq!(AttributeValue::from("1500").as_f64(), Some(1500.0));
        assert_eq!(AttributeValue::from(true).as_f64(), None);
        assert_eq!(AttributeValue::from("TRUE").as_bool(), Some(true));
        assert_eq!(AttributeValue::from(2.0).render(), "2");
        assert_eq!(AttributeValue::from(2.5).render(), "2.5");
        assert_eq!(
            AttributeValue::from("  SELECT   *\n FROM t ").normalized(),
            "select * from t"
        );
    }

    #[test]
    fn test_value_kind_expectations() {
        assert!(ValueKind::Number.accepts(ValueKind::Int));
        assert!(ValueKind::Number.accepts(ValueKind::Float));
        assert!(!ValueKind::Int.accepts(ValueKind::Float));
    }

    #[test]
    fn test_record_json_shape() {
        let json = r#"{"timestamp": 5, "kind": "log", "attributes": {"a": 1, "b": 1.5, "c": "x", "d": false}}"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, RecordKind::Log);
        assert_eq!(record.get("a"), Some(&AttributeValue::Int(1)));
        assert_eq!(record.get("b"), Some(&AttributeValue::Float(1.5)));
        assert_eq!(record.get_str("c"), Some("x"));
        assert_eq!(record.get_bool("d"), Some(false));
    }

    #[test]
    fn test_content_hash_ignores_insertion_order() {
        let a = Record::metric().with_attr("x", 1i64).with_attr("y", "z");
        let b = Record::metric().with_attr("y", "z").with_attr("x", 1i64);
        let c = Record::metric().with_attr("y", "z").with_attr("x", 2i64);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }
}
