//! Cursor fields and the per-stream high-water mark.
//!
//! Records arrive interleaved across partitions, so a stream's state can only
//! be a running maximum: [`CursorAccumulator::observe`] is called for every
//! record before it is yielded, and the accumulated value equals the largest
//! cursor value among yielded records no matter how partitions interleaved.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter, Result as FormatResult};

use ordered_float::OrderedFloat;
use serde_json::{Map, Value};

use crate::record::Record;

/// Path to the cursor value inside a record, e.g. `["meta", "updated_at"]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CursorField(Vec<String>);

impl CursorField {
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(path.into_iter().map(Into::into).collect())
    }

    /// Parse a dotted path such as `"meta.updated_at"`.
    #[must_use]
    pub fn from_dotted(path: &str) -> Self {
        Self::new(path.split('.').filter(|s| !s.is_empty()))
    }

    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.0
    }

    /// Resolve the path against a record's data.
    #[must_use]
    pub fn extract<'a>(&self, data: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.0.split_first()?;
        let mut current = data.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

impl Display for CursorField {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for CursorField {
    fn from(path: &str) -> Self {
        Self::from_dotted(path)
    }
}

/// A comparable cursor value.
///
/// Integers and floats compare numerically with each other; text compares
/// lexicographically (ISO-8601 timestamps sort correctly) and sorts after all
/// numbers. Booleans, nulls, arrays and objects are not cursor values.
#[derive(Clone, Debug)]
pub enum CursorValue {
    Integer(i64),
    Float(OrderedFloat<f64>),
    Text(String),
}

impl CursorValue {
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(|f| Self::Float(OrderedFloat(f)))),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Integer(i) => Value::from(*i),
            Self::Float(f) => Value::from(f.0),
            Self::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl Ord for CursorValue {
    #[allow(clippy::cast_precision_loss)]
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.cmp(b),
            (Self::Integer(a), Self::Float(b)) => OrderedFloat(*a as f64).cmp(b),
            (Self::Float(a), Self::Integer(b)) => a.cmp(&OrderedFloat(*b as f64)),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Text(_), _) => Ordering::Greater,
            (_, Self::Text(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for CursorValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CursorValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CursorValue {}

/// Running high-water mark of one stream's cursor.
///
/// Owned by the consumer thread; never shared with workers.
#[derive(Clone, Debug)]
pub struct CursorAccumulator {
    field: CursorField,
    high_water: Option<CursorValue>,
    checkpointed: Option<CursorValue>,
    partitions_closed: usize,
}

impl CursorAccumulator {
    #[must_use]
    pub fn new(field: CursorField) -> Self {
        Self {
            field,
            high_water: None,
            checkpointed: None,
            partitions_closed: 0,
        }
    }

    /// Start from a previously persisted value.
    #[must_use]
    pub fn with_start(mut self, start: CursorValue) -> Self {
        self.checkpointed = Some(start.clone());
        self.high_water = Some(start);
        self
    }

    #[must_use]
    pub fn field(&self) -> &CursorField {
        &self.field
    }

    /// Fold one record into the high-water mark. Returns true if it advanced.
    ///
    /// Records without a usable cursor value leave the mark untouched.
    pub fn observe(&mut self, record: &Record) -> bool {
        let Some(candidate) = self
            .field
            .extract(&record.data)
            .and_then(CursorValue::from_json)
        else {
            return false;
        };
        if self.high_water.as_ref().is_some_and(|hw| *hw >= candidate) {
            return false;
        }
        self.high_water = Some(candidate);
        true
    }

    #[must_use]
    pub fn value(&self) -> Option<&CursorValue> {
        self.high_water.as_ref()
    }

    /// Mark one partition as closed.
    ///
    /// Returns the value to checkpoint if the mark moved since the last
    /// checkpoint, `None` otherwise.
    pub fn close_partition(&mut self) -> Option<CursorValue> {
        self.partitions_closed += 1;
        if self.high_water == self.checkpointed {
            return None;
        }
        self.checkpointed.clone_from(&self.high_water);
        self.high_water.clone()
    }

    #[must_use]
    pub fn partitions_closed(&self) -> usize {
        self.partitions_closed
    }
}
