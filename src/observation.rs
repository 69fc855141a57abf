//! Observation records produced by the weather station capture layer.
//!
//! A record is a timestamped set of named measurements tagged with the unit
//! system they were captured in. Records are treated as immutable once
//! created; the pipeline works on copies when it needs to add or convert
//! fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Timestamp type (Unix epoch seconds)
pub type Timestamp = i64;

/// Unit system code for US customary units (degF, inHg, mph, inch).
pub const US: i64 = 1;

/// Unit system code for metric units (degC, mbar, km/h, cm).
pub const METRIC: i64 = 16;

/// Unit system code for metric units with wind in m/s and rain in mm.
pub const METRICWX: i64 = 17;

/// A single measurement value.
///
/// Values are numeric in the vast majority of cases. Some station drivers
/// report status codes or labels as text, which pass through the pipeline
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    Null,
}

impl Value {
    /// Numeric value, if this is a finite number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    /// Whether the value carries nothing worth sending.
    ///
    /// Nulls, blank strings and non-finite numbers are all empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Number(v) => !v.is_finite(),
            Value::Text(s) => s.trim().is_empty(),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// A timestamped set of weather measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Unix timestamp of the observation
    #[serde(rename = "dateTime")]
    pub date_time: Timestamp,

    /// Unit system code the measurements are expressed in
    #[serde(rename = "usUnits")]
    pub us_units: i64,

    /// Measurements keyed by internal field name
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Observation {
    /// Create an empty observation at the given time.
    pub fn new(date_time: Timestamp, us_units: i64) -> Self {
        Self {
            date_time,
            us_units,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style setter for a single field.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Whether the field is present, including when it is present but null.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Age of the record in seconds relative to `now`, saturating at the
    /// bounds of `i64`.
    pub fn age(&self, now: Timestamp) -> i64 {
        now.saturating_sub(self.date_time)
    }
}

/// The two kinds of observation events emitted by the capture layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Raw, high frequency sample straight from the station
    NewLoopPacket(Observation),

    /// Aggregated record written to the archive at the end of an interval
    NewArchiveRecord(Observation),
}

impl Event {
    pub fn observation(&self) -> &Observation {
        match self {
            Event::NewLoopPacket(obs) | Event::NewArchiveRecord(obs) => obs,
        }
    }
}
