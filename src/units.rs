//! Unit conversion to the metric system expected by the destination.
//!
//! Every convertible field belongs to a unit group. Conversion happens per
//! group from the record's unit system to METRIC (degC, mbar, km/h, cm).

use crate::observation::{Observation, Value, METRIC, METRICWX, US};

/// Unit system a record is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSystem {
    Us,
    Metric,
    MetricWx,
}

impl UnitSystem {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            US => Some(UnitSystem::Us),
            METRIC => Some(UnitSystem::Metric),
            METRICWX => Some(UnitSystem::MetricWx),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            UnitSystem::Us => US,
            UnitSystem::Metric => METRIC,
            UnitSystem::MetricWx => METRICWX,
        }
    }
}

/// Physical quantity a field measures, as far as conversion is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitGroup {
    Temperature,
    Pressure,
    Speed,
    /// Rain depth (cm in METRIC)
    Rain,
    /// Rain depth per hour (cm/h in METRIC)
    RainRate,
}

const TEMPERATURE_FIELDS: &[&str] = &[
    "outTemp",
    "inTemp",
    "dewpoint",
    "windchill",
    "heatindex",
    "appTemp",
];

/// Prefixes of numbered channel fields measured in degrees.
const TEMPERATURE_PREFIXES: &[&str] = &["extraTemp", "soilTemp", "leafTemp"];

const PRESSURE_FIELDS: &[&str] = &["barometer", "pressure", "altimeter"];

const SPEED_FIELDS: &[&str] = &["windSpeed", "windGust"];

const RAIN_FIELDS: &[&str] = &[
    "rain",
    "dayRain",
    "hourRain",
    "rain24",
    "stormRain",
    "monthRain",
    "yearRain",
];

/// Errors raised while mapping a record onto the wire vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum MapError {
    /// The record's unit system code is not one we know how to convert
    UnknownUnitSystem(i64),

    /// A field that needs unit conversion holds a non-numeric value
    NotNumeric { field: String },
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapError::UnknownUnitSystem(code) => write!(f, "unknown unit system {}", code),
            MapError::NotNumeric { field } => {
                write!(f, "field '{}' is not numeric and cannot be converted", field)
            }
        }
    }
}

impl std::error::Error for MapError {}

/// Unit group of a field, or `None` when the field needs no conversion.
pub fn group_of(field: &str) -> Option<UnitGroup> {
    if TEMPERATURE_FIELDS.contains(&field) || has_channel_prefix(field, TEMPERATURE_PREFIXES) {
        Some(UnitGroup::Temperature)
    } else if PRESSURE_FIELDS.contains(&field) {
        Some(UnitGroup::Pressure)
    } else if SPEED_FIELDS.contains(&field) {
        Some(UnitGroup::Speed)
    } else if field == "rainRate" {
        Some(UnitGroup::RainRate)
    } else if RAIN_FIELDS.contains(&field) {
        Some(UnitGroup::Rain)
    } else {
        None
    }
}

fn has_channel_prefix(field: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| {
        field
            .strip_prefix(prefix)
            .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    })
}

/// Convert a single value of the given group from `from` to METRIC.
pub fn to_metric(value: f64, group: UnitGroup, from: UnitSystem) -> f64 {
    match (from, group) {
        (UnitSystem::Metric, _) => value,
        (UnitSystem::Us, UnitGroup::Temperature) => (value - 32.0) * 5.0 / 9.0,
        (UnitSystem::Us, UnitGroup::Pressure) => value * 33.863_886_666_7,
        (UnitSystem::Us, UnitGroup::Speed) => value * 1.609_344,
        (UnitSystem::Us, UnitGroup::Rain | UnitGroup::RainRate) => value * 2.54,
        (UnitSystem::MetricWx, UnitGroup::Temperature | UnitGroup::Pressure) => value,
        (UnitSystem::MetricWx, UnitGroup::Speed) => value * 3.6,
        (UnitSystem::MetricWx, UnitGroup::Rain | UnitGroup::RainRate) => value / 10.0,
    }
}

/// Return a copy of the record with every convertible field in METRIC.
///
/// Fields outside the known unit groups are copied unchanged. Null and empty
/// values are left as they are.
pub fn to_metric_record(record: &Observation) -> Result<Observation, MapError> {
    let from = UnitSystem::from_code(record.us_units)
        .ok_or(MapError::UnknownUnitSystem(record.us_units))?;

    let mut converted = record.clone();
    converted.us_units = METRIC;

    if from == UnitSystem::Metric {
        return Ok(converted);
    }

    for (field, value) in converted.fields.iter_mut() {
        let Some(group) = group_of(field) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        match value {
            Value::Number(v) => *v = to_metric(*v, group, from),
            _ => {
                return Err(MapError::NotNumeric {
                    field: field.clone(),
                })
            }
        }
    }

    Ok(converted)
}
