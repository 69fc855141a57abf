//! Mapping from internal observation fields to the Meteotemplate wire vocabulary.
//!
//! The table is built once when the worker is constructed and is read-only
//! afterwards, so mapping can happen from any thread without locking.

use crate::observation::{Observation, Value};
use crate::units::{self, MapError, UnitGroup};

/// Number of numbered sensor channels (extra temperature, soil, leaf...)
/// exposed on the wire.
pub const SENSOR_CHANNELS: usize = 4;

/// Rain fields arrive in centimeters after conversion; the wire wants mm.
const RAIN_SCALE: f64 = 10.0;

/// One entry of the field table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    /// Parameter name on the wire (case-sensitive)
    pub key: String,

    /// Internal observation field name
    pub field: String,

    /// Decimal places for numeric values; `None` passes values through as-is
    pub precision: Option<usize>,
}

impl FieldMapping {
    pub fn new(key: impl Into<String>, field: impl Into<String>, precision: Option<usize>) -> Self {
        Self {
            key: key.into(),
            field: field.into(),
            precision,
        }
    }

    /// Render a non-empty value for the wire.
    fn format(&self, value: &Value) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        match (value, self.precision) {
            (Value::Number(v), Some(places)) => Some(format!("{:.*}", places, v)),
            (Value::Number(v), None) => Some(v.to_string()),
            (Value::Text(s), _) => Some(s.clone()),
            (Value::Null, _) => None,
        }
    }
}

/// Fixed single-instance parameters: (key, field, precision).
const STATIC_FIELDS: &[(&str, &str, Option<usize>)] = &[
    ("T", "outTemp", Some(2)),
    ("H", "outHumidity", Some(0)),
    ("P", "barometer", Some(3)),
    ("UGP", "pressure", Some(3)),
    ("W", "windSpeed", Some(2)),
    ("G", "windGust", Some(2)),
    ("B", "windDir", Some(0)),
    ("RR", "rainRate", Some(3)),
    ("R", "dayRain", Some(3)),
    ("S", "radiation", Some(3)),
    ("UV", "UV", Some(1)),
    ("TIN", "inTemp", Some(2)),
    ("HIN", "inHumidity", Some(0)),
    ("D", "dewpoint", Some(2)),
    ("A", "heatindex", Some(2)),
    ("WC", "windchill", Some(2)),
    ("CO2", "co2", Some(0)),
    ("PM25", "pm2_5", Some(1)),
    ("PM10", "pm10_0", Some(1)),
    ("TXBAT", "txBatteryStatus", None),
    ("CONBAT", "consBatteryVoltage", Some(2)),
];

/// Per-channel parameters: (key prefix, field prefix, precision).
const CHANNEL_FIELDS: &[(&str, &str, Option<usize>)] = &[
    ("T", "extraTemp", Some(2)),
    ("H", "extraHumid", Some(0)),
    ("TS", "soilTemp", Some(2)),
    ("SM", "soilMoist", Some(0)),
    ("LT", "leafTemp", Some(2)),
    ("LW", "leafWet", Some(0)),
    ("BAT", "batteryStatus", None),
];

/// Immutable, ordered set of field mappings.
#[derive(Debug, Clone)]
pub struct FieldTable {
    entries: Vec<FieldMapping>,
}

impl FieldTable {
    /// Build a table from explicit entries.
    pub fn new(entries: Vec<FieldMapping>) -> Self {
        Self { entries }
    }

    /// The standard Meteotemplate table, including numbered channel variants.
    pub fn meteotemplate() -> Self {
        let mut entries: Vec<FieldMapping> = STATIC_FIELDS
            .iter()
            .map(|(key, field, precision)| FieldMapping::new(*key, *field, *precision))
            .collect();

        for channel in 1..=SENSOR_CHANNELS {
            for (key, field, precision) in CHANNEL_FIELDS {
                entries.push(FieldMapping::new(
                    format!("{}{}", key, channel),
                    format!("{}{}", field, channel),
                    *precision,
                ));
            }
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[FieldMapping] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the entry for a wire key.
    pub fn by_key(&self, key: &str) -> Option<&FieldMapping> {
        self.entries.iter().find(|e| e.key == key)
    }
}

impl Default for FieldTable {
    fn default() -> Self {
        Self::meteotemplate()
    }
}

/// Map a record onto (wire key, formatted value) pairs.
///
/// The record is first converted to METRIC and its rain fields rescaled from
/// cm to mm. A pair is produced for every table entry whose field is present
/// and non-empty, in table order. Fields missing from the table are ignored.
pub fn map_record(record: &Observation, table: &FieldTable) -> Result<Vec<(String, String)>, MapError> {
    let mut metric = units::to_metric_record(record)?;
    rescale_rain(&mut metric);

    let pairs = table
        .entries()
        .iter()
        .filter_map(|entry| {
            metric
                .get(&entry.field)
                .and_then(|value| entry.format(value))
                .map(|formatted| (entry.key.clone(), formatted))
        })
        .collect();

    Ok(pairs)
}

fn rescale_rain(record: &mut Observation) {
    for (field, value) in record.fields.iter_mut() {
        if !matches!(
            units::group_of(field),
            Some(UnitGroup::Rain | UnitGroup::RainRate)
        ) {
            continue;
        }
        if let Value::Number(v) = value {
            *v *= RAIN_SCALE;
        }
    }
}
