//! Read-only access to the station archive and record enrichment.
//!
//! Raw station packets do not carry accumulated quantities such as the rain
//! that has fallen since midnight. When an archive is available those are
//! computed from historical rows and added to a copy of the record before
//! mapping. Enrichment is best-effort: callers fall back to the raw record
//! when it fails.

use std::sync::RwLock;

use chrono::{Local, TimeZone};

use crate::observation::{Observation, Timestamp, Value};

/// Accumulated fields derived from the archive: (field, window in seconds).
/// A window of `None` means "since the start of the local day".
const ACCUMULATIONS: &[(&str, Option<i64>)] = &[
    ("dayRain", None),
    ("hourRain", Some(3_600)),
    ("rain24", Some(86_400)),
];

/// Archive field summed to produce the accumulations.
const RAIN_FIELD: &str = "rain";

/// How long [`MemoryArchive`] keeps rows behind its newest one. Covers the
/// longest accumulation window plus a full local day.
pub const DEFAULT_RETENTION_SECS: i64 = 172_800;

/// Result of summing a field over a time window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveSum {
    /// Sum of all non-null values in the window
    pub total: f64,

    /// Smallest unit system code seen in the window
    pub min_units: i64,

    /// Largest unit system code seen in the window
    pub max_units: i64,
}

/// Errors that can occur while reading the archive.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveError {
    /// The archive could not be queried
    Unavailable(String),

    /// Rows in the window disagree with each other or with the record
    InconsistentUnits {
        field: String,
        record: i64,
        min: i64,
        max: i64,
    },

    /// The record timestamp has no representation in the local time zone
    Time(Timestamp),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Unavailable(e) => write!(f, "archive unavailable: {}", e),
            ArchiveError::InconsistentUnits {
                field,
                record,
                min,
                max,
            } => write!(
                f,
                "inconsistent units ({} vs {} vs {}) when querying for {}",
                record, min, max, field
            ),
            ArchiveError::Time(ts) => write!(f, "cannot compute start of day for {}", ts),
        }
    }
}

impl std::error::Error for ArchiveError {}

/// Read-only view of the historical archive.
pub trait Archive: Send + Sync {
    /// Sum `field` over rows with `after < dateTime <= until`.
    ///
    /// Returns `Ok(None)` when no row in the window has a value for the field.
    fn sum(&self, field: &str, after: Timestamp, until: Timestamp) -> Result<Option<ArchiveSum>, ArchiveError>;
}

/// Archive kept in memory, ordered by insertion.
///
/// Rows older than the retention window behind the newest row are dropped
/// on insert, so a long-running feed does not grow without bound.
#[derive(Debug)]
pub struct MemoryArchive {
    rows: RwLock<Vec<Observation>>,
    retention_secs: i64,
}

impl Default for MemoryArchive {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION_SECS)
    }
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive keeping `retention_secs` of history behind its newest row.
    pub fn with_retention(retention_secs: i64) -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            retention_secs: retention_secs.max(0),
        }
    }

    /// Append a record to the archive and prune rows past the retention window.
    pub fn insert(&self, record: Observation) {
        let Ok(mut rows) = self.rows.write() else {
            return;
        };
        rows.push(record);

        if let Some(newest) = rows.iter().map(|r| r.date_time).max() {
            let cutoff = newest.saturating_sub(self.retention_secs);
            rows.retain(|r| r.date_time >= cutoff);
        }
    }

    /// Drop every row older than `ts`, returning how many were removed.
    pub fn prune_before(&self, ts: Timestamp) -> usize {
        let Ok(mut rows) = self.rows.write() else {
            return 0;
        };
        let before = rows.len();
        rows.retain(|r| r.date_time >= ts);
        before - rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Archive for MemoryArchive {
    fn sum(&self, field: &str, after: Timestamp, until: Timestamp) -> Result<Option<ArchiveSum>, ArchiveError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| ArchiveError::Unavailable("archive lock poisoned".to_string()))?;

        let mut result: Option<ArchiveSum> = None;
        for row in rows.iter().filter(|r| r.date_time > after && r.date_time <= until) {
            let Some(value) = row.get(field).and_then(Value::as_f64) else {
                continue;
            };
            result = Some(match result {
                None => ArchiveSum {
                    total: value,
                    min_units: row.us_units,
                    max_units: row.us_units,
                },
                Some(acc) => ArchiveSum {
                    total: acc.total + value,
                    min_units: acc.min_units.min(row.us_units),
                    max_units: acc.max_units.max(row.us_units),
                },
            });
        }

        Ok(result)
    }
}

/// Timestamp of local midnight at the start of the day containing `ts`.
pub fn start_of_day<Tz: TimeZone>(ts: Timestamp, tz: &Tz) -> Result<Timestamp, ArchiveError> {
    let local = tz.timestamp_opt(ts, 0).single().ok_or(ArchiveError::Time(ts))?;
    let midnight = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .ok_or(ArchiveError::Time(ts))?;
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or(ArchiveError::Time(ts))
}

/// Enrich a record with archive-derived accumulations, using local time.
pub fn enrich(record: &Observation, archive: &dyn Archive) -> Result<Observation, ArchiveError> {
    enrich_in(record, archive, &Local)
}

/// Enrich a record with archive-derived accumulations in the given time zone.
///
/// Only fields absent from the record are computed. A window with no data
/// yields a null field. The input record is never modified.
pub fn enrich_in<Tz: TimeZone>(
    record: &Observation,
    archive: &dyn Archive,
    tz: &Tz,
) -> Result<Observation, ArchiveError> {
    let mut enriched = record.clone();
    let until = record.date_time;

    for (field, window) in ACCUMULATIONS {
        if record.contains(field) {
            continue;
        }

        let after = match window {
            Some(secs) => until - secs,
            None => start_of_day(until, tz)?,
        };

        let value = match archive.sum(RAIN_FIELD, after, until)? {
            Some(sum) => {
                if sum.min_units != record.us_units || sum.max_units != record.us_units {
                    return Err(ArchiveError::InconsistentUnits {
                        field: field.to_string(),
                        record: record.us_units,
                        min: sum.min_units,
                        max: sum.max_units,
                    });
                }
                Value::Number(sum.total)
            }
            None => Value::Null,
        };

        enriched.fields.insert(field.to_string(), value);
    }

    Ok(enriched)
}
