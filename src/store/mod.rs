pub mod influx;
#[cfg(feature = "sim")]
pub mod memory;

pub use influx::InfluxStore;
#[cfg(feature = "sim")]
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::domain::{MeasurementPoint, TagSet};
use crate::error::Result;

/// Half-open query range `[start, end)`. Unbounded sides are omitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t < e)
    }
}

/// One multi-field row, e.g. a forecast record (q25/median/q75) or a weather
/// hour with its daily aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
    pub tags: TagSet,
}

impl SeriesRow {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
            tags: TagSet::new(),
        }
    }

    pub fn field(mut self, name: &str, value: f64) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }
}

/// Typed access to the time-series database.
///
/// Semantics (store-level, relied on by the pipeline):
/// - reads return points ordered by timestamp; an empty result is valid;
/// - writes are append-only with last-write-wins on a duplicate
///   (timestamp, tags) pair;
/// - partial write rejections surface as `QueryError`, never silently.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Cheap reachability probe, used once at startup (fatal) and never
    /// again.
    async fn ping(&self) -> Result<()>;

    async fn read(
        &self,
        measurement: &str,
        field: &str,
        range: &TimeRange,
        tags: Option<&TagSet>,
    ) -> Result<Vec<MeasurementPoint>>;

    /// Write a single-field series. Returns the number of points accepted.
    async fn write(
        &self,
        measurement: &str,
        field: &str,
        points: &[MeasurementPoint],
    ) -> Result<usize>;

    /// Write multi-field rows. Returns the number of rows accepted.
    async fn write_rows(&self, measurement: &str, rows: &[SeriesRow]) -> Result<usize>;

    async fn first_timestamp(
        &self,
        measurement: &str,
        field: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn last_timestamp(&self, measurement: &str, field: &str)
        -> Result<Option<DateTime<Utc>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_range_contains() {
        let s = Utc.timestamp_opt(100, 0).unwrap();
        let e = Utc.timestamp_opt(200, 0).unwrap();
        let r = TimeRange::between(s, e);
        assert!(r.contains(s));
        assert!(!r.contains(e)); // half-open
        assert!(r.contains(Utc.timestamp_opt(150, 0).unwrap()));
        assert!(TimeRange::all().contains(e));
    }
}
