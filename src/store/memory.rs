//! In-process store used by the `sim` feature and the integration tests,
//! mirroring the real store's last-write-wins semantics.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{SeriesRow, TimeRange, TimeSeriesStore};
use crate::domain::{MeasurementPoint, TagSet};
use crate::error::Result;

#[derive(Debug, Default, Clone)]
struct Row {
    fields: BTreeMap<String, f64>,
    tags: TagSet,
}

type Partition = BTreeMap<(i64, String), Row>;

#[derive(Default)]
pub struct MemoryStore {
    measurements: RwLock<HashMap<String, Partition>>,
}

fn tag_key(tags: &TagSet) -> String {
    tags.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows of a measurement in timestamp order, for test assertions.
    pub async fn rows(&self, measurement: &str) -> Vec<SeriesRow> {
        let guard = self.measurements.read().await;
        guard
            .get(measurement)
            .map(|partition| {
                partition
                    .iter()
                    .filter_map(|((secs, _), row)| {
                        let timestamp = Utc.timestamp_opt(*secs, 0).single()?;
                        Some(SeriesRow {
                            timestamp,
                            fields: row.fields.clone(),
                            tags: row.tags.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn tags_match(row: &Row, wanted: Option<&TagSet>) -> bool {
        wanted.map_or(true, |wanted| {
            wanted.iter().all(|(k, v)| row.tags.get(k) == Some(v))
        })
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn read(
        &self,
        measurement: &str,
        field: &str,
        range: &TimeRange,
        tags: Option<&TagSet>,
    ) -> Result<Vec<MeasurementPoint>> {
        let guard = self.measurements.read().await;
        let Some(partition) = guard.get(measurement) else {
            return Ok(Vec::new());
        };
        let mut points = Vec::new();
        for ((secs, _), row) in partition {
            let Some(ts) = Utc.timestamp_opt(*secs, 0).single() else {
                continue;
            };
            if !range.contains(ts) || !Self::tags_match(row, tags) {
                continue;
            }
            if let Some(value) = row.fields.get(field) {
                let mut point = MeasurementPoint::new(ts, *value);
                point.tags = row.tags.clone();
                points.push(point);
            }
        }
        Ok(points)
    }

    async fn write(
        &self,
        measurement: &str,
        field: &str,
        points: &[MeasurementPoint],
    ) -> Result<usize> {
        let rows: Vec<SeriesRow> = points
            .iter()
            .map(|p| {
                let mut row = SeriesRow::new(p.timestamp).field(field, p.value);
                row.tags = p.tags.clone();
                row
            })
            .collect();
        self.write_rows(measurement, &rows).await
    }

    async fn write_rows(&self, measurement: &str, rows: &[SeriesRow]) -> Result<usize> {
        let mut guard = self.measurements.write().await;
        let partition = guard.entry(measurement.to_string()).or_default();
        for row in rows {
            let key = (row.timestamp.timestamp(), tag_key(&row.tags));
            let entry = partition.entry(key).or_default();
            entry.tags = row.tags.clone();
            // Fields merge; re-written fields take the newest value.
            for (k, v) in &row.fields {
                entry.fields.insert(k.clone(), *v);
            }
        }
        Ok(rows.len())
    }

    async fn first_timestamp(
        &self,
        measurement: &str,
        field: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read(measurement, field, &TimeRange::all(), None)
            .await?
            .first()
            .map(|p| p.timestamp))
    }

    async fn last_timestamp(
        &self,
        measurement: &str,
        field: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read(measurement, field, &TimeRange::all(), None)
            .await?
            .last()
            .map(|p| p.timestamp))
    }
}
