//! InfluxDB 1.x HTTP client: InfluxQL reads, line-protocol writes.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;

use super::{SeriesRow, TimeRange, TimeSeriesStore};
use crate::config::Config;
use crate::domain::{MeasurementPoint, TagSet};
use crate::error::{ForecastError, Result};

#[derive(Clone)]
pub struct InfluxStore {
    base_url: String,
    database: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl InfluxStore {
    pub fn new(cfg: &Config) -> Result<Self> {
        Self::with_base_url(
            cfg.influx_url(),
            cfg.general.influxdb_database.clone(),
            cfg.general.influxdb_username.clone(),
            cfg.general.influxdb_password.clone(),
        )
    }

    pub fn with_base_url(
        base_url: String,
        database: String,
        username: String,
        password: String,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("power-load-forecaster/0.2"),
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .map_err(|e| ForecastError::StoreUnavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            database,
            username,
            password,
            client,
        })
    }

    /// Create the configured database when it does not exist. Influx 1.x
    /// CREATE DATABASE is idempotent.
    pub async fn ensure_database(&self) -> Result<()> {
        let q = format!("CREATE DATABASE \"{}\"", self.database);
        self.raw_query(&q).await?;
        Ok(())
    }

    async fn raw_query(&self, q: &str) -> Result<QueryResponse> {
        debug!(query = q, "influx query");
        let resp = self
            .client
            .post(format!("{}/query", self.base_url))
            .query(&[
                ("db", self.database.as_str()),
                ("epoch", "s"),
                ("u", self.username.as_str()),
                ("p", self.password.as_str()),
            ])
            .form(&[("q", q)])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ForecastError::QueryError(format!("HTTP {status}: {body}")));
        }

        let parsed: QueryResponse = serde_json::from_str(&body)
            .map_err(|e| ForecastError::QueryError(format!("bad query response: {e}")))?;
        for result in &parsed.results {
            if let Some(err) = &result.error {
                return Err(ForecastError::QueryError(err.clone()));
            }
        }
        Ok(parsed)
    }

    fn where_clause(range: &TimeRange, tags: Option<&TagSet>) -> String {
        let mut conds = Vec::new();
        if let Some(start) = range.start {
            conds.push(format!("time >= {}s", start.timestamp()));
        }
        if let Some(end) = range.end {
            conds.push(format!("time < {}s", end.timestamp()));
        }
        if let Some(tags) = tags {
            for (k, v) in tags {
                conds.push(format!("\"{}\" = '{}'", k, v.replace('\'', "\\'")));
            }
        }
        if conds.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conds.join(" AND "))
        }
    }

    async fn boundary_timestamp(
        &self,
        measurement: &str,
        field: &str,
        descending: bool,
    ) -> Result<Option<DateTime<Utc>>> {
        let order = if descending { " ORDER BY time DESC" } else { "" };
        let q = format!("SELECT \"{field}\" FROM \"{measurement}\"{order} LIMIT 1");
        let resp = self.raw_query(&q).await?;
        Ok(resp
            .first_series()
            .and_then(|s| s.values.first())
            .and_then(|row| row.first())
            .and_then(|t| t.as_i64())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
    }

    async fn write_lines(&self, lines: String, rows: usize) -> Result<usize> {
        let resp = self
            .client
            .post(format!("{}/write", self.base_url))
            .query(&[
                ("db", self.database.as_str()),
                ("precision", "s"),
                ("u", self.username.as_str()),
                ("p", self.password.as_str()),
            ])
            .body(lines)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 204 {
            return Ok(rows);
        }
        let body = resp.text().await.unwrap_or_default();
        // Partial rejections come back as 400 "partial write"; surface them.
        Err(ForecastError::QueryError(format!(
            "write rejected: HTTP {status}: {body}"
        )))
    }
}

/// Escape measurement names, tag keys/values and field keys per the line
/// protocol rules.
fn escape_ident(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ").replace('=', "\\=")
}

fn encode_row(measurement: &str, row: &SeriesRow) -> String {
    let mut line = escape_ident(measurement);
    for (k, v) in &row.tags {
        let _ = write!(line, ",{}={}", escape_ident(k), escape_ident(v));
    }
    let fields = row
        .fields
        .iter()
        .map(|(k, v)| format!("{}={}", escape_ident(k), v))
        .collect::<Vec<_>>()
        .join(",");
    let _ = write!(line, " {} {}", fields, row.timestamp.timestamp());
    line
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn ping(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/ping", self.base_url))
            .send()
            .await
            .map_err(|e| ForecastError::StoreUnavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ForecastError::StoreUnavailable(format!(
                "ping returned HTTP {}",
                resp.status()
            )))
        }
    }

    async fn read(
        &self,
        measurement: &str,
        field: &str,
        range: &TimeRange,
        tags: Option<&TagSet>,
    ) -> Result<Vec<MeasurementPoint>> {
        let q = format!(
            "SELECT \"{field}\" FROM \"{measurement}\"{}",
            Self::where_clause(range, tags)
        );
        let resp = self.raw_query(&q).await?;

        let mut points = Vec::new();
        if let Some(series) = resp.first_series() {
            for row in &series.values {
                let (Some(t), Some(v)) = (row.first(), row.get(1)) else {
                    continue;
                };
                // Nulls (e.g. from FILL) are skipped, not materialized.
                let (Some(secs), Some(value)) = (t.as_i64(), v.as_f64()) else {
                    continue;
                };
                if let Some(ts) = Utc.timestamp_opt(secs, 0).single() {
                    points.push(MeasurementPoint::new(ts, value));
                }
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
        if rows.is_empty() {
            return Ok(0);
        }
        let body = rows
            .iter()
            .map(|r| encode_row(measurement, r))
            .collect::<Vec<_>>()
            .join("\n");
        self.write_lines(body, rows.len()).await
    }

    async fn first_timestamp(
        &self,
        measurement: &str,
        field: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.boundary_timestamp(measurement, field, false).await
    }

    async fn last_timestamp(
        &self,
        measurement: &str,
        field: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.boundary_timestamp(measurement, field, true).await
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
}

impl QueryResponse {
    fn first_series(&self) -> Option<&Series> {
        self.results.first().and_then(|r| r.series.first())
    }
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[allow(dead_code)]
    name: String,
    #[allow(dead_code)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(url: &str) -> InfluxStore {
        InfluxStore::with_base_url(
            url.to_string(),
            "Emon".to_string(),
            "root".to_string(),
            "root".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_line_protocol_encoding() {
        let ts = Utc.timestamp_opt(1_615_161_600, 0).unwrap();
        let mut row = SeriesRow::new(ts).field("q25", 1800.5).field("median", 2000.0);
        row.tags.insert("source".into(), "gbm".into());
        assert_eq!(
            encode_row("forecast", &row),
            "forecast,source=gbm median=2000,q25=1800.5 1615161600"
        );
    }

    #[test]
    fn test_escaping_spaces_and_commas() {
        let ts = Utc.timestamp_opt(0, 0).unwrap();
        let row = SeriesRow::new(ts).field("power w", 1.0);
        assert_eq!(
            encode_row("my series,a", &row),
            "my\\ series\\,a power\\ w=1 0"
        );
    }

    #[test]
    fn test_where_clause() {
        let start = Utc.timestamp_opt(100, 0).unwrap();
        let end = Utc.timestamp_opt(200, 0).unwrap();
        assert_eq!(
            InfluxStore::where_clause(&TimeRange::between(start, end), None),
            " WHERE time >= 100s AND time < 200s"
        );
        assert_eq!(InfluxStore::where_clause(&TimeRange::all(), None), "");
    }

    #[tokio::test]
    async fn test_read_parses_epoch_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"statement_id": 0, "series": [{
                    "name": "emontx3",
                    "columns": ["time", "pulse"],
                    "values": [[1615161600, 42.0], [1615165200, null], [1615168800, 43.5]]
                }]}]
            })))
            .mount(&server)
            .await;

        let points = store(&server.uri())
            .read("emontx3", "pulse", &TimeRange::all(), None)
            .await
            .unwrap();
        // The null row is dropped.
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 42.0);
        assert_eq!(points[1].timestamp.timestamp(), 1_615_168_800);
    }

    #[tokio::test]
    async fn test_empty_result_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"statement_id": 0}]
            })))
            .mount(&server)
            .await;

        let points = store(&server.uri())
            .read("emontx3", "pulse", &TimeRange::all(), None)
            .await
            .unwrap();
        assert!(points.is_empty());
    }

    #[tokio::test]
    async fn test_statement_error_maps_to_query_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"statement_id": 0, "error": "invalid measurement"}]
            })))
            .mount(&server)
            .await;

        let err = store(&server.uri())
            .read("nope", "pulse", &TimeRange::all(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "query");
    }

    #[tokio::test]
    async fn test_write_counts_accepted_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/write"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let ts = Utc.timestamp_opt(1_615_161_600, 0).unwrap();
        let points = vec![
            MeasurementPoint::new(ts, 1.0),
            MeasurementPoint::new(ts + chrono::Duration::hours(1), 2.0),
        ];
        let n = store(&server.uri())
            .write("processed", "power", &points)
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn test_partial_write_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/write"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string("{\"error\":\"partial write: points beyond retention\"}"),
            )
            .mount(&server)
            .await;

        let ts = Utc.timestamp_opt(0, 0).unwrap();
        let err = store(&server.uri())
            .write("processed", "power", &[MeasurementPoint::new(ts, 1.0)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "query");
        assert!(err.to_string().contains("partial write"));
    }

    #[tokio::test]
    async fn test_ping_unreachable_is_store_unavailable() {
        // Nothing is listening on this port.
        let err = store("http://127.0.0.1:1").ping().await.unwrap_err();
        assert_eq!(err.kind(), "store_unavailable");
    }
}
