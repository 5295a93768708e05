//! Weather ingestion: keeps the weather measurement current by backfilling
//! historical temperature and fetching the forward forecast window from the
//! remote web service.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::features::WeatherTable;
use crate::config::Config;
use crate::domain::MeasurementPoint;
use crate::error::{ForecastError, Result};
use crate::store::{SeriesRow, TimeRange, TimeSeriesStore};

const FIELD_HOURLY: &str = "T2";
const FIELD_DAILY_MEAN: &str = "T2_daily_mean";
const FIELD_DAILY_MIN: &str = "T2_daily_min";
const FIELD_DAILY_MAX: &str = "T2_daily_max";

pub struct WeatherProvider {
    client: reqwest::Client,
    server_url: String,
    weather_ts: String,
    measurement_ts: String,
    service_start: DateTime<Utc>,
    horizon_length: u32,
    forecast_interval_hours: u32,
}

impl WeatherProvider {
    pub fn new(cfg: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("power-load-forecaster/0.2"),
        );
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .default_headers(headers)
            .build()
            .map_err(|e| ForecastError::WeatherFetch(e.to_string()))?;
        Ok(Self {
            client,
            server_url: cfg.forecaster.weather_server_url.clone(),
            weather_ts: cfg.forecaster.weather_ts.clone(),
            measurement_ts: cfg.forecaster.measurement_ts.clone(),
            service_start: cfg.weather_start()?,
            horizon_length: cfg.forecaster.horizon_length,
            forecast_interval_hours: cfg.forecaster.weather_forecast_interval.max(1),
        })
    }

    /// Bring the stored weather series up to date, then return whatever the
    /// store holds. A remote failure is non-fatal: it is logged and the
    /// stored (possibly stale or empty) data is used for this cycle; the
    /// next tick is the retry.
    pub async fn refresh(
        &self,
        store: &dyn TimeSeriesStore,
        now: DateTime<Utc>,
    ) -> Result<WeatherTable> {
        let (start_time, end_time) = self.fetch_window(store, now).await?;

        if start_time <= end_time {
            match self.download(start_time, end_time).await {
                Ok(points) if !points.is_empty() => {
                    let rows = with_daily_aggregates(&points);
                    // Oldest-issued first, so observed hours overwrite the
                    // forecasts that predicted them (last-write-wins).
                    let written = store.write_rows(&self.weather_ts, &rows).await?;
                    debug!(written, measurement = %self.weather_ts, "weather series updated");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, kind = e.kind(), "weather fetch failed; using stored data");
                }
            }
        }

        self.read_stored(store).await
    }

    /// Range of forecast-issue hours to download: from the last point we
    /// already have (or the service start / first pulse) up to the newest
    /// issue boundary before `now`.
    async fn fetch_window(
        &self,
        store: &dyn TimeSeriesStore,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let first_pulse = store.first_timestamp(&self.measurement_ts, "pulse").await?;
        let last_pulse = store.last_timestamp(&self.measurement_ts, "pulse").await?;
        let first_weather = store
            .first_timestamp(&self.weather_ts, FIELD_DAILY_MEAN)
            .await?
            .map_or(self.service_start, |t| t.max(self.service_start));
        let last_weather = store.last_timestamp(&self.weather_ts, FIELD_DAILY_MEAN).await?;

        let start = match last_weather {
            None => first_pulse.map_or(first_weather, |p| p.min(first_weather)),
            Some(last) => last_pulse.map_or(last, |p| p.min(last)),
        };
        let start = day_floor(start.max(self.service_start));

        let interval = i64::from(self.forecast_interval_hours);
        let issue_hour = (i64::from(now.hour()) / interval) * interval;
        let end = day_floor(now) + Duration::hours(issue_hour);

        debug!(%start, %end, "weather fetch window");
        Ok((start, end))
    }

    /// Walk backwards from the newest issue time in `weather_forecast_interval`
    /// steps. Each issue is fetched once; a missing issue widens the window
    /// requested from the next older one so no hours are lost.
    async fn download(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<MeasurementPoint>> {
        let step = Duration::hours(i64::from(self.forecast_interval_hours));
        let mut chunks: Vec<Vec<MeasurementPoint>> = Vec::new();
        let mut n_hours = self.horizon_length as usize;
        let mut current = end_time;
        let mut last_error = None;

        while current >= start_time {
            match self.fetch_issue(current, n_hours).await {
                Ok(points) => {
                    debug!(issue = %current, points = points.len(), "weather issue fetched");
                    chunks.push(points);
                    n_hours = self.forecast_interval_hours as usize;
                }
                Err(e) => {
                    debug!(issue = %current, error = %e, "weather issue unavailable");
                    n_hours += self.forecast_interval_hours as usize;
                    if chunks.is_empty() {
                        n_hours = self.horizon_length as usize;
                    }
                    last_error = Some(e);
                }
            }
            current -= step;
        }

        if chunks.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| ForecastError::WeatherFetch("no weather issues in window".into())));
        }

        // Oldest issue first; duplicate hours resolve to the newest issue.
        let mut merged: BTreeMap<i64, f64> = BTreeMap::new();
        for chunk in chunks.into_iter().rev() {
            for p in chunk {
                merged.insert(p.timestamp.timestamp(), p.value);
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(secs, value)| {
                let ts = Utc.timestamp_opt(secs, 0).single()?;
                Some(MeasurementPoint::new(ts, value))
            })
            .collect())
    }

    async fn fetch_issue(
        &self,
        issue: DateTime<Utc>,
        n_hours: usize,
    ) -> Result<Vec<MeasurementPoint>> {
        let url = format!("{}{}", self.server_url, issue.format("%Y%m%d%H"));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ForecastError::WeatherFetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ForecastError::WeatherFetch(format!("HTTP {status} from {url}")));
        }
        let samples: Vec<RawWeatherSample> = resp
            .json()
            .await
            .map_err(|e| ForecastError::WeatherFetch(format!("bad weather payload: {e}")))?;

        Ok(samples
            .into_iter()
            .take(n_hours)
            .filter_map(|s| {
                let ts = Utc.timestamp_millis_opt(s.date).single()?;
                Some(MeasurementPoint::new(ts, s.t2))
            })
            .collect())
    }

    async fn read_stored(&self, store: &dyn TimeSeriesStore) -> Result<WeatherTable> {
        let range = TimeRange::all();
        let hourly = store.read(&self.weather_ts, FIELD_HOURLY, &range, None).await?;
        let mean = store
            .read(&self.weather_ts, FIELD_DAILY_MEAN, &range, None)
            .await?;
        let min = store
            .read(&self.weather_ts, FIELD_DAILY_MIN, &range, None)
            .await?;
        let max = store
            .read(&self.weather_ts, FIELD_DAILY_MAX, &range, None)
            .await?;
        Ok(WeatherTable::from_columns(&hourly, &mean, &min, &max))
    }
}

fn day_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp() - ts.timestamp().rem_euclid(86_400);
    Utc.timestamp_opt(secs, 0).single().unwrap_or(ts)
}

/// Attach daily mean/min/max columns to each hourly temperature point.
fn with_daily_aggregates(points: &[MeasurementPoint]) -> Vec<SeriesRow> {
    let mut days: BTreeMap<NaiveDate, (f64, f64, f64, usize)> = BTreeMap::new();
    for p in points {
        let e = days
            .entry(p.timestamp.date_naive())
            .or_insert((0.0, f64::INFINITY, f64::NEG_INFINITY, 0));
        e.0 += p.value;
        e.1 = e.1.min(p.value);
        e.2 = e.2.max(p.value);
        e.3 += 1;
    }

    points
        .iter()
        .map(|p| {
            let (sum, min, max, n) = days[&p.timestamp.date_naive()];
            SeriesRow::new(p.timestamp)
                .field(FIELD_HOURLY, p.value)
                .field(FIELD_DAILY_MEAN, sum / n as f64)
                .field(FIELD_DAILY_MIN, min)
                .field(FIELD_DAILY_MAX, max)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawWeatherSample {
    /// Epoch milliseconds of the forecast hour.
    date: i64,
    #[serde(rename = "T2", alias = "T2_BACKUP")]
    t2: f64,
}
