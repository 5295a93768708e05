//! One full forecasting cycle: refresh weather, rebuild features, retrain
//! the quantile models and persist the horizon forecast.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::features::{
    merge_keep_last, pulses_to_power, resample_hourly, FeatureFrame, WeatherTable,
};
use super::quantile::QuantileForecaster;
use super::weather::WeatherProvider;
use crate::config::{Config, ForecasterConfig};
use crate::domain::{ForecastRecord, MeasurementPoint};
use crate::error::{ForecastError, Result};
use crate::store::{SeriesRow, TimeRange, TimeSeriesStore};

/// Outcome of a successful cycle, for logging and tests.
#[derive(Debug, Clone, Copy)]
pub struct CycleReport {
    pub training_rows: usize,
    pub forecast_rows: usize,
    pub with_weather: bool,
}

pub struct ForecastPipeline {
    store: Arc<dyn TimeSeriesStore>,
    weather: Option<WeatherProvider>,
    forecaster: QuantileForecaster,
    cfg: ForecasterConfig,
}

impl ForecastPipeline {
    pub fn new(store: Arc<dyn TimeSeriesStore>, cfg: &Config) -> Result<Self> {
        let weather = if cfg.forecaster.use_temperature {
            Some(WeatherProvider::new(cfg)?)
        } else {
            None
        };
        Ok(Self {
            store,
            weather,
            forecaster: QuantileForecaster::default(),
            cfg: cfg.forecaster.clone(),
        })
    }

    /// Run one cycle at `now`. Every model and frame built here is dropped
    /// when the cycle ends; nothing is carried to the next tick except what
    /// lands in the store.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        // Weather first: a remote failure inside refresh degrades to stored
        // data, so only store errors propagate from here.
        let weather_table = match &self.weather {
            Some(provider) => {
                let table = provider.refresh(self.store.as_ref(), now).await?;
                if table.is_empty() {
                    warn!("no weather data available; forecasting without temperature");
                    None
                } else {
                    Some(table)
                }
            }
            None => None,
        };

        let hourly_power = self.preprocess_pulses().await?;
        let frame = FeatureFrame::build(
            &hourly_power,
            self.cfg.horizon_length,
            weather_table.as_ref(),
            self.cfg.min_training_samples,
        )?;

        let model = self.forecaster.train(&frame)?;
        let records = self.forecaster.predict(&model, &frame)?;
        let written = self.write_forecast(&records).await?;

        info!(
            training_rows = frame.train_y.len(),
            forecast_rows = written,
            with_weather = weather_table.is_some(),
            "forecast cycle complete"
        );
        Ok(CycleReport {
            training_rows: frame.train_y.len(),
            forecast_rows: written,
            with_weather: weather_table.is_some(),
        })
    }

    /// Produce the hourly power series over the lookback window, reusing
    /// hours already processed in earlier cycles and converting only the new
    /// pulse data.
    async fn preprocess_pulses(&self) -> Result<Vec<MeasurementPoint>> {
        let first_pulse = self
            .store
            .first_timestamp(&self.cfg.measurement_ts, "pulse")
            .await?
            .ok_or(ForecastError::InsufficientData {
                got: 0,
                need: self.cfg.min_training_samples,
            })?;

        let previous = self
            .store
            .read(
                &self.cfg.processed_ts,
                "power",
                &TimeRange::since(first_pulse),
                None,
            )
            .await?;
        // The most recent processed hour may have been partial when it was
        // written; re-process from one hour before it.
        let resume_from = previous
            .last()
            .map_or(first_pulse, |p| p.timestamp - Duration::hours(1));
        debug!(%first_pulse, %resume_from, "pulse preprocessing window");

        let pulses = self
            .store
            .read(
                &self.cfg.measurement_ts,
                "pulse",
                &TimeRange::since(resume_from),
                None,
            )
            .await?;
        let power = pulses_to_power(
            &pulses,
            self.cfg.bucket_seconds,
            self.cfg.wh_per_pulse,
            self.cfg.max_power_w,
        );
        let fresh = resample_hourly(&power);

        if !fresh.is_empty() {
            let written = self
                .store
                .write(&self.cfg.processed_ts, "power", &fresh)
                .await?;
            debug!(written, measurement = %self.cfg.processed_ts, "processed power cached");
        }

        let merged = merge_keep_last(&previous, &fresh);

        // Training lookback window, anchored at the last observed hour.
        let lookback = Duration::days(i64::from(self.cfg.lookback_days));
        Ok(match merged.last() {
            Some(last) => {
                let cutoff = last.timestamp - lookback;
                merged
                    .into_iter()
                    .filter(|p| p.timestamp >= cutoff)
                    .collect()
            }
            None => merged,
        })
    }

    async fn write_forecast(&self, records: &[ForecastRecord]) -> Result<usize> {
        let rows: Vec<SeriesRow> = records
            .iter()
            .map(|r| {
                SeriesRow::new(r.timestamp)
                    .field("q25", r.q25)
                    .field("median", r.q50)
                    .field("q75", r.q75)
            })
            .collect();
        self.store.write_rows(&self.cfg.forecast_ts, &rows).await
    }
}
