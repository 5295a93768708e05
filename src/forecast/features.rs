//! Feature construction: pulse differencing, resampling and the aligned
//! train/horizon feature frame.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::f64::consts::TAU;

use crate::domain::MeasurementPoint;
use crate::error::{ForecastError, Result};

pub const FEATURE_NAMES_CALENDAR: [&str; 6] = [
    "hour_sin", "hour_cos", "dow_sin", "dow_cos", "week", "month",
];
pub const FEATURE_NAMES_WEATHER: [&str; 4] =
    ["T2", "T2_daily_mean", "T2_daily_min", "T2_daily_max"];

/// Hourly temperature columns keyed by epoch hour, built from the weather
/// measurement. Missing hours resolve to 0.0; the model learns around the
/// fill value rather than interpolating across the train/forecast boundary.
#[derive(Debug, Default, Clone)]
pub struct WeatherTable {
    columns: BTreeMap<i64, [f64; 4]>,
}

impl WeatherTable {
    pub fn from_columns(
        hourly: &[MeasurementPoint],
        daily_mean: &[MeasurementPoint],
        daily_min: &[MeasurementPoint],
        daily_max: &[MeasurementPoint],
    ) -> Self {
        let mut columns: BTreeMap<i64, [f64; 4]> = BTreeMap::new();
        let mut fill = |idx: usize, points: &[MeasurementPoint]| {
            for p in points {
                columns.entry(hour_floor(p.timestamp).timestamp()).or_default()[idx] = p.value;
            }
        };
        fill(0, hourly);
        fill(1, daily_mean);
        fill(2, daily_min);
        fill(3, daily_max);
        Self { columns }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn lookup(&self, ts: DateTime<Utc>) -> [f64; 4] {
        self.columns
            .get(&hour_floor(ts).timestamp())
            .copied()
            .unwrap_or_default()
    }
}

/// Aligned training and prediction matrices over a strictly increasing,
/// regularly spaced hourly index. Rows with an observed target are the
/// training set; the horizon rows are the prediction set.
#[derive(Debug, Clone)]
pub struct FeatureFrame {
    pub feature_names: Vec<String>,
    pub train_timestamps: Vec<DateTime<Utc>>,
    pub train_x: Vec<Vec<f64>>,
    pub train_y: Vec<f64>,
    pub horizon_timestamps: Vec<DateTime<Utc>>,
    pub horizon_x: Vec<Vec<f64>>,
}

impl FeatureFrame {
    /// Build the frame from hourly observed power. The horizon starts one
    /// bucket after the last observed hour.
    pub fn build(
        hourly_power: &[MeasurementPoint],
        horizon_length: u32,
        weather: Option<&WeatherTable>,
        min_training_samples: usize,
    ) -> Result<Self> {
        let Some(last) = hourly_power.last() else {
            return Err(ForecastError::InsufficientData {
                got: 0,
                need: min_training_samples.max(1),
            });
        };
        let last = last.timestamp;
        if hourly_power.len() < min_training_samples {
            return Err(ForecastError::InsufficientData {
                got: hourly_power.len(),
                need: min_training_samples,
            });
        }

        let mut feature_names: Vec<String> =
            FEATURE_NAMES_CALENDAR.iter().map(|s| s.to_string()).collect();
        if weather.is_some() {
            feature_names.extend(FEATURE_NAMES_WEATHER.iter().map(|s| s.to_string()));
        }

        let row = |ts: DateTime<Utc>| -> Vec<f64> {
            let mut x = calendar_features(ts);
            if let Some(table) = weather {
                x.extend_from_slice(&table.lookup(ts));
            }
            x
        };

        let mut train_timestamps = Vec::with_capacity(hourly_power.len());
        let mut train_x = Vec::with_capacity(hourly_power.len());
        let mut train_y = Vec::with_capacity(hourly_power.len());
        for p in hourly_power {
            train_timestamps.push(p.timestamp);
            train_x.push(row(p.timestamp));
            train_y.push(p.value);
        }

        let mut horizon_timestamps = Vec::with_capacity(horizon_length as usize);
        let mut horizon_x = Vec::with_capacity(horizon_length as usize);
        for h in 1..=i64::from(horizon_length) {
            let ts = hour_floor(last) + Duration::hours(h);
            horizon_timestamps.push(ts);
            horizon_x.push(row(ts));
        }

        Ok(Self {
            feature_names,
            train_timestamps,
            train_x,
            train_y,
            horizon_timestamps,
            horizon_x,
        })
    }
}

pub fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp() - ts.timestamp().rem_euclid(3600);
    Utc.timestamp_opt(secs, 0).single().unwrap_or(ts)
}

fn bucket_floor(ts: DateTime<Utc>, bucket_seconds: u32) -> i64 {
    let width = i64::from(bucket_seconds);
    ts.timestamp() - ts.timestamp().rem_euclid(width)
}

/// Cyclical encodings of hour-of-day and day-of-week avoid the midnight /
/// Sunday-Monday discontinuity; ISO week and month stay ordinal, as the
/// source data covers too few years for a cyclic year signal to matter.
pub fn calendar_features(ts: DateTime<Utc>) -> Vec<f64> {
    let hour = ts.hour() as f64;
    let dow = ts.weekday().num_days_from_monday() as f64;
    vec![
        (TAU * hour / 24.0).sin(),
        (TAU * hour / 24.0).cos(),
        (TAU * dow / 7.0).sin(),
        (TAU * dow / 7.0).cos(),
        ts.iso_week().week() as f64,
        ts.month() as f64,
    ]
}

fn median(values: &mut Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Convert cumulative pulse counts to instantaneous power draw by fixed
/// time-bucket differencing.
///
/// Pulses are bucketed to `bucket_seconds` (median per bucket, which rides
/// out spurious counter glitches), differenced between consecutive buckets,
/// and scaled by the meter constant to average watts over the bucket gap.
/// Negative deltas (counter reset) and readings at or above `max_power_w`
/// are dropped.
pub fn pulses_to_power(
    pulses: &[MeasurementPoint],
    bucket_seconds: u32,
    wh_per_pulse: f64,
    max_power_w: f64,
) -> Vec<MeasurementPoint> {
    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for p in pulses {
        buckets
            .entry(bucket_floor(p.timestamp, bucket_seconds))
            .or_default()
            .push(p.value);
    }

    buckets
        .into_iter()
        .map(|(secs, mut vals)| (secs, median(&mut vals)))
        .tuple_windows()
        .filter_map(|((t0, p0), (t1, p1))| {
            let dt = (t1 - t0) as f64;
            let dp = p1 - p0;
            if dp < 0.0 {
                return None;
            }
            let power_w = dp * wh_per_pulse * 3600.0 / dt;
            if power_w >= max_power_w {
                return None;
            }
            let ts = Utc.timestamp_opt(t1, 0).single()?;
            Some(MeasurementPoint::new(ts, power_w))
        })
        .collect()
}

/// Mean-resample a series into hourly buckets, dropping empty hours.
/// Idempotent: an already hourly, gap-free series maps to itself.
pub fn resample_hourly(points: &[MeasurementPoint]) -> Vec<MeasurementPoint> {
    let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for p in points {
        let e = buckets.entry(hour_floor(p.timestamp).timestamp()).or_default();
        e.0 += p.value;
        e.1 += 1;
    }
    buckets
        .into_iter()
        .filter_map(|(secs, (sum, n))| {
            let ts = Utc.timestamp_opt(secs, 0).single()?;
            Some(MeasurementPoint::new(ts, sum / n as f64))
        })
        .collect()
}

/// Merge previously processed hourly power with a freshly processed batch,
/// keeping the newest value on a duplicate hour.
pub fn merge_keep_last(
    previous: &[MeasurementPoint],
    fresh: &[MeasurementPoint],
) -> Vec<MeasurementPoint> {
    let mut merged: BTreeMap<i64, f64> = BTreeMap::new();
    for p in previous.iter().chain(fresh) {
        merged.insert(p.timestamp.timestamp(), p.value);
    }
    merged
        .into_iter()
        .filter_map(|(secs, value)| {
            let ts = Utc.timestamp_opt(secs, 0).single()?;
            Some(MeasurementPoint::new(ts, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn base() -> DateTime<Utc> {
        Utc.timestamp_opt(1_615_161_600, 0).unwrap() // 2021-03-08 00:00:00 UTC, a Monday
    }

    fn hourly_series(hours: i64, value: f64) -> Vec<MeasurementPoint> {
        (0..hours)
            .map(|h| MeasurementPoint::new(base() + Duration::hours(h), value))
            .collect()
    }

    #[test]
    fn test_pulse_differencing_constant_load() {
        // One pulse of 1 Wh every 300 s is a steady 12 W draw.
        let pulses: Vec<MeasurementPoint> = (0..20)
            .map(|i| MeasurementPoint::new(base() + Duration::seconds(300 * i), i as f64))
            .collect();
        let power = pulses_to_power(&pulses, 300, 1.0, 15_000.0);
        assert_eq!(power.len(), 19);
        for p in &power {
            assert!((p.value - 12.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_counter_reset_dropped() {
        let mut pulses = vec![
            MeasurementPoint::new(base(), 100.0),
            MeasurementPoint::new(base() + Duration::seconds(300), 110.0),
            MeasurementPoint::new(base() + Duration::seconds(600), 0.0), // reset
            MeasurementPoint::new(base() + Duration::seconds(900), 10.0),
        ];
        let power = pulses_to_power(&pulses, 300, 1.0, 15_000.0);
        // The negative delta bucket is skipped; the others survive.
        assert_eq!(power.len(), 2);
        pulses.clear();
        assert!(pulses_to_power(&pulses, 300, 1.0, 15_000.0).is_empty());
    }

    #[test]
    fn test_outlier_cap() {
        let pulses = vec![
            MeasurementPoint::new(base(), 0.0),
            // 5000 pulses in 5 minutes = 60 kW, above the default cap.
            MeasurementPoint::new(base() + Duration::seconds(300), 5000.0),
        ];
        assert!(pulses_to_power(&pulses, 300, 1.0, 15_000.0).is_empty());
    }

    #[test]
    fn test_resample_is_idempotent() {
        let series = hourly_series(48, 2000.0);
        let once = resample_hourly(&series);
        let twice = resample_hourly(&once);
        assert_eq!(once, series);
        assert_eq!(twice, once);
    }

    #[test]
    fn test_resample_averages_within_hour() {
        let points = vec![
            MeasurementPoint::new(base() + Duration::minutes(5), 100.0),
            MeasurementPoint::new(base() + Duration::minutes(35), 300.0),
        ];
        let hourly = resample_hourly(&points);
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].timestamp, base());
        assert_eq!(hourly[0].value, 200.0);
    }

    #[test]
    fn test_merge_keep_last() {
        let previous = hourly_series(3, 1.0);
        let fresh = vec![MeasurementPoint::new(base() + Duration::hours(2), 9.0)];
        let merged = merge_keep_last(&previous, &fresh);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[2].value, 9.0);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(59, 0)]
    #[case(60, 3600)]
    #[case(3599, 0)]
    #[case(3600, 3600)]
    #[case(7201, 7200)]
    fn test_hour_floor(#[case] offset_secs: i64, #[case] floored_secs: i64) {
        let ts = base() + Duration::seconds(offset_secs);
        assert_eq!(hour_floor(ts), base() + Duration::seconds(floored_secs));
    }

    #[test]
    fn test_calendar_features_cyclical_continuity() {
        let end_of_day = calendar_features(base() + Duration::hours(23));
        let next_midnight = calendar_features(base() + Duration::hours(24));
        // sin/cos encodings stay close across the midnight boundary.
        assert!((end_of_day[0] - next_midnight[0]).abs() < 0.3);
        assert!((end_of_day[1] - next_midnight[1]).abs() < 0.3);
    }

    #[test]
    fn test_frame_horizon_starts_after_last_observation() {
        let series = hourly_series(48, 2000.0);
        let frame = FeatureFrame::build(&series, 72, None, 24).unwrap();
        assert_eq!(frame.train_x.len(), 48);
        assert_eq!(frame.horizon_x.len(), 72);
        assert_eq!(
            frame.horizon_timestamps[0],
            series.last().unwrap().timestamp + Duration::hours(1)
        );
        // Strictly increasing, regularly spaced.
        for pair in frame.horizon_timestamps.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::hours(1));
        }
    }

    #[test]
    fn test_frame_insufficient_data() {
        let series = hourly_series(5, 2000.0);
        let err = FeatureFrame::build(&series, 72, None, 24).unwrap_err();
        assert_eq!(err.kind(), "insufficient_data");
    }

    #[test]
    fn test_frame_weather_columns_joined() {
        let series = hourly_series(24, 2000.0);
        let temps: Vec<MeasurementPoint> = (0..48)
            .map(|h| MeasurementPoint::new(base() + Duration::hours(h), 10.0 + h as f64 * 0.1))
            .collect();
        let table = WeatherTable::from_columns(&temps, &[], &[], &[]);
        let frame = FeatureFrame::build(&series, 72, Some(&table), 24).unwrap();

        assert_eq!(frame.feature_names.len(), 10);
        let t2_idx = frame
            .feature_names
            .iter()
            .position(|n| n == "T2")
            .unwrap();
        // Horizon rows use the forecast temperature for future buckets.
        assert!((frame.horizon_x[0][t2_idx] - 12.4).abs() < 1e-9);
        // A bucket past the weather table falls back to the documented 0.0 fill.
        assert_eq!(frame.horizon_x[71][t2_idx], 0.0);
    }
}
