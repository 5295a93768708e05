use chrono::{DateTime, NaiveDateTime, Utc};
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cli::Cli;
use crate::error::{ForecastError, Result};

/// Immutable runtime configuration, assembled once at startup from four
/// ordered sources: built-in defaults < `[general]` file section <
/// `[forecaster]` file section < CLI flags. Never re-read at runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub forecaster: ForecasterConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// Log threshold: trace, debug, info, warn or error.
    pub logging_level: String,
    pub influxdb_host: String,
    pub influxdb_port: u16,
    pub influxdb_database: String,
    pub influxdb_username: String,
    pub influxdb_password: String,
    /// Sensor coordinates as "latitude,longitude".
    pub gps_location: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForecasterConfig {
    /// Measurement holding raw meter pulses.
    pub measurement_ts: String,
    /// Measurement caching already-processed hourly power.
    pub processed_ts: String,
    /// Measurement receiving the forecast quantiles.
    pub forecast_ts: String,
    /// Measurement holding weather history and forecasts.
    pub weather_ts: String,
    /// Seconds between two forecasting cycles.
    pub forecast_interval: u64,
    /// Forecast horizon, in hours.
    pub horizon_length: u32,
    /// Join temperature features into the model when true.
    pub use_temperature: bool,
    pub weather_server_url: String,
    /// Earliest timestamp the weather service can serve, "YYYY-mm-dd HH:MM:SS" UTC.
    pub weather_start_timestamp: String,
    /// Hours between two weather forecast issues.
    pub weather_forecast_interval: u32,
    /// Energy per meter pulse, in watt-hours.
    pub wh_per_pulse: f64,
    /// Width of the pulse-differencing bucket, in seconds.
    pub bucket_seconds: u32,
    /// Power readings at or above this are discarded as outliers, in watts.
    pub max_power_w: f64,
    /// Training lookback window, in days.
    pub lookback_days: u32,
    /// Minimum hourly training rows for a valid model.
    pub min_training_samples: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                logging_level: "info".to_string(),
                influxdb_host: "influxdb".to_string(),
                influxdb_port: 8086,
                influxdb_database: "Emon".to_string(),
                influxdb_username: "root".to_string(),
                influxdb_password: "root".to_string(),
                gps_location: "0.0,0.0".to_string(),
            },
            forecaster: ForecasterConfig {
                measurement_ts: "emontx3".to_string(),
                processed_ts: "processed".to_string(),
                forecast_ts: "forecast".to_string(),
                weather_ts: "weather".to_string(),
                forecast_interval: 60 * 60 * 6,
                horizon_length: 72,
                use_temperature: true,
                weather_server_url: "http://weather.invalid/api/gfs/T2?date=".to_string(),
                weather_start_timestamp: "2021-03-08 00:00:00".to_string(),
                weather_forecast_interval: 6,
                wh_per_pulse: 1.0,
                bucket_seconds: 300,
                max_power_w: 15_000.0,
                lookback_days: 28,
                min_training_samples: 24,
            },
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the optional TOML file, then CLI
    /// overrides.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = &cli.config_file {
            if !Path::new(path).exists() {
                return Err(ForecastError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let mut cfg: Config = figment
            .extract()
            .map_err(|e| ForecastError::Config(e.to_string()))?;

        cli.apply_overrides(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        self.gps_coordinates()?;
        self.weather_start()?;
        if self.forecaster.horizon_length == 0 {
            return Err(ForecastError::Config("horizon_length must be > 0".into()));
        }
        if self.forecaster.bucket_seconds == 0 || self.forecaster.bucket_seconds > 3600 {
            return Err(ForecastError::Config(
                "bucket_seconds must be in 1..=3600".into(),
            ));
        }
        if self.forecaster.wh_per_pulse <= 0.0 {
            return Err(ForecastError::Config("wh_per_pulse must be positive".into()));
        }
        match self.general.logging_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ForecastError::Config(format!(
                "unknown logging_level \"{other}\""
            ))),
        }
    }

    /// Base URL of the InfluxDB HTTP API.
    pub fn influx_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.general.influxdb_host, self.general.influxdb_port
        )
    }

    pub fn gps_coordinates(&self) -> Result<(f64, f64)> {
        let (lat, lon) = self
            .general
            .gps_location
            .split_once(',')
            .ok_or_else(|| {
                ForecastError::Config(format!(
                    "gps_location \"{}\" is not \"lat,lon\"",
                    self.general.gps_location
                ))
            })?;
        let parse = |s: &str| {
            s.trim()
                .parse::<f64>()
                .map_err(|e| ForecastError::Config(format!("bad coordinate \"{s}\": {e}")))
        };
        Ok((parse(lat)?, parse(lon)?))
    }

    /// First timestamp for which the weather service has data.
    pub fn weather_start(&self) -> Result<DateTime<Utc>> {
        let naive =
            NaiveDateTime::parse_from_str(&self.forecaster.weather_start_timestamp, "%Y-%m-%d %H:%M:%S")
                .map_err(|e| {
                    ForecastError::Config(format!(
                        "bad weather_start_timestamp \"{}\": {e}",
                        self.forecaster.weather_start_timestamp
                    ))
                })?;
        Ok(naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["power-load-forecaster"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_defaults_load_without_file() {
        let cfg = Config::load(&cli(&[])).unwrap();
        assert_eq!(cfg.general.influxdb_port, 8086);
        assert_eq!(cfg.forecaster.horizon_length, 72);
        assert_eq!(cfg.forecaster.forecast_interval, 21600);
        assert!(cfg.forecaster.use_temperature);
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cfg = Config::load(&cli(&[
            "--influxdb-host",
            "127.0.0.1",
            "--horizon-length",
            "24",
            "--use-temperature",
            "false",
        ]))
        .unwrap();
        assert_eq!(cfg.general.influxdb_host, "127.0.0.1");
        assert_eq!(cfg.forecaster.horizon_length, 24);
        assert!(!cfg.forecaster.use_temperature);
    }

    #[test]
    fn test_file_section_layering() {
        let dir = std::env::temp_dir().join("plf-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            r#"
[general]
influxdb_host = "db.local"

[forecaster]
horizon_length = 48
"#,
        )
        .unwrap();

        // File beats defaults, CLI beats file.
        let cfg = Config::load(&cli(&[
            "-c",
            path.to_str().unwrap(),
            "--horizon-length",
            "12",
        ]))
        .unwrap();
        assert_eq!(cfg.general.influxdb_host, "db.local");
        assert_eq!(cfg.forecaster.horizon_length, 12);
    }

    #[test]
    fn test_malformed_gps_is_config_error() {
        let err = Config::load(&cli(&["--gps-location", "not-a-pair"])).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bad_logging_level_rejected() {
        assert!(Config::load(&cli(&["--logging-level", "loud"])).is_err());
    }

    #[test]
    fn test_weather_start_parses() {
        let cfg = Config::load(&cli(&[])).unwrap();
        let start = cfg.weather_start().unwrap();
        assert_eq!(start.timestamp(), 1_615_161_600);
    }

    #[test]
    fn test_missing_config_file_is_fatal() {
        let err = Config::load(&cli(&["-c", "/nonexistent/forecaster.toml"])).unwrap_err();
        assert!(err.is_fatal());
    }
}
