use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

/// Read pulse measurements from InfluxDB, compute power load forecasts and
/// store them back to InfluxDB.
#[derive(Debug, Parser)]
#[command(name = "power-load-forecaster", version, about)]
pub struct Cli {
    /// Path to a TOML config file with [general] and [forecaster] sections
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Threshold level for log messages (trace|debug|info|warn|error)
    #[arg(short = 'l', long)]
    pub logging_level: Option<String>,

    /// Hostname or address of the influx database
    #[arg(long)]
    pub influxdb_host: Option<String>,

    /// Port of the influx database
    #[arg(long)]
    pub influxdb_port: Option<u16>,

    /// GPS coordinates of the sensor as "latitude,longitude"
    #[arg(long)]
    pub gps_location: Option<String>,

    /// Time series containing the pulse measurements
    #[arg(long)]
    pub measurement_ts: Option<String>,

    /// Time series containing the processed pulse measurements
    #[arg(long)]
    pub processed_ts: Option<String>,

    /// Time series containing the power load forecasts
    #[arg(long)]
    pub forecast_ts: Option<String>,

    /// Time series containing weather historical data and forecasts
    #[arg(long)]
    pub weather_ts: Option<String>,

    /// Interval, in seconds, between consecutive forecasting runs
    #[arg(long)]
    pub forecast_interval: Option<u64>,

    /// Length, in hours, of the forecast horizon
    #[arg(long)]
    pub horizon_length: Option<u32>,

    /// Whether to use temperature as a model feature (true|false)
    #[arg(long)]
    pub use_temperature: Option<bool>,

    /// Base URL of the weather download service
    #[arg(long)]
    pub weather_server_url: Option<String>,

    /// Earliest timestamp served by the weather service, "YYYY-mm-dd HH:MM:SS"
    #[arg(long)]
    pub weather_start_timestamp: Option<String>,

    /// Interval, in hours, between consecutive weather forecasts
    #[arg(long)]
    pub weather_forecast_interval: Option<u32>,
}

impl Cli {
    /// Apply the flags that were actually given on top of the file/default
    /// configuration. CLI always wins.
    pub fn apply_overrides(&self, cfg: &mut Config) {
        macro_rules! set {
            ($field:expr, $target:expr) => {
                if let Some(v) = &$field {
                    $target = v.clone();
                }
            };
        }
        set!(self.logging_level, cfg.general.logging_level);
        set!(self.influxdb_host, cfg.general.influxdb_host);
        set!(self.influxdb_port, cfg.general.influxdb_port);
        set!(self.gps_location, cfg.general.gps_location);
        set!(self.measurement_ts, cfg.forecaster.measurement_ts);
        set!(self.processed_ts, cfg.forecaster.processed_ts);
        set!(self.forecast_ts, cfg.forecaster.forecast_ts);
        set!(self.weather_ts, cfg.forecaster.weather_ts);
        set!(self.forecast_interval, cfg.forecaster.forecast_interval);
        set!(self.horizon_length, cfg.forecaster.horizon_length);
        set!(self.use_temperature, cfg.forecaster.use_temperature);
        set!(self.weather_server_url, cfg.forecaster.weather_server_url);
        set!(
            self.weather_start_timestamp,
            cfg.forecaster.weather_start_timestamp
        );
        set!(
            self.weather_forecast_interval,
            cfg.forecaster.weather_forecast_interval
        );
    }
}
