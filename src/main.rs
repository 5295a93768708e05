use anyhow::{Context, Result};
use clap::Parser;
use power_load_forecaster::{cli::Cli, config::Config, forecast, scheduler, store, telemetry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use forecast::ForecastPipeline;
use scheduler::Scheduler;
use store::{InfluxStore, TimeSeriesStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli).context("invalid configuration")?;

    telemetry::init_tracing(&cfg.general.logging_level);

    let (latitude, longitude) = cfg.gps_coordinates()?;
    info!(
        latitude,
        longitude,
        store = %cfg.influx_url(),
        horizon_hours = cfg.forecaster.horizon_length,
        interval_s = cfg.forecaster.forecast_interval,
        use_temperature = cfg.forecaster.use_temperature,
        "starting power load forecaster"
    );

    // The store must be reachable once at startup; after that, outages are
    // per-cycle events that the scheduler rides out.
    let influx = InfluxStore::new(&cfg)?;
    influx
        .ping()
        .await
        .context("time-series store unreachable at startup")?;
    influx.ensure_database().await?;

    let store: Arc<dyn TimeSeriesStore> = Arc::new(influx);
    let pipeline = ForecastPipeline::new(store, &cfg)?;
    let scheduler = Scheduler::new(
        pipeline,
        Duration::from_secs(cfg.forecaster.forecast_interval),
    );

    scheduler.run(telemetry::shutdown_signal()).await;

    warn!("shutdown complete");
    Ok(())
}
