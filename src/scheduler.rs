//! The cadence loop: Idle until the tick fires, Running for exactly one
//! cycle, back to Idle. A failed cycle is logged and the loop keeps going;
//! shutdown only ever lands between cycles.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::forecast::ForecastPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

pub struct Scheduler {
    pipeline: ForecastPipeline,
    interval: Duration,
    state: SchedulerState,
}

impl Scheduler {
    pub fn new(pipeline: ForecastPipeline, interval: Duration) -> Self {
        Self {
            pipeline,
            interval: interval.max(Duration::from_secs(1)),
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Execute one cycle, absorbing every per-cycle error. Returns whether
    /// the cycle produced a forecast.
    pub async fn run_once(&mut self) -> bool {
        self.state = SchedulerState::Running;
        let started = std::time::Instant::now();
        let outcome = self.pipeline.run_cycle(Utc::now()).await;
        self.state = SchedulerState::Idle;

        match outcome {
            Ok(report) => {
                info!(
                    elapsed_s = started.elapsed().as_secs(),
                    forecast_rows = report.forecast_rows,
                    "cycle finished"
                );
                true
            }
            Err(e) if e.kind() == "insufficient_data" => {
                // Expected while the meter history is still short: the prior
                // forecast (if any) stays valid in the store.
                warn!(error = %e, "cycle skipped");
                false
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "cycle failed");
                false
            }
        }
    }

    /// Run forever: first cycle immediately, then one per interval. The
    /// shutdown future stops the loop between cycles, never mid-cycle.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopping between cycles");
                    return;
                }
                _ = interval.tick() => {
                    self.run_once().await;
                }
            }
        }
    }
}
