use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One forecast horizon step: the 1st quartile, median and 3rd quartile of
/// the predicted power load, in watts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub timestamp: DateTime<Utc>,
    pub q25: f64,
    pub q50: f64,
    pub q75: f64,
}

impl ForecastRecord {
    /// Build a record from the three raw model outputs.
    ///
    /// Independently trained quantile regressors can cross (predicted median
    /// below the predicted 25th percentile). Policy: sort the three raw
    /// predictions into order rather than rejecting the row. Negative power
    /// is clamped to zero.
    pub fn from_raw(timestamp: DateTime<Utc>, raw_q25: f64, raw_q50: f64, raw_q75: f64) -> Self {
        let mut q = [raw_q25.max(0.0), raw_q50.max(0.0), raw_q75.max(0.0)];
        q.sort_by(|a, b| a.total_cmp(b));
        Self {
            timestamp,
            q25: q[0],
            q50: q[1],
            q75: q[2],
        }
    }

    pub fn is_monotone(&self) -> bool {
        self.q25 <= self.q50 && self.q50 <= self.q75
    }
}
