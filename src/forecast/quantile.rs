//! Gradient-boosted quantile regression on smartcore decision trees.
//!
//! Three independent ensembles target the 0.25, 0.50 and 0.75 quantiles of
//! power load with pinball loss. Each boosting round fits a tree to the
//! pinball pseudo-residuals and then replaces every leaf output with the
//! alpha-quantile of the residuals that landed in that leaf, the classic
//! line-search step for quantile loss. Fitting uses no subsampling, so
//! training is fully deterministic.

use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_regressor::{
    DecisionTreeRegressor, DecisionTreeRegressorParameters,
};
use std::collections::HashMap;
use tracing::debug;

use super::features::FeatureFrame;
use crate::domain::ForecastRecord;
use crate::error::{ForecastError, Result};

/// Fixed hyperparameters, tuned for short-horizon load forecasting and not
/// re-tuned per cycle.
#[derive(Debug, Clone)]
pub struct Hyperparameters {
    pub n_estimators: usize,
    pub max_depth: u16,
    pub learning_rate: f64,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Tail fraction of the training rows held out for early stopping.
    pub validation_fraction: f64,
    /// Stop after this many rounds without `tol` improvement.
    pub n_iter_no_change: usize,
    pub tol: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            n_estimators: 25,
            max_depth: 3,
            learning_rate: 0.1,
            min_samples_split: 5,
            min_samples_leaf: 2,
            validation_fraction: 0.2,
            n_iter_no_change: 5,
            tol: 0.01,
        }
    }
}

type Tree = DecisionTreeRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// One fitted quantile ensemble.
#[derive(Debug)]
pub struct QuantileGbm {
    alpha: f64,
    base_score: f64,
    learning_rate: f64,
    trees: Vec<Tree>,
    /// Per tree: raw leaf output (bit pattern) -> line-searched leaf value.
    leaf_values: Vec<HashMap<u64, f64>>,
}

/// The ephemeral model triple: created at the start of a cycle, discarded
/// after producing the forecast records. Never persisted.
#[derive(Debug)]
pub struct ModelTriple {
    pub q25: QuantileGbm,
    pub q50: QuantileGbm,
    pub q75: QuantileGbm,
}

pub struct QuantileForecaster {
    hyper: Hyperparameters,
}

impl Default for QuantileForecaster {
    fn default() -> Self {
        Self {
            hyper: Hyperparameters::default(),
        }
    }
}

impl QuantileForecaster {
    pub fn new(hyper: Hyperparameters) -> Self {
        Self { hyper }
    }

    /// Fit the three quantile ensembles over the frame's training rows.
    pub fn train(&self, frame: &FeatureFrame) -> Result<ModelTriple> {
        for y in &frame.train_y {
            if !y.is_finite() {
                return Err(ForecastError::Training(
                    "non-finite target in training frame".into(),
                ));
            }
        }
        Ok(ModelTriple {
            q25: QuantileGbm::fit(frame, 0.25, &self.hyper)?,
            q50: QuantileGbm::fit(frame, 0.50, &self.hyper)?,
            q75: QuantileGbm::fit(frame, 0.75, &self.hyper)?,
        })
    }

    /// Predict over the frame's horizon rows, enforcing q25 <= q50 <= q75
    /// per record.
    pub fn predict(&self, model: &ModelTriple, frame: &FeatureFrame) -> Result<Vec<ForecastRecord>> {
        let x = dense(&frame.horizon_x)?;
        let q25 = model.q25.predict_matrix(&x, frame.horizon_x.len())?;
        let q50 = model.q50.predict_matrix(&x, frame.horizon_x.len())?;
        let q75 = model.q75.predict_matrix(&x, frame.horizon_x.len())?;

        Ok(frame
            .horizon_timestamps
            .iter()
            .enumerate()
            .map(|(i, &ts)| ForecastRecord::from_raw(ts, q25[i], q50[i], q75[i]))
            .collect())
    }
}

impl QuantileGbm {
    fn fit(frame: &FeatureFrame, alpha: f64, hyper: &Hyperparameters) -> Result<Self> {
        let n = frame.train_y.len();
        let n_val = ((n as f64) * hyper.validation_fraction).floor() as usize;
        let n_train = n - n_val;

        let x_train = dense(&frame.train_x[..n_train])?;
        let y_train = &frame.train_y[..n_train];
        let x_val = if n_val > 0 {
            Some(dense(&frame.train_x[n_train..])?)
        } else {
            None
        };
        let y_val = &frame.train_y[n_train..];

        let base_score = quantile(y_train, alpha);
        let mut model = Self {
            alpha,
            base_score,
            learning_rate: hyper.learning_rate,
            trees: Vec::new(),
            leaf_values: Vec::new(),
        };

        let mut f_train = vec![base_score; n_train];
        let mut f_val = vec![base_score; n_val];
        let mut best_loss = pinball_loss(alpha, y_val, &f_val);
        let mut rounds_without_improvement = 0usize;

        for round in 0..hyper.n_estimators {
            let gradients: Vec<f64> = y_train
                .iter()
                .zip(&f_train)
                .map(|(y, f)| pseudo_residual(alpha, *y, *f))
                .collect();
            if gradients.iter().all(|g| *g == 0.0) {
                break; // already on the quantile everywhere
            }

            let params = DecisionTreeRegressorParameters::default()
                .with_max_depth(hyper.max_depth)
                .with_min_samples_split(hyper.min_samples_split)
                .with_min_samples_leaf(hyper.min_samples_leaf);
            let tree = DecisionTreeRegressor::fit(&x_train, &gradients, params)
                .map_err(|e| ForecastError::Training(format!("tree fit failed: {e}")))?;

            let raw = tree
                .predict(&x_train)
                .map_err(|e| ForecastError::Training(format!("tree predict failed: {e}")))?;

            // Line search: each leaf's output becomes the alpha-quantile of
            // the residuals it covers.
            let mut leaves: HashMap<u64, Vec<f64>> = HashMap::new();
            for (i, r) in raw.iter().enumerate() {
                leaves
                    .entry(r.to_bits())
                    .or_default()
                    .push(y_train[i] - f_train[i]);
            }
            let leaf_map: HashMap<u64, f64> = leaves
                .into_iter()
                .map(|(bits, residuals)| (bits, quantile(&residuals, alpha)))
                .collect();

            for (i, r) in raw.iter().enumerate() {
                f_train[i] += hyper.learning_rate * leaf_map[&r.to_bits()];
            }

            if let Some(x_val) = &x_val {
                let raw_val = tree
                    .predict(x_val)
                    .map_err(|e| ForecastError::Training(format!("tree predict failed: {e}")))?;
                for (i, r) in raw_val.iter().enumerate() {
                    let step = leaf_map.get(&r.to_bits()).copied().unwrap_or(*r);
                    f_val[i] += hyper.learning_rate * step;
                }
                let loss = pinball_loss(alpha, y_val, &f_val);
                if !loss.is_finite() {
                    return Err(ForecastError::Training(format!(
                        "validation loss diverged at round {round}"
                    )));
                }
                if best_loss - loss > hyper.tol {
                    best_loss = loss;
                    rounds_without_improvement = 0;
                } else {
                    rounds_without_improvement += 1;
                }
            }

            model.trees.push(tree);
            model.leaf_values.push(leaf_map);

            if n_val > 0 && rounds_without_improvement >= hyper.n_iter_no_change {
                break;
            }
        }

        debug!(
            alpha,
            rounds = model.trees.len(),
            base_score,
            "quantile ensemble fitted"
        );
        Ok(model)
    }

    fn predict_matrix(&self, x: &DenseMatrix<f64>, n_rows: usize) -> Result<Vec<f64>> {
        let mut out = vec![self.base_score; n_rows];
        for (tree, leaf_map) in self.trees.iter().zip(&self.leaf_values) {
            let raw = tree
                .predict(x)
                .map_err(|e| ForecastError::Training(format!("tree predict failed: {e}")))?;
            for (i, r) in raw.iter().enumerate() {
                let step = leaf_map.get(&r.to_bits()).copied().unwrap_or(*r);
                out[i] += self.learning_rate * step;
            }
        }
        Ok(out)
    }
}

fn dense(rows: &[Vec<f64>]) -> Result<DenseMatrix<f64>> {
    let n = rows.len();
    let m = rows.first().map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(n * m);
    for row in rows {
        if row.len() != m {
            return Err(ForecastError::Training("ragged feature matrix".into()));
        }
        flat.extend_from_slice(row);
    }
    DenseMatrix::new(n, m, flat, false)
        .map_err(|e| ForecastError::Training(format!("matrix build failed: {e}")))
}

/// Negative gradient of the pinball loss at (y, f): alpha above the current
/// estimate, alpha - 1 below it, zero on it.
fn pseudo_residual(alpha: f64, y: f64, f: f64) -> f64 {
    if y > f {
        alpha
    } else if y < f {
        alpha - 1.0
    } else {
        0.0
    }
}

fn pinball_loss(alpha: f64, y: &[f64], f: &[f64]) -> f64 {
    if y.is_empty() {
        return f64::INFINITY;
    }
    let total: f64 = y
        .iter()
        .zip(f)
        .map(|(y, f)| {
            let d = y - f;
            if d >= 0.0 {
                alpha * d
            } else {
                (alpha - 1.0) * -d
            }
        })
        .sum();
    total / y.len() as f64
}

/// Linear-interpolated empirical quantile.
fn quantile(values: &[f64], alpha: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = alpha * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MeasurementPoint;
    use chrono::{Duration, TimeZone, Utc};

    fn hourly_frame(values: &[f64], horizon: u32) -> FeatureFrame {
        let base = Utc.timestamp_opt(1_615_161_600, 0).unwrap();
        let series: Vec<MeasurementPoint> = values
            .iter()
            .enumerate()
            .map(|(h, v)| MeasurementPoint::new(base + Duration::hours(h as i64), *v))
            .collect();
        FeatureFrame::build(&series, horizon, None, 24).unwrap()
    }

    #[test]
    fn test_quantile_helper() {
        let v = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&v, 0.0), 1.0);
        assert_eq!(quantile(&v, 1.0), 4.0);
        assert_eq!(quantile(&v, 0.5), 2.5);
        assert_eq!(quantile(&[], 0.5), 0.0);
    }

    #[test]
    fn test_pinball_loss_asymmetry() {
        // Underprediction hurts the 0.75 model more than overprediction.
        let under = pinball_loss(0.75, &[10.0], &[8.0]);
        let over = pinball_loss(0.75, &[10.0], &[12.0]);
        assert!(under > over);
    }

    #[test]
    fn test_constant_input_collapses_quantile_spread() {
        let frame = hourly_frame(&vec![2000.0; 1000], 72);
        let forecaster = QuantileForecaster::default();
        let model = forecaster.train(&frame).unwrap();
        let records = forecaster.predict(&model, &frame).unwrap();

        assert_eq!(records.len(), 72);
        for r in &records {
            assert!((r.q25 - 2000.0).abs() < 1.0);
            assert!((r.q50 - 2000.0).abs() < 1.0);
            assert!((r.q75 - 2000.0).abs() < 1.0);
        }
    }

    #[test]
    fn test_quantiles_are_monotone_on_noisy_data() {
        // A deterministic daily pattern with alternating spikes.
        let values: Vec<f64> = (0..500)
            .map(|h| {
                let daily = 1000.0 + 800.0 * ((h % 24) as f64 / 24.0 * std::f64::consts::TAU).sin();
                let spike = if h % 3 == 0 { 400.0 } else { -200.0 };
                (daily + spike).max(0.0)
            })
            .collect();
        let frame = hourly_frame(&values, 48);
        let forecaster = QuantileForecaster::default();
        let model = forecaster.train(&frame).unwrap();
        let records = forecaster.predict(&model, &frame).unwrap();

        for r in &records {
            assert!(r.is_monotone(), "crossing at {}: {r:?}", r.timestamp);
            assert!(r.q25 >= 0.0);
        }
    }

    #[test]
    fn test_training_is_deterministic() {
        let values: Vec<f64> = (0..300)
            .map(|h| 1500.0 + 500.0 * ((h % 24) as f64).cos() + (h % 7) as f64 * 30.0)
            .collect();
        let frame = hourly_frame(&values, 24);
        let forecaster = QuantileForecaster::default();

        let a = forecaster
            .predict(&forecaster.train(&frame).unwrap(), &frame)
            .unwrap();
        let b = forecaster
            .predict(&forecaster.train(&frame).unwrap(), &frame)
            .unwrap();
        assert_eq!(a, b); // bit-identical
    }

    #[test]
    fn test_non_finite_target_is_training_error() {
        let mut values = vec![2000.0; 100];
        values[50] = f64::NAN;
        let frame = hourly_frame(&values, 24);
        let err = QuantileForecaster::default().train(&frame).unwrap_err();
        assert_eq!(err.kind(), "training");
    }
}
