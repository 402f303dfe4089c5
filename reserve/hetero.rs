//! # Heteroskedasticity Loop
//!
//! Alternates between a weighted fit and a per-development-period variance
//! adjustment until successive adjustments agree. Each period's factor is the
//! global residual variance divided by that period's residual variance, so
//! noisy periods are down-weighted in the next fit.
//!
//! The loop owns no model state. It hands each weight snapshot to a fitting
//! callback and receives the training residuals back; the last snapshot is
//! returned to the caller. An observer runs after every iteration and may stop
//! the loop early.

use crate::triangle::CellId;
use crate::types::WeightVector;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

fn default_stop_threshold() -> f64 {
    0.01
}

fn default_max_iterations() -> usize {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeteroSettings {
    /// The loop stops once the RMSE between successive adjustment vectors
    /// drops below this value.
    #[serde(default = "default_stop_threshold")]
    pub stop_threshold: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for HeteroSettings {
    fn default() -> Self {
        Self {
            stop_threshold: default_stop_threshold(),
            max_iterations: default_max_iterations(),
        }
    }
}

/// Adjustment factor per development period.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DevelopmentAdjustments(pub BTreeMap<i64, f64>);

impl DevelopmentAdjustments {
    pub fn uniform(devs: &[i64]) -> Self {
        Self(devs.iter().map(|&dev| (dev, 1.0)).collect())
    }

    /// Periods without a recorded factor are not adjusted.
    pub fn factor(&self, dev: i64) -> f64 {
        self.0.get(&dev).copied().unwrap_or(1.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.0.iter().map(|(&dev, &factor)| (dev, factor))
    }
}

fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.is_finite().then_some(variance)
}

/// One adjustment step.
///
/// - period variance zero, or global variance undefined: factor 1
/// - periods after the latest training development period: factor 1
/// - periods with fewer than two residuals: mean of the nearest defined
///   neighbours on either side, 1 if there are none
pub fn compute_adjustments(
    train_devs: &[i64],
    residuals: ArrayView1<f64>,
    all_devs: &[i64],
) -> DevelopmentAdjustments {
    let mut by_dev: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for (&dev, &residual) in train_devs.iter().zip(residuals.iter()) {
        by_dev.entry(dev).or_default().push(residual);
    }
    let global = sample_variance(&residuals.to_vec());
    let max_train_dev = train_devs.iter().copied().max();

    let devs: BTreeSet<i64> = all_devs.iter().chain(train_devs).copied().collect();
    let raw: Vec<(i64, Option<f64>)> = devs
        .into_iter()
        .map(|dev| {
            if max_train_dev.is_none_or(|max| dev > max) {
                return (dev, Some(1.0));
            }
            let factor = match (global, by_dev.get(&dev).and_then(|r| sample_variance(r))) {
                (None, _) => Some(1.0),
                (Some(_), None) => None,
                (Some(_), Some(period)) if period == 0.0 => Some(1.0),
                (Some(global), Some(period)) => {
                    let factor = global / period;
                    Some(if factor.is_finite() { factor } else { 1.0 })
                }
            };
            (dev, factor)
        })
        .collect();

    let filled = raw
        .iter()
        .enumerate()
        .map(|(k, &(dev, factor))| {
            let factor = factor.unwrap_or_else(|| {
                let before = raw[..k].iter().rev().find_map(|(_, f)| *f);
                let after = raw[k + 1..].iter().find_map(|(_, f)| *f);
                match (before, after) {
                    (Some(a), Some(b)) => (a + b) / 2.0,
                    (Some(a), None) | (None, Some(a)) => a,
                    (None, None) => 1.0,
                }
            });
            (dev, factor)
        })
        .collect();
    DevelopmentAdjustments(filled)
}

fn rmse(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let squared: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
    (squared / a.len() as f64).sqrt()
}

/// Progress report handed to the observer after each iteration.
#[derive(Debug)]
pub struct HeteroIteration<'a> {
    pub iteration: usize,
    /// `None` on the first iteration.
    pub rmse: Option<f64>,
    pub adjustments: &'a DevelopmentAdjustments,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeteroOutcome {
    pub iterations: usize,
    pub converged: bool,
    pub cancelled: bool,
    pub last_rmse: Option<f64>,
    pub adjustments: DevelopmentAdjustments,
    /// Final weights, one per training row.
    pub weights: WeightVector,
}

/// Runs the fixed-point iteration.
///
/// `train` pairs every training id with its development period, in ascending
/// id order. `fit_residuals` fits with the given weights and returns the
/// log-scale training residuals in the same order. It is called once per
/// iteration and once more with the final weights.
pub fn run_hetero_loop<E, F, O>(
    train: &[(CellId, i64)],
    all_devs: &[i64],
    settings: &HeteroSettings,
    mut fit_residuals: F,
    mut observer: O,
) -> Result<HeteroOutcome, E>
where
    F: FnMut(&WeightVector) -> Result<Array1<f64>, E>,
    O: FnMut(&HeteroIteration<'_>) -> ControlFlow<()>,
{
    let train_devs: Vec<i64> = train.iter().map(|&(_, dev)| dev).collect();
    let mut weights: WeightVector = train.iter().map(|&(id, _)| (id, 1.0)).collect();
    let mut adjustments = DevelopmentAdjustments::uniform(all_devs);
    let mut previous: Option<WeightVector> = None;
    let mut iterations = 0;
    let mut last_rmse = None;
    let mut converged = false;
    let mut cancelled = false;

    log::info!(
        "Fitting heteroskedasticity adjustment over {} training rows (threshold {}, cap {})",
        train.len(),
        settings.stop_threshold,
        settings.max_iterations
    );

    for iteration in 1..=settings.max_iterations {
        iterations = iteration;
        let residuals = fit_residuals(&weights)?;
        adjustments = compute_adjustments(&train_devs, residuals.view(), all_devs);
        weights = train
            .iter()
            .map(|&(id, dev)| (id, adjustments.factor(dev)))
            .collect();

        let step_rmse = previous
            .as_ref()
            .map(|prev| rmse(prev.values(), weights.values()));
        last_rmse = step_rmse;
        if let Some(value) = step_rmse {
            log::debug!("Hetero step {iteration}: RMSE {value:.4}");
        }

        let flow = observer(&HeteroIteration {
            iteration,
            rmse: step_rmse,
            adjustments: &adjustments,
        });
        if step_rmse.is_some_and(|value| value < settings.stop_threshold) {
            converged = true;
            break;
        }
        if flow.is_break() {
            cancelled = true;
            log::info!("Heteroskedasticity loop cancelled after {iteration} iterations");
            break;
        }
        previous = Some(weights.clone());
    }

    if !converged && !cancelled && settings.max_iterations > 0 {
        log::warn!(
            "Heteroskedasticity loop truncated at {} iterations (last RMSE {:?})",
            iterations,
            last_rmse
        );
    }

    fit_residuals(&weights)?;
    log::info!(
        "Heteroskedasticity loop finished: {} iterations, converged = {}",
        iterations,
        converged
    );

    Ok(HeteroOutcome {
        iterations,
        converged,
        cancelled,
        last_rmse,
        adjustments,
        weights,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::convert::Infallible;

    #[test]
    fn factor_is_global_over_period_variance() {
        let devs = [0, 0, 0, 1, 1, 1];
        let residuals = array![1.0, -1.0, 0.0, 2.0, -2.0, 0.0];
        let adjustments = compute_adjustments(&devs, residuals.view(), &[0, 1]);
        let global = 10.0 / 5.0;
        assert_abs_diff_eq!(adjustments.factor(0), global / 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(adjustments.factor(1), global / 4.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_variance_and_forecast_only_periods_get_one() {
        let devs = [0, 0, 1, 1];
        let residuals = array![1.0, -1.0, 0.5, 0.5];
        let adjustments = compute_adjustments(&devs, residuals.view(), &[0, 1, 2, 3]);
        assert_eq!(adjustments.factor(1), 1.0);
        assert_eq!(adjustments.factor(2), 1.0);
        assert_eq!(adjustments.factor(3), 1.0);
    }

    #[test]
    fn single_observation_periods_take_neighbour_mean() {
        let devs = [0, 0, 0, 1, 2, 2, 2];
        let residuals = array![1.0, -1.0, 0.0, 0.3, 2.0, -2.0, 0.0];
        let adjustments = compute_adjustments(&devs, residuals.view(), &[0, 1, 2]);
        assert_abs_diff_eq!(
            adjustments.factor(1),
            (adjustments.factor(0) + adjustments.factor(2)) / 2.0,
            epsilon = 1e-12
        );
        assert!(adjustments.factor(0) != adjustments.factor(2));
    }

    #[test]
    fn stable_residuals_converge_on_the_second_iteration() {
        let train: Vec<(CellId, i64)> = (0..8).map(|id| (id, (id % 2) as i64)).collect();
        let residuals = array![1.0, 2.0, -1.0, -2.0, 1.0, 2.0, -1.0, -2.0];
        let mut calls = 0;
        let outcome = run_hetero_loop::<Infallible, _, _>(
            &train,
            &[0, 1, 2],
            &HeteroSettings::default(),
            |_| {
                calls += 1;
                Ok(residuals.clone())
            },
            |_| ControlFlow::Continue(()),
        )
        .unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(calls, 3);
        assert_eq!(outcome.last_rmse, Some(0.0));
        assert_eq!(outcome.weights.ids(), &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(outcome.adjustments.factor(2), 1.0);
    }

    #[test]
    fn observer_can_cancel_and_cap_truncates() {
        let train: Vec<(CellId, i64)> = (0..6).map(|id| (id, (id % 3) as i64)).collect();
        let mut flip = 1.0;
        let outcome = run_hetero_loop::<Infallible, _, _>(
            &train,
            &[0, 1, 2],
            &HeteroSettings {
                stop_threshold: 1e-12,
                max_iterations: 50,
            },
            |weights| {
                flip = -flip;
                let scale = if flip > 0.0 { 1.0 } else { 3.0 };
                Ok(weights
                    .ids()
                    .iter()
                    .map(|&id| match id % 3 {
                        0 => scale * if id < 3 { 1.0 } else { -1.0 },
                        _ => if id < 3 { 1.0 } else { -1.0 },
                    })
                    .collect())
            },
            |step| {
                if step.iteration == 4 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )
        .unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 4);

        let capped = run_hetero_loop::<Infallible, _, _>(
            &train,
            &[0, 1, 2],
            &HeteroSettings {
                stop_threshold: 0.0,
                max_iterations: 3,
            },
            |weights| Ok(Array1::from_elem(weights.len(), 0.0) + &array![1.0, 2.0, 3.0, -1.0, -2.0, -3.0]),
            |_| ControlFlow::Continue(()),
        )
        .unwrap();
        assert!(!capped.converged);
        assert!(!capped.cancelled);
        assert_eq!(capped.iterations, 3);
    }

    #[test]
    fn fit_errors_propagate() {
        let train = [(0, 0), (1, 0)];
        let result = run_hetero_loop(
            &train,
            &[0],
            &HeteroSettings::default(),
            |_| Err("solver failed"),
            |_| ControlFlow::Continue(()),
        );
        assert_eq!(result.unwrap_err(), "solver failed");
    }
}
