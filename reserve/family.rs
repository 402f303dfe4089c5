use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Likelihood capability of a model variant.
///
/// `y` is on the original scale, `mu` is the fitted mean on the model's
/// linear-predictor scale and `dispersion` the process variance.
pub trait ResponseFamily {
    fn name(&self) -> &'static str;

    /// Per-observation log density.
    fn log_likelihood_density(
        &self,
        y: ArrayView1<f64>,
        mu: ArrayView1<f64>,
        weights: ArrayView1<f64>,
        dispersion: f64,
    ) -> Array1<f64>;

    fn deviance(&self, y: ArrayView1<f64>, mu: ArrayView1<f64>, weights: ArrayView1<f64>) -> f64;

    /// Variance of the response as a function of its original-scale mean, up
    /// to the dispersion.
    fn variance_function(&self, mean: ArrayView1<f64>) -> Array1<f64>;
}

/// `log(y) ~ N(mu, dispersion / w)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNormal;

impl ResponseFamily for LogNormal {
    fn name(&self) -> &'static str {
        "log-normal"
    }

    fn log_likelihood_density(
        &self,
        y: ArrayView1<f64>,
        mu: ArrayView1<f64>,
        weights: ArrayView1<f64>,
        dispersion: f64,
    ) -> Array1<f64> {
        Zip::from(&y).and(&mu).and(&weights).map_collect(|&y, &mu, &w| {
            let log_y = y.ln();
            let variance = dispersion / w;
            -log_y - 0.5 * (2.0 * PI * variance).ln() - (log_y - mu).powi(2) / (2.0 * variance)
        })
    }

    fn deviance(&self, y: ArrayView1<f64>, mu: ArrayView1<f64>, weights: ArrayView1<f64>) -> f64 {
        Zip::from(&y)
            .and(&mu)
            .and(&weights)
            .fold(0.0, |acc, &y, &mu, &w| acc + w * (y.ln() - mu).powi(2))
    }

    fn variance_function(&self, mean: ArrayView1<f64>) -> Array1<f64> {
        mean.mapv(|m| m * m)
    }
}

/// Model variants the estimator can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    LogLinear,
}

impl ModelKind {
    pub fn family(self) -> &'static dyn ResponseFamily {
        match self {
            ModelKind::LogLinear => &LogNormal,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::LogLinear => write!(f, "log-linear ({})", self.family().name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn density_matches_normal_on_log_scale() {
        let y = array![2.0, 5.0];
        let mu = array![0.5, 1.7];
        let w = array![1.0, 4.0];
        let density = LogNormal.log_likelihood_density(y.view(), mu.view(), w.view(), 0.3);
        for k in 0..2 {
            let variance = 0.3 / w[k];
            let z = y[k].ln() - mu[k];
            let expected = -y[k].ln() - 0.5 * (2.0 * PI * variance).ln() - z * z / (2.0 * variance);
            assert_abs_diff_eq!(density[k], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn deviance_vanishes_on_exact_fit() {
        let y = array![1.0, 10.0, 100.0];
        let mu = y.mapv(f64::ln);
        let w: Array1<f64> = Array1::ones(3);
        assert_abs_diff_eq!(LogNormal.deviance(y.view(), mu.view(), w.view()), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn log_linear_uses_log_normal_family() {
        assert_eq!(ModelKind::LogLinear.family().name(), "log-normal");
        assert_eq!(
            LogNormal.variance_function(array![3.0].view()),
            array![9.0]
        );
    }
}
