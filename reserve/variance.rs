use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Relative eigenvalue floor below which `X'WX` is treated as singular.
const SINGULARITY_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum VarianceError {
    #[error("process variance estimator must be 'ube' or 'mle', got '{0}'")]
    UnknownEstimator(String),

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Training weight {value} at row {row} must be positive to invert the weight matrix.")]
    NonPositiveWeight { row: usize, value: f64 },

    #[error(
        "X'WX is singular (smallest eigenvalue {min_eigenvalue:.3e}, largest {max_abs_eigenvalue:.3e}); standard errors are undefined."
    )]
    SingularGram {
        min_eigenvalue: f64,
        max_abs_eigenvalue: f64,
    },

    #[error("Eigendecomposition failed: {0}")]
    EigendecompositionFailed(ndarray_linalg::error::LinalgError),
}

/// Denominator used for the process variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessVarianceEstimator {
    /// Divide the weighted residual sum of squares by the degrees of freedom.
    #[default]
    #[serde(rename = "ube")]
    Unbiased,
    /// The unbiased estimate further divided by the observation count.
    #[serde(rename = "mle")]
    MaximumLikelihood,
}

impl FromStr for ProcessVarianceEstimator {
    type Err = VarianceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ube" => Ok(Self::Unbiased),
            "mle" => Ok(Self::MaximumLikelihood),
            _ => Err(VarianceError::UnknownEstimator(s.to_string())),
        }
    }
}

impl fmt::Display for ProcessVarianceEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unbiased => "ube",
            Self::MaximumLikelihood => "mle",
        })
    }
}

/// Variance estimates for a fitted weighted regression.
///
/// `x` holds the training design restricted to the columns with support,
/// `residuals` the log-scale training residuals. Variance estimates with no
/// degrees of freedom left are `NaN`; matrix inversion failures are errors.
#[derive(Debug, Clone, Copy)]
pub struct VarianceEngine<'a> {
    x: ArrayView2<'a, f64>,
    weights: ArrayView1<'a, f64>,
    residuals: ArrayView1<'a, f64>,
    degrees_of_freedom: i64,
}

impl<'a> VarianceEngine<'a> {
    pub fn new(
        x: ArrayView2<'a, f64>,
        weights: ArrayView1<'a, f64>,
        residuals: ArrayView1<'a, f64>,
        degrees_of_freedom: i64,
    ) -> Result<Self, VarianceError> {
        let n = x.nrows();
        for (context, found) in [("weights", weights.len()), ("residuals", residuals.len())] {
            if found != n {
                return Err(VarianceError::DimensionMismatch {
                    context,
                    expected: n,
                    found,
                });
            }
        }
        Ok(Self {
            x,
            weights,
            residuals,
            degrees_of_freedom,
        })
    }

    pub fn n_observations(&self) -> usize {
        self.x.nrows()
    }

    pub fn process_variance_unbiased(&self) -> f64 {
        if self.degrees_of_freedom <= 0 {
            return f64::NAN;
        }
        let weighted_rss: f64 = self
            .residuals
            .iter()
            .zip(self.weights.iter())
            .map(|(r, w)| w * r * r)
            .sum();
        weighted_rss / self.degrees_of_freedom as f64
    }

    pub fn process_variance_mle(&self) -> f64 {
        self.process_variance_unbiased() / self.n_observations() as f64
    }

    pub fn process_variance(&self, estimator: ProcessVarianceEstimator) -> f64 {
        match estimator {
            ProcessVarianceEstimator::Unbiased => self.process_variance_unbiased(),
            ProcessVarianceEstimator::MaximumLikelihood => self.process_variance_mle(),
        }
    }

    /// `(X'WX)^-1` through its eigendecomposition. Fails instead of returning a
    /// pseudo-inverse when the matrix is singular.
    pub fn weighted_gram_inverse(&self) -> Result<Array2<f64>, VarianceError> {
        let weighted_x = &self.x * &self.weights.insert_axis(Axis(1));
        let gram = self.x.t().dot(&weighted_x);
        let (eigenvalues, eigenvectors) = gram
            .eigh(UPLO::Lower)
            .map_err(VarianceError::EigendecompositionFailed)?;

        let max_abs_eigenvalue = eigenvalues.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let min_eigenvalue = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
        if eigenvalues.is_empty()
            || !min_eigenvalue.is_finite()
            || min_eigenvalue <= max_abs_eigenvalue * SINGULARITY_TOLERANCE
        {
            return Err(VarianceError::SingularGram {
                min_eigenvalue,
                max_abs_eigenvalue,
            });
        }

        let scaled = &eigenvectors / &eigenvalues.view().insert_axis(Axis(0));
        Ok(scaled.dot(&eigenvectors.t()))
    }

    /// Covariance of the fitted log-values: `X (X'WX)^-1 X' * sigma^2`.
    pub fn fitted_covariance(
        &self,
        estimator: ProcessVarianceEstimator,
    ) -> Result<Array2<f64>, VarianceError> {
        let inverse = self.weighted_gram_inverse()?;
        let hat = self.x.dot(&inverse).dot(&self.x.t());
        Ok(hat * self.process_variance(estimator))
    }

    /// `(W^-1 - X (X'WX)^-1 X') * sigma^2`.
    pub fn residual_covariance(
        &self,
        estimator: ProcessVarianceEstimator,
    ) -> Result<Array2<f64>, VarianceError> {
        if let Some((row, &value)) = self
            .weights
            .iter()
            .enumerate()
            .find(|(_, w)| !(**w > 0.0))
        {
            return Err(VarianceError::NonPositiveWeight { row, value });
        }
        let sigma2 = self.process_variance(estimator);
        let inverse = self.weighted_gram_inverse()?;
        let mut covariance = -self.x.dot(&inverse).dot(&self.x.t());
        for (k, w) in self.weights.iter().enumerate() {
            covariance[[k, k]] += 1.0 / w;
        }
        Ok(covariance * sigma2)
    }

    /// Per training row: square root of the absolute diagonal of the residual
    /// covariance.
    pub fn standard_errors(
        &self,
        estimator: ProcessVarianceEstimator,
    ) -> Result<Array1<f64>, VarianceError> {
        Ok(self
            .residual_covariance(estimator)?
            .diag()
            .mapv(|v| v.abs().sqrt()))
    }

    /// Per column of `x`: `sqrt(diag((X'WX)^-1) * sigma^2)`.
    pub fn coefficient_standard_errors(
        &self,
        estimator: ProcessVarianceEstimator,
    ) -> Result<Array1<f64>, VarianceError> {
        let sigma2 = self.process_variance(estimator);
        Ok(self
            .weighted_gram_inverse()?
            .diag()
            .mapv(|v| (v.abs() * sigma2).sqrt()))
    }

    /// `residuals / standard_errors`, in the row order of `x`.
    pub fn standardized_residuals(
        &self,
        estimator: ProcessVarianceEstimator,
    ) -> Result<Array1<f64>, VarianceError> {
        let standard_errors = self.standard_errors(estimator)?;
        Ok(&self.residuals / &standard_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_linalg::Inverse;

    fn design() -> (Array2<f64>, Array1<f64>, Array1<f64>) {
        let x = array![
            [1.0, 0.0],
            [1.0, 1.0],
            [1.0, 2.0],
            [1.0, 3.0],
            [1.0, 4.0],
            [1.0, 5.0]
        ];
        let w = array![1.0, 2.0, 1.0, 0.5, 1.0, 2.0];
        let r = array![0.1, -0.2, 0.05, 0.3, -0.1, 0.02];
        (x, w, r)
    }

    #[test]
    fn estimator_labels_parse() {
        assert_eq!(
            "UBE".parse::<ProcessVarianceEstimator>().unwrap(),
            ProcessVarianceEstimator::Unbiased
        );
        assert_eq!(
            "mle".parse::<ProcessVarianceEstimator>().unwrap(),
            ProcessVarianceEstimator::MaximumLikelihood
        );
        assert!(matches!(
            "ols".parse::<ProcessVarianceEstimator>(),
            Err(VarianceError::UnknownEstimator(_))
        ));
    }

    #[test]
    fn process_variance_uses_weighted_rss() {
        let (x, w, r) = design();
        let engine = VarianceEngine::new(x.view(), w.view(), r.view(), 4).unwrap();
        let rss: f64 = (&r * &r * &w).sum();
        assert_abs_diff_eq!(engine.process_variance_unbiased(), rss / 4.0, epsilon = 1e-14);
        assert_abs_diff_eq!(engine.process_variance_mle(), rss / 4.0 / 6.0, epsilon = 1e-14);
    }

    #[test]
    fn no_degrees_of_freedom_gives_nan() {
        let (x, w, r) = design();
        let engine = VarianceEngine::new(x.view(), w.view(), r.view(), 0).unwrap();
        assert!(engine.process_variance_unbiased().is_nan());
        assert!(engine.process_variance_mle().is_nan());
    }

    #[test]
    fn gram_inverse_matches_direct_inverse() {
        let (x, w, r) = design();
        let engine = VarianceEngine::new(x.view(), w.view(), r.view(), 4).unwrap();
        let wx = &x * &w.view().insert_axis(Axis(1));
        let direct = x.t().dot(&wx).inv().unwrap();
        assert_abs_diff_eq!(engine.weighted_gram_inverse().unwrap(), direct, epsilon = 1e-10);
    }

    #[test]
    fn standard_errors_follow_residual_covariance_diagonal() {
        let (x, w, r) = design();
        let engine = VarianceEngine::new(x.view(), w.view(), r.view(), 4).unwrap();
        let sigma2 = engine.process_variance_unbiased();
        let inverse = engine.weighted_gram_inverse().unwrap();
        let se = engine
            .standard_errors(ProcessVarianceEstimator::Unbiased)
            .unwrap();
        for k in 0..6 {
            let leverage = x.row(k).dot(&inverse.dot(&x.row(k)));
            let expected = ((1.0 / w[k] - leverage) * sigma2).abs().sqrt();
            assert_abs_diff_eq!(se[k], expected, epsilon = 1e-12);
        }
        let standardized = engine
            .standardized_residuals(ProcessVarianceEstimator::Unbiased)
            .unwrap();
        assert_abs_diff_eq!(standardized, &r / &se, epsilon = 1e-12);
    }

    #[test]
    fn duplicated_columns_are_singular() {
        let x = array![[1.0, 2.0, 2.0], [1.0, 3.0, 3.0], [1.0, 5.0, 5.0], [1.0, 7.0, 7.0]];
        let w: Array1<f64> = Array1::ones(4);
        let r = array![0.1, -0.1, 0.2, -0.2];
        let engine = VarianceEngine::new(x.view(), w.view(), r.view(), 1).unwrap();
        assert!(matches!(
            engine.standard_errors(ProcessVarianceEstimator::Unbiased),
            Err(VarianceError::SingularGram { .. })
        ));
    }

    #[test]
    fn zero_weight_cannot_be_inverted() {
        let (x, mut w, r) = design();
        w[2] = 0.0;
        let engine = VarianceEngine::new(x.view(), w.view(), r.view(), 4).unwrap();
        assert!(matches!(
            engine.residual_covariance(ProcessVarianceEstimator::Unbiased),
            Err(VarianceError::NonPositiveWeight { row: 2, .. })
        ));
    }
}
