use crate::design::{DesignSlice, column_support};
use crate::triangle::Column;
use crate::types::{Coefficients, LinearPredictor};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{SVD, Solve};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegressionError {
    #[error("The regression has not been fitted yet; call fit before predicting.")]
    NotFitted,

    #[error(
        "Regularization strength and mixing ratio are unset; a hyperparameter search must supply them before fitting."
    )]
    NeedsTuning,

    #[error("Invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("The {0} contains non-finite values.")]
    NonFiniteInput(&'static str),

    #[error("Linear system solve failed: {0:?}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("The singular value decomposition of the weighted design did not return its factors.")]
    MissingSvdFactors,
}

/// Singular values below this fraction of the largest are treated as zero.
const RANK_TOLERANCE: f64 = 1e-10;

fn default_max_iter() -> usize {
    100_000
}

fn default_tolerance() -> f64 {
    1e-4
}

/// Regularization settings. `alpha` and `l1_ratio` may be left unset, in which
/// case a hyperparameter search has to fill them in before fitting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub l1_ratio: Option<f64>,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            alpha: None,
            l1_ratio: None,
            max_iter: default_max_iter(),
            tolerance: default_tolerance(),
        }
    }
}

impl Hyperparameters {
    pub fn fixed(alpha: f64, l1_ratio: f64) -> Self {
        Self {
            alpha: Some(alpha),
            l1_ratio: Some(l1_ratio),
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.alpha.is_some() && self.l1_ratio.is_some()
    }

    /// Validates the settings and fixes the unset ones, or reports that a
    /// search is needed.
    pub fn resolve(&self) -> Result<ResolvedPenalty, RegressionError> {
        let (Some(alpha), Some(l1_ratio)) = (self.alpha, self.l1_ratio) else {
            return Err(RegressionError::NeedsTuning);
        };
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(RegressionError::InvalidHyperparameter(format!(
                "alpha must be finite and non-negative, got {alpha}"
            )));
        }
        if !(0.0..=1.0).contains(&l1_ratio) {
            return Err(RegressionError::InvalidHyperparameter(format!(
                "l1_ratio must lie in [0, 1], got {l1_ratio}"
            )));
        }
        if self.max_iter == 0 {
            return Err(RegressionError::InvalidHyperparameter(
                "max_iter must be at least 1".to_string(),
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(RegressionError::InvalidHyperparameter(format!(
                "tolerance must be finite and positive, got {}",
                self.tolerance
            )));
        }
        Ok(ResolvedPenalty {
            alpha,
            l1_ratio,
            max_iter: self.max_iter,
            tolerance: self.tolerance,
        })
    }
}

/// Fully specified regularization settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPenalty {
    pub alpha: f64,
    pub l1_ratio: f64,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl ResolvedPenalty {
    pub fn penalty(&self) -> Penalty {
        Penalty::select(self.alpha, self.l1_ratio)
    }
}

/// Which regression a pair of hyperparameters selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Penalty {
    /// Unregularized weighted least squares.
    None,
    Ridge,
    Lasso,
    ElasticNet,
}

impl Penalty {
    pub fn select(alpha: f64, l1_ratio: f64) -> Self {
        if alpha == 0.0 {
            Penalty::None
        } else if l1_ratio == 1.0 {
            Penalty::Lasso
        } else if l1_ratio == 0.0 {
            Penalty::Ridge
        } else {
            Penalty::ElasticNet
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutput {
    pub coefficients: Array1<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// A weighted, penalized least-squares backend. Inputs are already validated:
/// dimensions agree, values are finite and every column has support.
pub trait RegressionSolver {
    fn solve(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: ArrayView1<f64>,
        penalty: &ResolvedPenalty,
    ) -> Result<SolverOutput, RegressionError>;
}

/// Minimum-norm least squares for the unregularized case, normal equations for
/// ridge, cyclic coordinate descent whenever an L1 term is present.
///
/// Objectives, with `w` the sample weights and `a = alpha`, `r = l1_ratio`:
/// - none:  `sum w (y - Xb)^2`, taking the smallest `|b|` when `X` is rank
///   deficient (calendar trends are collinear with accident and development)
/// - ridge: `sum w (y - Xb)^2 + a |b|^2`
/// - lasso / elastic net: `1/(2 sum w) sum w (y - Xb)^2 + a r |b|_1 + a (1 - r)/2 |b|^2`
#[derive(Debug, Clone, Copy, Default)]
pub struct PenalizedLeastSquares;

impl RegressionSolver for PenalizedLeastSquares {
    fn solve(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: ArrayView1<f64>,
        penalty: &ResolvedPenalty,
    ) -> Result<SolverOutput, RegressionError> {
        match penalty.penalty() {
            Penalty::None => weighted_min_norm_least_squares(x, y, weights),
            Penalty::Ridge => weighted_normal_equations(x, y, weights, penalty.alpha),
            Penalty::Lasso | Penalty::ElasticNet => {
                let total: f64 = weights.sum();
                if total <= 0.0 {
                    return Err(RegressionError::InvalidHyperparameter(
                        "the training weights sum to zero".to_string(),
                    ));
                }
                let normalized = weights.mapv(|w| w / total);
                Ok(coordinate_descent(
                    x,
                    y,
                    normalized.view(),
                    penalty.alpha * penalty.l1_ratio,
                    penalty.alpha * (1.0 - penalty.l1_ratio),
                    penalty.max_iter,
                    penalty.tolerance,
                ))
            }
        }
    }
}

/// Minimum-norm solution of `min sum w (y - Xb)^2` through the SVD of
/// `sqrt(W) X`.
fn weighted_min_norm_least_squares(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    weights: ArrayView1<f64>,
) -> Result<SolverOutput, RegressionError> {
    let root_w = weights.mapv(f64::sqrt);
    let a = &x * &root_w.view().insert_axis(Axis(1));
    let b = &y * &root_w;
    let (u, singular_values, vt) = a
        .svd(true, true)
        .map_err(RegressionError::LinearSystemSolveFailed)?;
    let (Some(u), Some(vt)) = (u, vt) else {
        return Err(RegressionError::MissingSvdFactors);
    };

    let largest = singular_values.iter().fold(0.0_f64, |m, &s| m.max(s));
    let cutoff = largest * RANK_TOLERANCE;
    let mut coefficients = Array1::<f64>::zeros(x.ncols());
    let mut rank = 0;
    for (i, &s) in singular_values.iter().enumerate() {
        if s <= cutoff {
            continue;
        }
        rank += 1;
        let projection = u.column(i).dot(&b) / s;
        coefficients.scaled_add(projection, &vt.row(i));
    }
    if rank < x.ncols() {
        log::debug!(
            "Weighted design has rank {rank} of {} columns; using the minimum-norm solution",
            x.ncols()
        );
    }
    if coefficients.iter().any(|v| !v.is_finite()) {
        return Err(RegressionError::NonFiniteInput("least-squares solution"));
    }
    Ok(SolverOutput {
        coefficients,
        iterations: 1,
        converged: true,
    })
}

/// Solves `(X'WX + ridge I) b = X'Wy`.
fn weighted_normal_equations(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    ridge: f64,
) -> Result<SolverOutput, RegressionError> {
    let weighted_x = &x * &weights.insert_axis(Axis(1));
    let mut gram: Array2<f64> = x.t().dot(&weighted_x);
    if ridge > 0.0 {
        gram.diag_mut().mapv_inplace(|v| v + ridge);
    }
    let rhs = weighted_x.t().dot(&y);
    let coefficients = gram
        .solve(&rhs)
        .map_err(RegressionError::LinearSystemSolveFailed)?;
    if coefficients.iter().any(|b| !b.is_finite()) {
        return Err(RegressionError::NonFiniteInput("solution of the normal equations"));
    }
    Ok(SolverOutput {
        coefficients,
        iterations: 1,
        converged: true,
    })
}

pub fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

/// Cyclic coordinate descent on the elastic-net objective with weights that
/// sum to one. Stops when the largest coefficient update is below
/// `tolerance` times the largest coefficient.
fn coordinate_descent(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    l1: f64,
    l2: f64,
    max_iter: usize,
    tolerance: f64,
) -> SolverOutput {
    let p = x.ncols();
    let mut beta = Array1::<f64>::zeros(p);
    let mut residual = y.to_owned();
    let curvature: Vec<f64> = x
        .axis_iter(Axis(1))
        .map(|column| {
            column
                .iter()
                .zip(weights.iter())
                .map(|(xv, wv)| wv * xv * xv)
                .sum()
        })
        .collect();

    for iteration in 1..=max_iter {
        let mut max_delta = 0.0_f64;
        let mut max_beta = 0.0_f64;
        for j in 0..p {
            let column = x.column(j);
            let old = beta[j];
            let correlation: f64 = column
                .iter()
                .zip(weights.iter())
                .zip(residual.iter())
                .map(|((xv, wv), r)| wv * xv * (r + xv * old))
                .sum();
            let updated = soft_threshold(correlation, l1) / (curvature[j] + l2);
            let delta = updated - old;
            if delta != 0.0 {
                residual.scaled_add(-delta, &column);
                beta[j] = updated;
            }
            max_delta = max_delta.max(delta.abs());
            max_beta = max_beta.max(updated.abs());
        }
        if max_delta == 0.0 || max_delta < tolerance * max_beta {
            log::debug!("Coordinate descent converged after {iteration} sweeps");
            return SolverOutput {
                coefficients: beta,
                iterations: iteration,
                converged: true,
            };
        }
    }

    log::warn!(
        "Coordinate descent stopped at the iteration cap ({max_iter}) before reaching tolerance {tolerance:e}"
    );
    SolverOutput {
        coefficients: beta,
        iterations: max_iter,
        converged: false,
    }
}

/// Output of one regression fit. Coefficients are aligned to `columns`;
/// columns without training support carry a coefficient of exactly zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub columns: Vec<Column>,
    pub coefficients: Coefficients,
    pub settings: ResolvedPenalty,
    pub penalty: Penalty,
    pub iterations: usize,
    pub converged: bool,
}

impl FittedModel {
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<LinearPredictor, RegressionError> {
        if x.ncols() != self.coefficients.len() {
            return Err(RegressionError::DimensionMismatch {
                context: "prediction design columns",
                expected: self.coefficients.len(),
                found: x.ncols(),
            });
        }
        Ok(LinearPredictor::new(x.dot(&self.coefficients.as_view())))
    }

    pub fn coefficient(&self, column: &Column) -> Option<f64> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|j| self.coefficients[j])
    }
}

fn check_finite(values: impl IntoIterator<Item = f64>, what: &'static str) -> Result<(), RegressionError> {
    if values.into_iter().all(f64::is_finite) {
        Ok(())
    } else {
        Err(RegressionError::NonFiniteInput(what))
    }
}

/// Fits one design slice.
pub fn fit_regression<S: RegressionSolver + ?Sized>(
    solver: &S,
    design: &DesignSlice,
    y: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    hyperparameters: &Hyperparameters,
) -> Result<FittedModel, RegressionError> {
    let settings = hyperparameters.resolve()?;
    let n = design.nrows();
    if y.len() != n {
        return Err(RegressionError::DimensionMismatch {
            context: "response length",
            expected: n,
            found: y.len(),
        });
    }
    if weights.len() != n {
        return Err(RegressionError::DimensionMismatch {
            context: "weight length",
            expected: n,
            found: weights.len(),
        });
    }
    check_finite(design.values.iter().copied(), "design matrix")?;
    check_finite(y.iter().copied(), "response")?;
    check_finite(weights.iter().copied(), "weight vector")?;
    if weights.iter().any(|&w| w < 0.0) {
        return Err(RegressionError::InvalidHyperparameter(
            "weights must be non-negative".to_string(),
        ));
    }

    let support = column_support(design.values.view());
    let kept: Vec<usize> = (0..design.ncols()).filter(|&j| support[j]).collect();
    let mut coefficients = Array1::zeros(design.ncols());
    let (iterations, converged) = if kept.is_empty() {
        (0, true)
    } else {
        let x = design.values.select(Axis(1), &kept);
        let output = solver.solve(x.view(), y, weights, &settings)?;
        if output.coefficients.len() != kept.len() {
            return Err(RegressionError::DimensionMismatch {
                context: "solver coefficients",
                expected: kept.len(),
                found: output.coefficients.len(),
            });
        }
        for (&j, &b) in kept.iter().zip(output.coefficients.iter()) {
            coefficients[j] = b;
        }
        (output.iterations, output.converged)
    };

    log::info!(
        "Fitted {:?} regression: {} rows, {} of {} columns supported, alpha={}, l1_ratio={}",
        settings.penalty(),
        n,
        kept.len(),
        design.ncols(),
        settings.alpha,
        settings.l1_ratio
    );

    Ok(FittedModel {
        columns: design.columns.clone(),
        coefficients: Coefficients::new(coefficients),
        penalty: settings.penalty(),
        settings,
        iterations,
        converged,
    })
}

/// Holds the hyperparameters, the solver and the latest fit.
#[derive(Debug, Clone)]
pub struct RegressionFitter<S = PenalizedLeastSquares> {
    solver: S,
    hyperparameters: Hyperparameters,
    fitted: Option<FittedModel>,
}

impl RegressionFitter<PenalizedLeastSquares> {
    pub fn new(hyperparameters: Hyperparameters) -> Self {
        Self::with_solver(PenalizedLeastSquares, hyperparameters)
    }
}

impl<S: RegressionSolver> RegressionFitter<S> {
    pub fn with_solver(solver: S, hyperparameters: Hyperparameters) -> Self {
        Self {
            solver,
            hyperparameters,
            fitted: None,
        }
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    /// Changing the hyperparameters discards the current fit.
    pub fn set_hyperparameters(&mut self, hyperparameters: Hyperparameters) {
        self.hyperparameters = hyperparameters;
        self.fitted = None;
    }

    pub fn needs_tuning(&self) -> bool {
        !self.hyperparameters.is_complete()
    }

    pub fn fit(
        &mut self,
        design: &DesignSlice,
        y: ArrayView1<f64>,
        weights: ArrayView1<f64>,
    ) -> Result<&FittedModel, RegressionError> {
        let fitted = fit_regression(&self.solver, design, y, weights, &self.hyperparameters)?;
        Ok(self.fitted.insert(fitted))
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn fitted(&self) -> Result<&FittedModel, RegressionError> {
        self.fitted.as_ref().ok_or(RegressionError::NotFitted)
    }

    pub fn fitted_mut(&mut self) -> Result<&mut FittedModel, RegressionError> {
        self.fitted.as_mut().ok_or(RegressionError::NotFitted)
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<LinearPredictor, RegressionError> {
        self.fitted()?.predict(x)
    }
}
