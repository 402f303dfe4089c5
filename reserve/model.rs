use crate::combine::{CombineError, CombinedGroup, combine_parameters};
use crate::design::{DesignMatrixView, DesignSlice, ResponseOptions, ViewError, ZScore};
use crate::family::ModelKind;
use crate::hetero::{HeteroIteration, HeteroOutcome, HeteroSettings, run_hetero_loop};
use crate::index::{IndexError, Kind};
use crate::regression::{
    FittedModel, Hyperparameters, PenalizedLeastSquares, RegressionError, RegressionFitter,
    RegressionSolver, fit_regression,
};
use crate::triangle::{CellId, PeriodKind, TriangleData};
use crate::tuning::{HyperparameterSearch, ParameterGrid, TuningError};
use crate::types::{LinearPredictor, WeightVector};
use crate::variance::{ProcessVarianceEstimator, VarianceEngine, VarianceError};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::Path;
use thiserror::Error;

// --- Configuration ---

fn default_true() -> bool {
    true
}

fn default_cv_splits() -> usize {
    5
}

/// Everything needed to rebuild and refit an estimator on the same triangle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Train only on observed cells with a positive value.
    #[serde(default = "default_true")]
    pub must_be_positive: bool,
    /// Add calendar-trend columns to the design.
    #[serde(default)]
    pub use_calendar: bool,
    /// Fit on the z-scored log-response.
    #[serde(default = "default_true")]
    pub standardize: bool,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub hetero: HeteroSettings,
    #[serde(default)]
    pub process_variance: ProcessVarianceEstimator,
    /// Number of calendar diagonals held out, one at a time, when scoring
    /// hyperparameter candidates.
    #[serde(default = "default_cv_splits")]
    pub cv_splits: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            must_be_positive: true,
            use_calendar: false,
            standardize: true,
            hyperparameters: Hyperparameters::default(),
            hetero: HeteroSettings::default(),
            process_variance: ProcessVarianceEstimator::default(),
            cv_splits: default_cv_splits(),
        }
    }
}

impl ModelConfig {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error(transparent)]
    Combine(#[from] CombineError),
    #[error(transparent)]
    Regression(#[from] RegressionError),
    #[error(transparent)]
    Variance(#[from] VarianceError),
    #[error(transparent)]
    Tuning(#[from] TuningError),
    #[error("Model '{0}' has not been fitted yet.")]
    NotFitted(String),
    #[error("Parameter '{0}' is not part of the fitted model.")]
    UnknownParameter(String),
    #[error("The supplied design matrix has no column '{0}', which the fitted model needs.")]
    MissingDesignColumn(String),
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

// --- Estimator outputs ---

/// Where predictions come from.
#[derive(Debug, Clone, Copy)]
pub enum PredictTarget<'a> {
    Kind(Kind),
    /// An explicit design. Columns are matched by identity; extra columns,
    /// `is_observed` among them, are ignored.
    Design(&'a DesignSlice),
}

/// Scale of a prediction or residual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseScale {
    /// The scale the regression was fit on (standardized log when
    /// standardization is on).
    Model,
    Log,
    Original,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEstimate {
    pub name: String,
    #[serde(default)]
    pub period_kind: Option<PeriodKind>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UltimateLoss {
    pub accident_period: i64,
    /// Sum of observed values.
    pub actual: f64,
    /// Sum of original-scale forecasts for the unobserved cells.
    pub forecast: f64,
    /// `round(actual + forecast) * tail`.
    pub ultimate: f64,
    pub reserve: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevelopmentFactor {
    pub development_period: i64,
    pub factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeteroSummary {
    pub iterations: usize,
    pub converged: bool,
    pub cancelled: bool,
    pub adjustments: Vec<DevelopmentFactor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub cell: CellId,
    pub weight: f64,
}

/// Human-readable snapshot of a fitted estimator, saved as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: String,
    pub kind: ModelKind,
    pub config: ModelConfig,
    pub n_observations: usize,
    pub n_parameters: usize,
    pub degrees_of_freedom: i64,
    pub process_variance: f64,
    #[serde(default)]
    pub standardization: Option<ZScore>,
    pub parameters: Vec<ParameterEstimate>,
    #[serde(default)]
    pub combined: Vec<CombinedGroup>,
    #[serde(default)]
    pub hetero: Option<HeteroSummary>,
    #[serde(default)]
    pub weights: Vec<WeightEntry>,
}

impl ModelSummary {
    pub fn parameters_of(&self, kind: Option<PeriodKind>) -> Vec<&ParameterEstimate> {
        self.parameters
            .iter()
            .filter(|p| kind.is_none() || p.period_kind == kind)
            .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

// --- The estimator ---

/// Log-linear reserving model over one triangle.
///
/// Each instance owns its design view, weights and fit, so clones can be
/// driven independently.
#[derive(Debug, Clone)]
pub struct LogLinear<S = PenalizedLeastSquares> {
    id: String,
    config: ModelConfig,
    view: DesignMatrixView,
    fitter: RegressionFitter<S>,
    combined: Vec<CombinedGroup>,
    hetero: Option<HeteroOutcome>,
}

impl LogLinear {
    pub fn new<T: TriangleData + ?Sized>(
        id: impl Into<String>,
        triangle: &T,
        config: ModelConfig,
    ) -> Result<Self, ModelError> {
        Self::with_solver(id, triangle, config, PenalizedLeastSquares)
    }
}

impl<S: RegressionSolver> LogLinear<S> {
    /// Builds the estimator around a custom regression backend.
    pub fn with_solver<T: TriangleData + ?Sized>(
        id: impl Into<String>,
        triangle: &T,
        config: ModelConfig,
        solver: S,
    ) -> Result<Self, ModelError> {
        let view = DesignMatrixView::new(triangle, config.must_be_positive, config.use_calendar)?;
        Ok(Self {
            id: id.into(),
            fitter: RegressionFitter::with_solver(solver, config.hyperparameters),
            config,
            view,
            combined: Vec::new(),
            hetero: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ModelKind {
        ModelKind::LogLinear
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn view(&self) -> &DesignMatrixView {
        &self.view
    }

    pub fn combined_groups(&self) -> &[CombinedGroup] {
        &self.combined
    }

    pub fn hetero_outcome(&self) -> Option<&HeteroOutcome> {
        self.hetero.as_ref()
    }

    pub fn is_fitted(&self) -> bool {
        self.fitter.is_fitted()
    }

    pub fn fitted(&self) -> Result<&FittedModel, ModelError> {
        self.fitter
            .fitted()
            .map_err(|_| ModelError::NotFitted(self.id.clone()))
    }

    pub fn needs_tuning(&self) -> bool {
        self.fitter.needs_tuning()
    }

    /// Replaces the hyperparameters and discards the current fit.
    pub fn set_hyperparameters(&mut self, hyperparameters: Hyperparameters) {
        self.config.hyperparameters = hyperparameters;
        self.fitter.set_hyperparameters(hyperparameters);
    }

    /// Installs a weight snapshot and discards the current fit.
    pub fn set_weights(&mut self, weights: WeightVector) -> Result<(), ModelError> {
        self.view.set_weights(weights)?;
        self.fitter.set_hyperparameters(self.config.hyperparameters);
        Ok(())
    }

    /// Forgets the frozen standardization and the fit that depended on it.
    pub fn reset_standardization(&mut self) {
        self.view.reset_standardization();
        self.fitter.set_hyperparameters(self.config.hyperparameters);
    }

    fn response_options(&self) -> ResponseOptions {
        ResponseOptions::log_scale(self.config.standardize)
    }

    fn prepare_fit_data(&mut self) {
        let dropped = self.view.retain_defined_log_response();
        if !dropped.is_empty() {
            log::debug!("Model '{}' no longer trains on cells {:?}", self.id, dropped);
        }
    }

    fn fit_current(&mut self) -> Result<(), ModelError> {
        let design = self.view.fit_design(Kind::Train);
        let y = self.view.get_y(Kind::Train, self.response_options())?;
        let weights = self.view.get_weights(Kind::Train)?;
        self.fitter.fit(&design, y.view(), weights.values())?;
        Ok(())
    }

    /// Fits with the configured hyperparameters. Training rows with an
    /// undefined log-response are retired first.
    pub fn fit(&mut self) -> Result<&FittedModel, ModelError> {
        self.prepare_fit_data();
        self.fit_current()?;
        self.fitted()
    }

    /// Fits, first asking `search` for hyperparameters if they are unset.
    ///
    /// Candidates are scored by walk-forward validation over the latest
    /// calendar diagonals: for each of `cv_splits` cut-offs the model is fit on
    /// the earlier diagonals and scored by the mean squared error on the next.
    pub fn fit_with_search(
        &mut self,
        search: &mut dyn HyperparameterSearch,
        grid: &ParameterGrid,
    ) -> Result<&FittedModel, ModelError> {
        self.prepare_fit_data();
        if self.fitter.needs_tuning() {
            let tolerance = self.config.hyperparameters.tolerance;
            let chosen = {
                let this = &*self;
                let mut evaluate = |candidate: &Hyperparameters| {
                    this.holdout_score(&Hyperparameters {
                        tolerance,
                        ..*candidate
                    })
                };
                search.select(grid, &mut evaluate)?
            };
            self.set_hyperparameters(Hyperparameters {
                tolerance,
                ..chosen
            });
        }
        self.fit_current()?;
        self.fitted()
    }

    fn holdout_score(&self, hyperparameters: &Hyperparameters) -> f64 {
        let design = self.view.fit_design(Kind::Train);
        let (Ok(y), Ok(weights)) = (
            self.view.get_y(Kind::Train, self.response_options()),
            self.view.get_weights(Kind::Train),
        ) else {
            return f64::NAN;
        };
        let weights = weights.values();
        let calendar = self.view.get_calendar(Kind::Train);
        let Some(&latest) = calendar.iter().max() else {
            return f64::NAN;
        };

        let mut errors = Vec::with_capacity(self.config.cv_splits);
        for split in 1..=self.config.cv_splits {
            let cutoff = latest - split as i64;
            let fit_rows: Vec<usize> = (0..calendar.len())
                .filter(|&r| calendar[r] <= cutoff)
                .collect();
            let test_rows: Vec<usize> = (0..calendar.len())
                .filter(|&r| calendar[r] == cutoff + 1)
                .collect();
            if fit_rows.is_empty() || test_rows.is_empty() {
                continue;
            }
            let subset = DesignSlice {
                ids: fit_rows.iter().map(|&r| design.ids[r]).collect(),
                columns: design.columns.clone(),
                values: design.values.select(Axis(0), &fit_rows),
            };
            let Ok(fitted) = fit_regression(
                self.fitter.solver(),
                &subset,
                y.select(Axis(0), &fit_rows).view(),
                weights.select(Axis(0), &fit_rows).view(),
                hyperparameters,
            ) else {
                continue;
            };
            let Ok(predicted) = fitted.predict(design.values.select(Axis(0), &test_rows).view())
            else {
                continue;
            };
            let mse = test_rows
                .iter()
                .zip(predicted.iter())
                .map(|(&r, p)| (y[r] - p).powi(2))
                .sum::<f64>()
                / test_rows.len() as f64;
            errors.push(mse);
        }
        if errors.is_empty() {
            f64::NAN
        } else {
            errors.iter().sum::<f64>() / errors.len() as f64
        }
    }

    /// Runs the heteroskedasticity loop with the configured settings.
    pub fn fit_hetero(&mut self) -> Result<&HeteroOutcome, ModelError> {
        let settings = self.config.hetero;
        self.fit_hetero_with(settings, |_| ControlFlow::Continue(()))
    }

    /// Runs the heteroskedasticity loop. `observer` sees every iteration and
    /// may cancel; the final fit always happens. If any fit fails, the weights
    /// in place before the call are restored and the fit is discarded.
    pub fn fit_hetero_with<O>(
        &mut self,
        settings: HeteroSettings,
        observer: O,
    ) -> Result<&HeteroOutcome, ModelError>
    where
        O: FnMut(&HeteroIteration<'_>) -> ControlFlow<()>,
    {
        self.prepare_fit_data();
        let train: Vec<(CellId, i64)> = self
            .view
            .get_idx(Kind::Train)
            .into_iter()
            .zip(self.view.get_development(Kind::Train))
            .collect();
        let all_devs = self.view.get_development(Kind::All);
        let previous = self.view.get_weights(Kind::Train)?.clone();

        let result = run_hetero_loop(
            &train,
            &all_devs,
            &settings,
            |weights: &WeightVector| -> Result<Array1<f64>, ModelError> {
                self.view.set_weights(weights.clone())?;
                self.fit_current()?;
                self.log_residuals()
            },
            observer,
        );
        match result {
            Ok(outcome) => Ok(self.hetero.insert(outcome)),
            Err(err) => {
                log::warn!(
                    "Heteroskedasticity loop for model '{}' failed; restoring the previous weights",
                    self.id
                );
                self.view.set_weights(previous)?;
                self.fitter.set_hyperparameters(self.config.hyperparameters);
                Err(err)
            }
        }
    }

    /// Combines period parameters and refits. Without hyperparameters, or when
    /// the refit fails, the fit is discarded instead; the combination stays.
    pub fn combine(
        &mut self,
        period_type: PeriodKind,
        periods: &[i64],
        name: Option<&str>,
    ) -> Result<&CombinedGroup, ModelError> {
        let group = combine_parameters(&mut self.view, period_type, periods, name)?;
        self.combined.push(group);
        if self.fitter.needs_tuning() {
            self.fitter.set_hyperparameters(self.config.hyperparameters);
            log::info!(
                "Model '{}' needs hyperparameters before it can be refit after combining",
                self.id
            );
        } else if let Err(err) = self.fit().map(|_| ()) {
            self.fitter.set_hyperparameters(self.config.hyperparameters);
            return Err(err);
        }
        let last = self.combined.len() - 1;
        Ok(&self.combined[last])
    }

    fn model_scale(&self, target: PredictTarget<'_>) -> Result<LinearPredictor, ModelError> {
        let fitted = self.fitted()?;
        match target {
            PredictTarget::Kind(kind) => {
                let design = self.view.fit_design(kind);
                Ok(fitted.predict(aligned_values(fitted, &design)?.view())?)
            }
            PredictTarget::Design(design) => {
                Ok(fitted.predict(aligned_values(fitted, design)?.view())?)
            }
        }
    }

    pub fn predict(
        &self,
        target: PredictTarget<'_>,
        scale: ResponseScale,
    ) -> Result<Array1<f64>, ModelError> {
        let eta = self.model_scale(target)?.into_inner();
        if scale == ResponseScale::Model {
            return Ok(eta);
        }
        let log = if self.config.standardize {
            self.view.zscore().invert(&eta)
        } else {
            eta
        };
        Ok(match scale {
            ResponseScale::Original => log.mapv(f64::exp),
            _ => log,
        })
    }

    pub fn fitted_values(&self, scale: ResponseScale) -> Result<Array1<f64>, ModelError> {
        self.predict(PredictTarget::Kind(Kind::Train), scale)
    }

    /// `y - y_hat` over the training rows.
    pub fn raw_residuals(&self, scale: ResponseScale) -> Result<Array1<f64>, ModelError> {
        let y = match scale {
            ResponseScale::Model => self.view.get_y(Kind::Train, self.response_options())?,
            ResponseScale::Log => self.view.get_y(Kind::Train, ResponseOptions::log_scale(false))?,
            ResponseScale::Original => self.view.get_y(
                Kind::Train,
                ResponseOptions {
                    log: false,
                    ..ResponseOptions::default()
                },
            )?,
        };
        Ok(y - self.fitted_values(scale)?)
    }

    fn log_residuals(&self) -> Result<Array1<f64>, ModelError> {
        self.raw_residuals(ResponseScale::Log)
    }

    /// Ultimate loss per accident period.
    ///
    /// Actuals are all observed values, not only the training ones: observed
    /// cells left out of training (zero or negative values when positivity is
    /// required) still count towards `actual`, and are never forecast.
    pub fn ultimate(&self, tail: Option<f64>) -> Result<Vec<UltimateLoss>, ModelError> {
        let tail = tail.unwrap_or(1.0);
        let forecast_ids = self.view.get_idx(Kind::Forecast);
        let forecast = self.predict(PredictTarget::Kind(Kind::Forecast), ResponseScale::Original)?;

        let mut totals: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
        for cell in self.view.cells() {
            let entry = totals.entry(cell.accident_period).or_insert((0.0, 0.0));
            if cell.observed && cell.value.is_finite() {
                entry.0 += cell.value;
            }
        }
        for (&id, &value) in forecast_ids.iter().zip(forecast.iter()) {
            let accident = self.view.cells()[id].accident_period;
            totals.entry(accident).or_insert((0.0, 0.0)).1 += value;
        }

        Ok(totals
            .into_iter()
            .map(|(accident_period, (actual, forecast))| {
                let ultimate = (actual + forecast).round() * tail;
                UltimateLoss {
                    accident_period,
                    actual,
                    forecast,
                    ultimate,
                    reserve: ultimate - actual,
                }
            })
            .collect())
    }

    fn variance_inputs(&self) -> Result<(DesignSlice, Array1<f64>, Array1<f64>), ModelError> {
        self.fitted()?;
        let design = self.view.fit_design(Kind::Train).supported_only();
        let weights = self.view.get_weights(Kind::Train)?.values().to_owned();
        let residuals = self.log_residuals()?;
        Ok((design, weights, residuals))
    }

    /// Process variance of the log-response; `NaN` without degrees of freedom.
    pub fn process_variance(&self, estimator: ProcessVarianceEstimator) -> Result<f64, ModelError> {
        let (design, weights, residuals) = self.variance_inputs()?;
        let engine = VarianceEngine::new(
            design.values.view(),
            weights.view(),
            residuals.view(),
            self.view.degrees_of_freedom(),
        )?;
        Ok(engine.process_variance(estimator))
    }

    /// Log-scale residual standard error per training row, in the order of
    /// `view().get_idx(Kind::Train)`.
    pub fn standard_errors(
        &self,
        estimator: ProcessVarianceEstimator,
    ) -> Result<Array1<f64>, ModelError> {
        let (design, weights, residuals) = self.variance_inputs()?;
        let engine = VarianceEngine::new(
            design.values.view(),
            weights.view(),
            residuals.view(),
            self.view.degrees_of_freedom(),
        )?;
        Ok(engine.standard_errors(estimator)?)
    }

    /// Log-scale residuals over their standard errors, one per training row in
    /// the order of `view().get_idx(Kind::Train)` (the order of the training
    /// weight ids).
    pub fn standardized_residuals(
        &self,
        estimator: ProcessVarianceEstimator,
    ) -> Result<Array1<f64>, ModelError> {
        let (design, weights, residuals) = self.variance_inputs()?;
        let engine = VarianceEngine::new(
            design.values.view(),
            weights.view(),
            residuals.view(),
            self.view.degrees_of_freedom(),
        )?;
        Ok(engine.standardized_residuals(estimator)?)
    }

    /// Covariance of the log-scale fitted values over the training rows.
    pub fn fitted_covariance(
        &self,
        estimator: ProcessVarianceEstimator,
    ) -> Result<Array2<f64>, ModelError> {
        let (design, weights, residuals) = self.variance_inputs()?;
        let engine = VarianceEngine::new(
            design.values.view(),
            weights.view(),
            residuals.view(),
            self.view.degrees_of_freedom(),
        )?;
        Ok(engine.fitted_covariance(estimator)?)
    }

    /// Standard error of every fitted coefficient on the model scale, aligned
    /// to the fitted columns. Unsupported columns report `NaN`.
    pub fn coefficient_standard_errors(
        &self,
        estimator: ProcessVarianceEstimator,
    ) -> Result<Array1<f64>, ModelError> {
        let (design, weights, residuals) = self.variance_inputs()?;
        let engine = VarianceEngine::new(
            design.values.view(),
            weights.view(),
            residuals.view(),
            self.view.degrees_of_freedom(),
        )?;
        let supported = engine.coefficient_standard_errors(estimator)?;
        let scale = if self.config.standardize {
            self.view.zscore().std_dev
        } else {
            1.0
        };
        let fitted = self.fitted()?;
        Ok(fitted
            .columns
            .iter()
            .map(|column| {
                design
                    .columns
                    .iter()
                    .position(|c| c == column)
                    .map_or(f64::NAN, |j| supported[j] / scale)
            })
            .collect())
    }

    /// Fitted coefficients, optionally restricted to one period type.
    pub fn parameters(
        &self,
        kind: Option<PeriodKind>,
    ) -> Result<Vec<ParameterEstimate>, ModelError> {
        let fitted = self.fitted()?;
        Ok(fitted
            .columns
            .iter()
            .zip(fitted.coefficients.iter())
            .filter(|(column, _)| kind.is_none() || column.period_kind() == kind)
            .map(|(column, &value)| ParameterEstimate {
                name: column.name(),
                period_kind: column.period_kind(),
                value,
            })
            .collect())
    }

    /// Overwrites named coefficients of the current fit. Every name is checked
    /// before anything changes.
    pub fn manual_fit(&mut self, values: &[(&str, f64)]) -> Result<(), ModelError> {
        let fitted = self
            .fitter
            .fitted_mut()
            .map_err(|_| ModelError::NotFitted(self.id.clone()))?;
        let positions = values
            .iter()
            .map(|(name, _)| {
                fitted
                    .columns
                    .iter()
                    .position(|c| c.name() == *name)
                    .ok_or_else(|| ModelError::UnknownParameter(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (j, (name, value)) in positions.into_iter().zip(values) {
            log::debug!("Setting '{}' from {} to {}", name, fitted.coefficients[j], value);
            fitted.coefficients[j] = *value;
        }
        Ok(())
    }

    /// Log-likelihood of the training values under the model's family, with
    /// the unbiased process variance as dispersion.
    pub fn log_likelihood(&self) -> Result<f64, ModelError> {
        let dispersion = self.process_variance(ProcessVarianceEstimator::Unbiased)?;
        let y = self.original_train_values()?;
        let mu = self.fitted_values(ResponseScale::Log)?;
        let weights = self.view.get_weights(Kind::Train)?;
        Ok(self
            .kind()
            .family()
            .log_likelihood_density(y.view(), mu.view(), weights.values(), dispersion)
            .sum())
    }

    pub fn deviance(&self) -> Result<f64, ModelError> {
        let y = self.original_train_values()?;
        let mu = self.fitted_values(ResponseScale::Log)?;
        let weights = self.view.get_weights(Kind::Train)?;
        Ok(self
            .kind()
            .family()
            .deviance(y.view(), mu.view(), weights.values()))
    }

    fn original_train_values(&self) -> Result<Array1<f64>, ModelError> {
        Ok(self.view.get_y(
            Kind::Train,
            ResponseOptions {
                log: false,
                ..ResponseOptions::default()
            },
        )?)
    }

    pub fn summary(&self) -> Result<ModelSummary, ModelError> {
        let parameters = self.parameters(None)?;
        let process_variance = self.process_variance(self.config.process_variance)?;
        let weights = self.view.get_weights(Kind::Train)?;
        Ok(ModelSummary {
            id: self.id.clone(),
            kind: self.kind(),
            config: self.config.clone(),
            n_observations: self.view.n_observations(),
            n_parameters: self.view.n_parameters(),
            degrees_of_freedom: self.view.degrees_of_freedom(),
            process_variance,
            standardization: self
                .view
                .is_standardization_computed()
                .then(|| self.view.zscore()),
            parameters,
            combined: self.combined.clone(),
            hetero: self.hetero.as_ref().map(|outcome| HeteroSummary {
                iterations: outcome.iterations,
                converged: outcome.converged,
                cancelled: outcome.cancelled,
                adjustments: outcome
                    .adjustments
                    .iter()
                    .map(|(development_period, factor)| DevelopmentFactor {
                        development_period,
                        factor,
                    })
                    .collect(),
            }),
            weights: weights
                .ids()
                .iter()
                .zip(weights.values().iter())
                .map(|(&cell, &weight)| WeightEntry { cell, weight })
                .collect(),
        })
    }
}

/// Picks the fitted columns out of `design`, in fit order.
fn aligned_values(fitted: &FittedModel, design: &DesignSlice) -> Result<Array2<f64>, ModelError> {
    if design.columns == fitted.columns {
        return Ok(design.values.clone());
    }
    let positions = fitted
        .columns
        .iter()
        .map(|column| {
            design
                .columns
                .iter()
                .position(|c| c == column)
                .ok_or_else(|| ModelError::MissingDesignColumn(column.name()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(design.values.select(Axis(1), &positions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::{ResolvedPenalty, SolverOutput};
    use crate::triangle::{Column, Triangle};
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayView1, ArrayView2};
    use std::cell::Cell;
    use tempfile::NamedTempFile;

    /// Delegates to the default solver for a fixed number of fits, then fails.
    #[derive(Debug)]
    struct FailAfter {
        remaining: Cell<usize>,
    }

    impl RegressionSolver for FailAfter {
        fn solve(
            &self,
            x: ArrayView2<f64>,
            y: ArrayView1<f64>,
            weights: ArrayView1<f64>,
            penalty: &ResolvedPenalty,
        ) -> Result<SolverOutput, RegressionError> {
            let left = self.remaining.get();
            if left == 0 {
                return Err(RegressionError::InvalidHyperparameter(
                    "solver exhausted".to_string(),
                ));
            }
            self.remaining.set(left - 1);
            PenalizedLeastSquares.solve(x, y, weights, penalty)
        }
    }

    fn model_failing_after(successful_fits: usize) -> LogLinear<FailAfter> {
        let config = ModelConfig {
            hyperparameters: Hyperparameters::fixed(0.0, 0.0),
            ..ModelConfig::default()
        };
        let solver = FailAfter {
            remaining: Cell::new(successful_fits),
        };
        LogLinear::with_solver("paid", &triangle(), config, solver).unwrap()
    }

    fn triangle() -> Triangle {
        Triangle::from_incremental(
            2019,
            &[
                vec![1000.0, 600.0, 250.0, 90.0, 30.0],
                vec![1100.0, 640.0, 270.0, 95.0],
                vec![1150.0, 700.0, 300.0],
                vec![1250.0, 720.0],
                vec![1300.0],
            ],
            None,
        )
        .unwrap()
    }

    fn fitted_model() -> LogLinear {
        let config = ModelConfig {
            hyperparameters: Hyperparameters::fixed(0.0, 0.0),
            ..ModelConfig::default()
        };
        let mut model = LogLinear::new("paid", &triangle(), config).unwrap();
        model.fit().unwrap();
        model
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = ModelConfig {
            use_calendar: true,
            hyperparameters: Hyperparameters::fixed(0.4, 0.25),
            ..ModelConfig::default()
        };
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        assert_eq!(ModelConfig::load(file.path()).unwrap(), config);
    }

    #[test]
    fn missing_config_fields_take_defaults() {
        let config: ModelConfig = toml::from_str("use_calendar = true").unwrap();
        assert!(config.must_be_positive);
        assert!(config.standardize);
        assert_eq!(config.hyperparameters.max_iter, 100_000);
        assert_eq!(config.hetero.stop_threshold, 0.01);
        assert!(config.hyperparameters.alpha.is_none());
    }

    #[test]
    fn prediction_requires_a_fit() {
        let model = LogLinear::new("paid", &triangle(), ModelConfig::default()).unwrap();
        assert!(matches!(
            model.predict(PredictTarget::Kind(Kind::Forecast), ResponseScale::Log),
            Err(ModelError::NotFitted(id)) if id == "paid"
        ));
    }

    #[test]
    fn unset_hyperparameters_surface_needs_tuning() {
        let mut model = LogLinear::new("paid", &triangle(), ModelConfig::default()).unwrap();
        assert!(model.needs_tuning());
        assert!(matches!(
            model.fit(),
            Err(ModelError::Regression(RegressionError::NeedsTuning))
        ));
    }

    #[test]
    fn scales_are_consistent() {
        let model = fitted_model();
        let eta = model
            .predict(PredictTarget::Kind(Kind::Train), ResponseScale::Model)
            .unwrap();
        let log = model.fitted_values(ResponseScale::Log).unwrap();
        let original = model.fitted_values(ResponseScale::Original).unwrap();
        assert_abs_diff_eq!(model.view().zscore().invert(&eta), log, epsilon = 1e-12);
        assert_abs_diff_eq!(log.mapv(f64::exp), original, epsilon = 1e-9);
    }

    #[test]
    fn explicit_design_with_marker_column_predicts_like_kind() {
        let model = fitted_model();
        let x = model.view().get_x(Kind::Forecast);
        let by_design = model
            .predict(PredictTarget::Design(&x), ResponseScale::Log)
            .unwrap();
        let by_kind = model
            .predict(PredictTarget::Kind(Kind::Forecast), ResponseScale::Log)
            .unwrap();
        assert_abs_diff_eq!(by_design, by_kind, epsilon = 1e-12);
    }

    #[test]
    fn parameters_filter_by_period_type() {
        let model = fitted_model();
        let all = model.parameters(None).unwrap();
        let development = model.parameters(Some(PeriodKind::Development)).unwrap();
        assert_eq!(all.len(), 9);
        assert_eq!(development.len(), 4);
        assert!(
            development
                .iter()
                .all(|p| p.name.starts_with("development_period_"))
        );
        assert_eq!(all[0].name, "intercept");
    }

    #[test]
    fn manual_fit_overwrites_named_coefficients_atomically() {
        let mut model = fitted_model();
        model.manual_fit(&[("accident_period_2020", 0.25)]).unwrap();
        let fitted = model.fitted().unwrap();
        assert_eq!(
            fitted.coefficient(&Column::Period {
                kind: PeriodKind::Accident,
                value: 2020
            }),
            Some(0.25)
        );

        let before = model.fitted().unwrap().coefficients.clone();
        let err = model
            .manual_fit(&[("intercept", 9.0), ("accident_period_1900", 1.0)])
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownParameter(name) if name == "accident_period_1900"));
        assert_eq!(model.fitted().unwrap().coefficients, before);
    }

    #[test]
    fn ultimate_adds_forecasts_to_actuals() {
        let model = fitted_model();
        let ultimates = model.ultimate(None).unwrap();
        assert_eq!(ultimates.len(), 5);
        let oldest = &ultimates[0];
        assert_eq!(oldest.accident_period, 2019);
        assert_eq!(oldest.actual, 1970.0);
        assert_eq!(oldest.forecast, 0.0);
        assert_eq!(oldest.ultimate, 1970.0);

        let forecast = model
            .predict(PredictTarget::Kind(Kind::Forecast), ResponseScale::Original)
            .unwrap();
        let total_forecast: f64 = ultimates.iter().map(|u| u.forecast).sum();
        assert_abs_diff_eq!(total_forecast, forecast.sum(), epsilon = 1e-6);
        for u in &ultimates {
            assert_eq!(u.ultimate, (u.actual + u.forecast).round());
        }

        let with_tail = model.ultimate(Some(1.05)).unwrap();
        assert_abs_diff_eq!(with_tail[4].ultimate, ultimates[4].ultimate * 1.05, epsilon = 1e-9);
    }

    #[test]
    fn summary_round_trips_through_toml() {
        let model = fitted_model();
        let summary = model.summary().unwrap();
        assert_eq!(summary.n_observations, 15);
        assert_eq!(summary.degrees_of_freedom, 15 - 9);
        assert!(summary.standardization.is_some());

        let file = NamedTempFile::new().unwrap();
        summary.save(file.path()).unwrap();
        let loaded = ModelSummary::load(file.path()).unwrap();
        assert_eq!(loaded, summary);
        assert_eq!(loaded.parameters_of(Some(PeriodKind::Accident)).len(), 4);
    }

    #[test]
    fn failed_refit_after_combining_discards_the_fit() {
        let mut model = model_failing_after(1);
        model.fit().unwrap();
        let columns_before = model.view().columns().len();

        let err = model
            .combine(PeriodKind::Development, &[3, 4], None)
            .unwrap_err();
        assert!(matches!(
            err,
            ModelError::Regression(RegressionError::InvalidHyperparameter(_))
        ));
        assert!(!model.is_fitted());
        assert_eq!(model.combined_groups().len(), 1);
        assert_eq!(model.view().columns().len(), columns_before - 1);
        assert!(matches!(
            model.predict(PredictTarget::Kind(Kind::Forecast), ResponseScale::Log),
            Err(ModelError::NotFitted(_))
        ));
    }

    #[test]
    fn failed_hetero_iteration_restores_previous_weights() {
        let mut model = model_failing_after(2);
        model.fit().unwrap();
        let before = model.view().get_weights(Kind::Train).unwrap().clone();

        // The first loop iteration fits, the second one fails after installing
        // adjusted weights.
        let err = model.fit_hetero().unwrap_err();
        assert!(matches!(
            err,
            ModelError::Regression(RegressionError::InvalidHyperparameter(_))
        ));
        assert!(!model.is_fitted());
        assert!(model.hetero_outcome().is_none());
        assert_eq!(model.view().get_weights(Kind::Train).unwrap(), &before);
        assert!(before.values().iter().all(|&w| w == 1.0));
    }

    #[test]
    fn excluded_observed_cells_still_count_as_actuals() {
        let triangle = Triangle::from_incremental(
            2020,
            &[vec![1000.0, 600.0, -40.0], vec![1100.0, 640.0], vec![1150.0]],
            None,
        )
        .unwrap();
        let config = ModelConfig {
            hyperparameters: Hyperparameters::fixed(0.0, 0.0),
            ..ModelConfig::default()
        };
        let mut model = LogLinear::new("paid", &triangle, config).unwrap();
        model.fit().unwrap();
        assert_eq!(model.view().partition().excluded().len(), 1);

        let ultimates = model.ultimate(None).unwrap();
        assert_eq!(ultimates[0].actual, 1560.0);
        assert_eq!(ultimates[0].forecast, 0.0);
        assert_eq!(ultimates[0].reserve, 0.0);
        assert!(ultimates[1].forecast > 0.0);
    }
}
