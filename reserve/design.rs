//! # Design-Matrix View
//!
//! A read-view over a triangle's feature columns and response, sliced by the
//! current [`IndexPartition`] and a [`Kind`]. Every accessor for a given kind
//! returns rows in ascending cell-id order, so feature rows, responses, period
//! vectors, exposures and weights always line up.
//!
//! - `get_x` is a faithful slice: it keeps the `is_observed` marker. Callers that
//!   need a numeric fit matrix use [`DesignMatrixView::fit_design`] or strip it
//!   themselves.
//! - Standardization parameters are computed from the training log-response the
//!   first time they are needed and frozen afterwards, so fit-time and
//!   predict-time scaling cannot drift apart. `reset_standardization` is the
//!   only way to recompute them.

use crate::index::{IndexError, IndexPartition, Kind};
use crate::triangle::{Cell, CellId, Column, FeatureFrame, PeriodKind, TriangleData};
use crate::types::WeightVector;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ViewError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("`{accessor}` is only defined for kind 'train', got '{kind}'.")]
    TrainOnly { accessor: &'static str, kind: Kind },
    #[error(
        "The weight vector must be aligned to the current training index ({expected} rows); it covers {found} rows with different ids."
    )]
    WeightAlignment { expected: usize, found: usize },
    #[error("Weight {value} for cell {id} must be finite and non-negative.")]
    InvalidWeight { id: CellId, value: f64 },
    #[error("The feature frame has shape {found:?}, expected {expected:?}.")]
    FrameShape {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// Mean and standard deviation of the training log-response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZScore {
    pub mean: f64,
    pub std_dev: f64,
}

impl ZScore {
    /// Sample mean and standard deviation (n - 1 denominator) of the finite
    /// values. A degenerate spread falls back to 1 so the transform stays
    /// invertible.
    pub fn from_sample(values: ArrayView1<f64>) -> Self {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let n = finite.len();
        if n == 0 {
            return Self {
                mean: 0.0,
                std_dev: 1.0,
            };
        }
        let mean = finite.iter().sum::<f64>() / n as f64;
        let std_dev = if n > 1 {
            (finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            f64::NAN
        };
        Self {
            mean,
            std_dev: if std_dev.is_finite() && std_dev > 0.0 {
                std_dev
            } else {
                1.0
            },
        }
    }

    pub fn apply(&self, values: &Array1<f64>) -> Array1<f64> {
        values.mapv(|v| (v - self.mean) / self.std_dev)
    }

    pub fn invert(&self, values: &Array1<f64>) -> Array1<f64> {
        values.mapv(|v| v * self.std_dev + self.mean)
    }
}

/// How [`DesignMatrixView::get_y`] transforms the base response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseOptions {
    /// Multiply by the training weights before any other transform.
    pub weighted: bool,
    pub log: bool,
    /// z-score with the frozen training parameters.
    pub standardize: bool,
    /// Invert the z-score instead of applying it. Takes precedence over
    /// `standardize`.
    pub actual_scale: bool,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            weighted: false,
            log: true,
            standardize: false,
            actual_scale: false,
        }
    }
}

impl ResponseOptions {
    pub fn log_scale(standardize: bool) -> Self {
        Self {
            standardize,
            ..Self::default()
        }
    }
}

/// A row/column slice of the feature frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignSlice {
    pub ids: Vec<CellId>,
    pub columns: Vec<Column>,
    pub values: Array2<f64>,
}

impl DesignSlice {
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn column(&self, column: &Column) -> Option<ArrayView1<'_, f64>> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|j| self.values.column(j))
    }

    /// Same rows, minus the `is_observed` marker column.
    pub fn without_observed_marker(&self) -> DesignSlice {
        self.keep_columns(|column, _| !column.is_observed_marker())
    }

    /// `true` per column with at least one finite non-zero entry.
    pub fn support(&self) -> Vec<bool> {
        column_support(self.values.view())
    }

    /// Drops the columns that have no support on these rows.
    pub fn supported_only(&self) -> DesignSlice {
        let support = self.support();
        self.keep_columns(|_, j| support[j])
    }

    fn keep_columns<F>(&self, keep: F) -> DesignSlice
    where
        F: Fn(&Column, usize) -> bool,
    {
        let kept: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(j, column)| keep(column, *j))
            .map(|(j, _)| j)
            .collect();
        DesignSlice {
            ids: self.ids.clone(),
            columns: kept.iter().map(|&j| self.columns[j].clone()).collect(),
            values: self.values.select(Axis(1), &kept),
        }
    }
}

/// A column is supported when it carries at least one finite, non-zero value.
/// Calendar trends beyond the latest observed calendar period have none on the
/// training rows and are not real parameters.
pub fn column_support(values: ArrayView2<f64>) -> Vec<bool> {
    values
        .axis_iter(Axis(1))
        .map(|column| column.iter().any(|v| v.is_finite() && *v != 0.0))
        .collect()
}

/// Index-filtered view over a triangle snapshot.
#[derive(Debug, Clone)]
pub struct DesignMatrixView {
    cells: Vec<Cell>,
    frame: FeatureFrame,
    partition: IndexPartition,
    weights: WeightVector,
    zscore: OnceCell<ZScore>,
    has_combined_params: bool,
}

impl DesignMatrixView {
    pub fn new<T: TriangleData + ?Sized>(
        triangle: &T,
        must_be_positive: bool,
        include_calendar: bool,
    ) -> Result<Self, ViewError> {
        let partition = IndexPartition::from_triangle(triangle, must_be_positive)?;
        let cells = triangle.cells().to_vec();
        let frame = triangle.design(include_calendar);
        let expected = (cells.len(), frame.columns.len());
        if frame.values.dim() != expected {
            return Err(ViewError::FrameShape {
                expected,
                found: frame.values.dim(),
            });
        }
        let weights = WeightVector::uniform(partition.train());
        log::debug!(
            "Design view: {} cells, {} columns, {} train / {} forecast / {} excluded rows",
            cells.len(),
            frame.columns.len(),
            partition.train().len(),
            partition.forecast().len(),
            partition.excluded().len()
        );
        Ok(Self {
            cells,
            frame,
            partition,
            weights,
            zscore: OnceCell::new(),
            has_combined_params: false,
        })
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn partition(&self) -> &IndexPartition {
        &self.partition
    }

    /// Current column set, in frame order.
    pub fn columns(&self) -> &[Column] {
        &self.frame.columns
    }

    pub fn has_combined_params(&self) -> bool {
        self.has_combined_params
    }

    pub fn get_idx(&self, kind: Kind) -> Vec<CellId> {
        self.partition.get(kind)
    }

    /// Feature rows for `kind` with the intercept moved to the front. The
    /// `is_observed` marker is kept.
    pub fn get_x(&self, kind: Kind) -> DesignSlice {
        let ids = self.get_idx(kind);
        let mut order: Vec<usize> = (0..self.frame.columns.len()).collect();
        order.sort_by_key(|&j| self.frame.columns[j] != Column::Intercept);
        DesignSlice {
            columns: order
                .iter()
                .map(|&j| self.frame.columns[j].clone())
                .collect(),
            values: self
                .frame
                .values
                .select(Axis(0), &ids)
                .select(Axis(1), &order),
            ids,
        }
    }

    /// `get_x` without the `is_observed` marker: the matrix regressions consume.
    pub fn fit_design(&self, kind: Kind) -> DesignSlice {
        self.get_x(kind).without_observed_marker()
    }

    /// Training response. Forecast responses are what the model predicts, so
    /// any other kind is rejected.
    pub fn get_y(&self, kind: Kind, options: ResponseOptions) -> Result<Array1<f64>, ViewError> {
        if kind != Kind::Train {
            return Err(ViewError::TrainOnly {
                accessor: "get_y",
                kind,
            });
        }
        let mut y: Array1<f64> = self
            .partition
            .train()
            .iter()
            .map(|&id| self.cells[id].value)
            .collect();
        if options.weighted {
            y = y * &self.weights.values();
        }
        if options.log {
            y.mapv_inplace(f64::ln);
        }
        if options.actual_scale {
            y = self.zscore().invert(&y);
        } else if options.standardize {
            y = self.zscore().apply(&y);
        }
        Ok(y)
    }

    /// Frozen standardization parameters, computed on first use from the
    /// unweighted training log-response.
    pub fn zscore(&self) -> ZScore {
        *self.zscore.get_or_init(|| {
            let log_y: Array1<f64> = self
                .partition
                .train()
                .iter()
                .map(|&id| self.cells[id].value.ln())
                .collect();
            let zscore = ZScore::from_sample(log_y.view());
            log::debug!(
                "Standardization frozen at mean {:.6}, sd {:.6}",
                zscore.mean,
                zscore.std_dev
            );
            zscore
        })
    }

    pub fn is_standardization_computed(&self) -> bool {
        self.zscore.get().is_some()
    }

    /// Forgets the frozen standardization parameters; the next use recomputes them.
    pub fn reset_standardization(&mut self) {
        self.zscore = OnceCell::new();
    }

    pub fn get_period(&self, period: PeriodKind, kind: Kind) -> Vec<i64> {
        self.get_idx(kind)
            .iter()
            .map(|&id| period.value_of(&self.cells[id]))
            .collect()
    }

    pub fn get_accident(&self, kind: Kind) -> Vec<i64> {
        self.get_period(PeriodKind::Accident, kind)
    }

    pub fn get_development(&self, kind: Kind) -> Vec<i64> {
        self.get_period(PeriodKind::Development, kind)
    }

    pub fn get_calendar(&self, kind: Kind) -> Vec<i64> {
        self.get_period(PeriodKind::Calendar, kind)
    }

    pub fn get_exposure(&self, kind: Kind) -> Array1<f64> {
        self.get_idx(kind)
            .iter()
            .map(|&id| self.cells[id].exposure)
            .collect()
    }

    /// Training weights. Weights do not exist for forecast rows.
    pub fn get_weights(&self, kind: Kind) -> Result<&WeightVector, ViewError> {
        if kind != Kind::Train {
            return Err(ViewError::TrainOnly {
                accessor: "get_weights",
                kind,
            });
        }
        Ok(&self.weights)
    }

    /// Installs a new weight snapshot. It must be aligned to the training index.
    pub fn set_weights(&mut self, weights: WeightVector) -> Result<(), ViewError> {
        if weights.ids() != self.partition.train() {
            return Err(ViewError::WeightAlignment {
                expected: self.partition.train().len(),
                found: weights.len(),
            });
        }
        if let Some((&id, &value)) = weights
            .ids()
            .iter()
            .zip(weights.values().iter())
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(ViewError::InvalidWeight { id, value });
        }
        self.weights = weights;
        Ok(())
    }

    /// Retires training rows whose log-response is undefined. Their weights go
    /// with them. Returns the retired ids.
    pub fn retain_defined_log_response(&mut self) -> Vec<CellId> {
        let cells = &self.cells;
        let dropped = self.partition.retain_train(|id| {
            let value = cells[id].value;
            value.is_finite() && value > 0.0
        });
        if !dropped.is_empty() {
            log::info!(
                "Dropped {} training rows with undefined log-response",
                dropped.len()
            );
            self.weights = self.weights.restrict(self.partition.train());
        }
        dropped
    }

    pub fn n_observations(&self) -> usize {
        self.partition.train().len()
    }

    /// Fit columns with support on the training rows.
    pub fn n_parameters(&self) -> usize {
        self.fit_design(Kind::Train)
            .support()
            .into_iter()
            .filter(|&supported| supported)
            .count()
    }

    pub fn degrees_of_freedom(&self) -> i64 {
        self.n_observations() as i64 - self.n_parameters() as i64
    }

    /// Replaces the whole column set. Used by parameter combination.
    pub(crate) fn install_columns(
        &mut self,
        columns: Vec<Column>,
        values: Array2<f64>,
    ) -> Result<(), ViewError> {
        let expected = (self.cells.len(), columns.len());
        if values.dim() != expected {
            return Err(ViewError::FrameShape {
                expected,
                found: values.dim(),
            });
        }
        self.frame = FeatureFrame { columns, values };
        self.has_combined_params = true;
        Ok(())
    }

    pub(crate) fn frame(&self) -> &FeatureFrame {
        &self.frame
    }
}
