//! # Triangle Collaborator
//!
//! The estimator never owns triangle storage: it consumes a read-only snapshot
//! through [`TriangleData`]. [`Triangle`] is the in-memory implementation used
//! by the loader, the CLI and the tests.
//!
//! - Cell ids are row positions in `cells()`; every accessor downstream is
//!   keyed by them.
//! - Design columns are typed. A column's name is derived from its
//!   [`Column`] value and is never parsed back.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use thiserror::Error;

/// Row identifier of a triangle cell: its position in [`TriangleData::cells`].
pub type CellId = usize;

/// The three period dimensions of a triangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeriodKind {
    Accident,
    Development,
    Calendar,
}

impl PeriodKind {
    pub const ALL: [PeriodKind; 3] = [
        PeriodKind::Accident,
        PeriodKind::Development,
        PeriodKind::Calendar,
    ];

    /// Prefix of the indicator column names for this period type.
    pub fn column_prefix(self) -> &'static str {
        match self {
            PeriodKind::Accident => "accident_period",
            PeriodKind::Development => "development_period",
            PeriodKind::Calendar => "calendar_period",
        }
    }

    /// Short tag used for default combined-column names.
    pub fn short_name(self) -> &'static str {
        match self {
            PeriodKind::Accident => "acc",
            PeriodKind::Development => "dev",
            PeriodKind::Calendar => "cal",
        }
    }

    pub fn value_of(self, cell: &Cell) -> i64 {
        match self {
            PeriodKind::Accident => cell.accident_period,
            PeriodKind::Development => cell.development_period,
            PeriodKind::Calendar => cell.calendar_period(),
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// A design-matrix column identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Column {
    Intercept,
    /// 1 for observed cells, 0 otherwise. Never a regression parameter.
    IsObserved,
    /// Indicator for a single period value.
    Period { kind: PeriodKind, value: i64 },
    /// Row-wise sum of several merged period indicators.
    Combined {
        kind: PeriodKind,
        name: String,
        members: Vec<i64>,
    },
}

impl Column {
    pub fn name(&self) -> String {
        match self {
            Column::Intercept => "intercept".to_string(),
            Column::IsObserved => "is_observed".to_string(),
            Column::Period {
                kind: PeriodKind::Development,
                value,
            } => format!("{}_{:04}", PeriodKind::Development.column_prefix(), value),
            Column::Period { kind, value } => format!("{}_{}", kind.column_prefix(), value),
            Column::Combined { name, .. } => name.clone(),
        }
    }

    pub fn period_kind(&self) -> Option<PeriodKind> {
        match self {
            Column::Period { kind, .. } | Column::Combined { kind, .. } => Some(*kind),
            Column::Intercept | Column::IsObserved => None,
        }
    }

    pub fn is_observed_marker(&self) -> bool {
        matches!(self, Column::IsObserved)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// One triangle cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub accident_period: i64,
    pub development_period: i64,
    pub exposure: f64,
    /// Incremental payment. `NaN` for cells that have not been observed yet.
    pub value: f64,
    pub observed: bool,
}

impl Cell {
    pub fn calendar_period(&self) -> i64 {
        self.accident_period + self.development_period
    }
}

/// Named feature columns over every triangle cell, one row per [`CellId`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    pub columns: Vec<Column>,
    pub values: Array2<f64>,
}

impl FeatureFrame {
    pub fn column_index(&self, column: &Column) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Everything the estimator reads from a triangle.
pub trait TriangleData {
    fn cells(&self) -> &[Cell];

    /// Feature frame over all cells, in cell order.
    fn design(&self, include_calendar: bool) -> FeatureFrame;

    fn all_ids(&self) -> Vec<CellId> {
        (0..self.cells().len()).collect()
    }

    fn observed_ids(&self) -> Vec<CellId> {
        self.cells()
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.observed)
            .map(|(id, _)| id)
            .collect()
    }

    fn positive_ids(&self) -> Vec<CellId> {
        self.cells()
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.value.is_finite() && cell.value > 0.0)
            .map(|(id, _)| id)
            .collect()
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum TriangleError {
    #[error("A triangle needs at least one cell.")]
    Empty,
    #[error(
        "Cell (accident {accident_period}, development {development_period}) appears more than once."
    )]
    DuplicateCell {
        accident_period: i64,
        development_period: i64,
    },
    #[error(
        "Exposure for accident period {accident_period} must be finite and positive, found {exposure}."
    )]
    InvalidExposure { accident_period: i64, exposure: f64 },
    #[error("{found} exposure values were supplied for {expected} accident periods.")]
    ExposureLength { expected: usize, found: usize },
}

/// In-memory triangle in long format, sorted by accident then development period.
#[derive(Debug, Clone, PartialEq)]
pub struct Triangle {
    cells: Vec<Cell>,
}

impl Triangle {
    /// Builds a triangle from explicit cells. Cells are reordered by
    /// (accident, development); ids refer to that order.
    pub fn from_cells(mut cells: Vec<Cell>) -> Result<Self, TriangleError> {
        if cells.is_empty() {
            return Err(TriangleError::Empty);
        }
        cells.sort_by_key(|cell| (cell.accident_period, cell.development_period));

        let mut seen = HashSet::with_capacity(cells.len());
        for cell in &cells {
            if !seen.insert((cell.accident_period, cell.development_period)) {
                return Err(TriangleError::DuplicateCell {
                    accident_period: cell.accident_period,
                    development_period: cell.development_period,
                });
            }
            if !cell.exposure.is_finite() || cell.exposure <= 0.0 {
                return Err(TriangleError::InvalidExposure {
                    accident_period: cell.accident_period,
                    exposure: cell.exposure,
                });
            }
        }
        Ok(Self { cells })
    }

    /// Builds a rectangle from rows of incremental values, one row per accident
    /// period starting at `first_accident`. Development periods are 0-based.
    /// Rows shorter than the longest row, and `NaN` entries, are unobserved.
    pub fn from_incremental(
        first_accident: i64,
        rows: &[Vec<f64>],
        exposure: Option<&[f64]>,
    ) -> Result<Self, TriangleError> {
        if let Some(exposure) = exposure {
            if exposure.len() != rows.len() {
                return Err(TriangleError::ExposureLength {
                    expected: rows.len(),
                    found: exposure.len(),
                });
            }
        }
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut cells = Vec::with_capacity(rows.len() * width);
        for (i, row) in rows.iter().enumerate() {
            let cell_exposure = exposure.map_or(1.0, |e| e[i]);
            for j in 0..width {
                let value = row.get(j).copied().unwrap_or(f64::NAN);
                cells.push(Cell {
                    accident_period: first_accident + i as i64,
                    development_period: j as i64,
                    exposure: cell_exposure,
                    value,
                    observed: value.is_finite(),
                });
            }
        }
        Self::from_cells(cells)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Sorted distinct values of one period dimension across all cells.
    pub fn periods(&self, kind: PeriodKind) -> Vec<i64> {
        self.cells
            .iter()
            .map(|cell| kind.value_of(cell))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl TriangleData for Triangle {
    fn cells(&self) -> &[Cell] {
        &self.cells
    }

    fn design(&self, include_calendar: bool) -> FeatureFrame {
        let mut columns = vec![Column::Intercept, Column::IsObserved];

        // Accident levels; the first period is absorbed by the intercept.
        let accident = self.periods(PeriodKind::Accident);
        columns.extend(accident.iter().skip(1).map(|&value| Column::Period {
            kind: PeriodKind::Accident,
            value,
        }));

        // Development and calendar trends are step indicators.
        let development = self.periods(PeriodKind::Development);
        columns.extend(development.iter().skip(1).map(|&value| Column::Period {
            kind: PeriodKind::Development,
            value,
        }));
        if include_calendar {
            let calendar = self.periods(PeriodKind::Calendar);
            columns.extend(calendar.iter().skip(1).map(|&value| Column::Period {
                kind: PeriodKind::Calendar,
                value,
            }));
        }

        let values = Array2::from_shape_fn((self.cells.len(), columns.len()), |(row, col)| {
            let cell = &self.cells[row];
            let hit = match &columns[col] {
                Column::Intercept => true,
                Column::IsObserved => cell.observed,
                Column::Period {
                    kind: PeriodKind::Accident,
                    value,
                } => cell.accident_period == *value,
                Column::Period { kind, value } => kind.value_of(cell) >= *value,
                Column::Combined { .. } => false,
            };
            if hit { 1.0 } else { 0.0 }
        });

        FeatureFrame { columns, values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_triangle() -> Triangle {
        Triangle::from_incremental(
            2020,
            &[vec![100.0, 50.0, 10.0], vec![110.0, 55.0], vec![120.0]],
            None,
        )
        .expect("valid triangle")
    }

    #[test]
    fn ragged_rows_become_unobserved_cells() {
        let tri = small_triangle();
        assert_eq!(tri.len(), 9);
        assert_eq!(tri.observed_ids(), vec![0, 1, 2, 3, 4, 6]);
        let last = &tri.cells()[8];
        assert_eq!(last.accident_period, 2022);
        assert_eq!(last.development_period, 2);
        assert_eq!(last.calendar_period(), 2024);
        assert!(last.value.is_nan());
    }

    #[test]
    fn design_columns_follow_period_structure() {
        let tri = small_triangle();
        let frame = tri.design(true);
        let names: Vec<String> = frame.columns.iter().map(Column::name).collect();
        assert_eq!(
            names,
            vec![
                "intercept",
                "is_observed",
                "accident_period_2021",
                "accident_period_2022",
                "development_period_0001",
                "development_period_0002",
                "calendar_period_2021",
                "calendar_period_2022",
                "calendar_period_2023",
                "calendar_period_2024",
            ]
        );
        // cell (2021, dev 1): accident level + first development step + calendar 2021, 2022
        let row = frame.values.row(4);
        assert_eq!(
            row.to_vec(),
            vec![1.0, 1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0]
        );
    }

    #[test]
    fn duplicate_cells_are_rejected() {
        let cell = Cell {
            accident_period: 2020,
            development_period: 0,
            exposure: 1.0,
            value: 1.0,
            observed: true,
        };
        let err = Triangle::from_cells(vec![cell.clone(), cell]).unwrap_err();
        assert!(matches!(err, TriangleError::DuplicateCell { .. }));
    }
}
