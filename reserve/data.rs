//! # Triangle Loading
//!
//! Reads a loss triangle in long format from a tab-separated file. One row per
//! cell, with a fixed schema:
//!
//! - `accident_period`, `development_period`: integers, required.
//! - `value`: incremental payment. Empty or non-numeric entries are unobserved.
//! - `exposure` (optional): positive, defaults to 1.
//! - `observed` (optional): boolean or 0/1, defaults to "value is present".

use crate::triangle::{Cell, Triangle, TriangleData, TriangleError};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error(transparent)]
    Triangle(#[from] TriangleError),
}

fn integer_column(df: &DataFrame, name: &str) -> Result<Vec<i64>, DataError> {
    let series = df.column(name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(name.to_string()));
    }
    let casted = series
        .cast(&DataType::Int64)
        .map_err(|_| wrong_type(name, "i64 (integer)", series.dtype()))?;
    if casted.null_count() > 0 {
        return Err(wrong_type(name, "i64 (integer)", series.dtype()));
    }
    Ok(casted.i64()?.into_no_null_iter().collect())
}

/// Nulls and unparseable entries become `None`.
fn optional_float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, DataError> {
    let series = df.column(name)?;
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| wrong_type(name, "f64 (numeric)", series.dtype()))?;
    Ok(casted.f64()?.into_iter().collect())
}

fn boolean_column(df: &DataFrame, name: &str) -> Result<Vec<bool>, DataError> {
    let series = df.column(name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(name.to_string()));
    }
    let casted = series
        .cast(&DataType::Boolean)
        .map_err(|_| wrong_type(name, "bool", series.dtype()))?;
    if casted.null_count() > 0 {
        return Err(wrong_type(name, "bool", series.dtype()));
    }
    Ok(casted.bool()?.into_no_null_iter().collect())
}

fn wrong_type(name: &str, expected_type: &'static str, found: &DataType) -> DataError {
    DataError::ColumnWrongType {
        column_name: name.to_string(),
        expected_type,
        found_type: format!("{found:?}"),
    }
}

/// Loads a triangle from a long-format TSV file.
pub fn load_triangle(path: impl AsRef<Path>) -> Result<Triangle, DataError> {
    let path = path.as_ref();
    log::info!("Loading triangle from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let columns: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for required in ["accident_period", "development_period", "value"] {
        if !columns.contains(required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }

    let accident = integer_column(&df, "accident_period")?;
    let development = integer_column(&df, "development_period")?;
    let values = optional_float_column(&df, "value")?;
    let exposure = if columns.contains("exposure") {
        optional_float_column(&df, "exposure")?
            .into_iter()
            .map(|e| e.unwrap_or(1.0))
            .collect()
    } else {
        vec![1.0; df.height()]
    };
    let observed = if columns.contains("observed") {
        Some(boolean_column(&df, "observed")?)
    } else {
        None
    };

    let cells = (0..df.height())
        .map(|row| {
            let value = values[row].filter(|v| v.is_finite());
            Cell {
                accident_period: accident[row],
                development_period: development[row],
                exposure: exposure[row],
                value: value.unwrap_or(f64::NAN),
                observed: observed
                    .as_ref()
                    .map_or(value.is_some(), |flags| flags[row]),
            }
        })
        .collect();

    let triangle = Triangle::from_cells(cells)?;
    log::info!(
        "Loaded {} cells, {} observed",
        triangle.len(),
        triangle.cells().iter().filter(|c| c.observed).count()
    );
    Ok(triangle)
}
