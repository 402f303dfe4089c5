//! Merging several period indicators into a single parameter.
//!
//! Combining is destructive: the member columns leave the view and only a new
//! view built from the triangle brings them back.

use crate::design::{DesignMatrixView, ViewError};
use crate::triangle::{Column, PeriodKind};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CombineError {
    #[error(
        "Unrecognized period type '{0}'. Use one of: accident (acc, ay), development (dev, dy), calendar (cal, cy)."
    )]
    UnknownPeriodType(String),
    #[error("Column '{0}' was not found in the design matrix.")]
    ColumnNotFound(String),
    #[error("At least one {0} period is needed to combine parameters.")]
    EmptyPeriodList(PeriodKind),
    #[error("A design column named '{0}' already exists.")]
    NameCollision(String),
    #[error(transparent)]
    View(#[from] ViewError),
}

/// Maps a user-facing period-type label onto a [`PeriodKind`].
pub fn resolve_period_type(raw: &str) -> Result<PeriodKind, CombineError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "accident" | "acc" | "ay" | "accident_year" | "accident_period" => {
            Ok(PeriodKind::Accident)
        }
        "development" | "dev" | "dy" | "development_year" | "development_period" => {
            Ok(PeriodKind::Development)
        }
        "calendar" | "cal" | "cy" | "calendar_year" | "calendar_period" => {
            Ok(PeriodKind::Calendar)
        }
        _ => Err(CombineError::UnknownPeriodType(raw.to_string())),
    }
}

/// Record of one merge, kept so a saved model can describe its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedGroup {
    pub kind: PeriodKind,
    pub name: String,
    pub members: Vec<i64>,
}

pub fn default_combined_name(kind: PeriodKind) -> String {
    format!("{}_combined", kind.short_name())
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '.' { '_' } else { c })
        .collect()
}

/// Replaces the indicator columns of `periods` with their row-wise sum.
///
/// The new column takes the position of the first member. Every member must be
/// present; nothing is modified on error.
pub fn combine_parameters(
    view: &mut DesignMatrixView,
    kind: PeriodKind,
    periods: &[i64],
    name: Option<&str>,
) -> Result<CombinedGroup, CombineError> {
    let mut members = periods.to_vec();
    members.sort_unstable();
    members.dedup();
    if members.is_empty() {
        return Err(CombineError::EmptyPeriodList(kind));
    }

    let name = normalize_name(name.unwrap_or(&default_combined_name(kind)));
    let frame = view.frame();

    let mut positions = Vec::with_capacity(members.len());
    for &value in &members {
        let column = Column::Period { kind, value };
        let position = frame
            .column_index(&column)
            .ok_or_else(|| CombineError::ColumnNotFound(column.name()))?;
        positions.push(position);
    }
    if frame
        .columns
        .iter()
        .enumerate()
        .any(|(j, column)| !positions.contains(&j) && column.name() == name)
    {
        return Err(CombineError::NameCollision(name));
    }

    let combined = frame.values.select(Axis(1), &positions).sum_axis(Axis(1));
    let anchor = positions.iter().copied().min().unwrap_or(0);

    let mut columns = Vec::with_capacity(frame.columns.len() + 1 - positions.len());
    let mut sources: Vec<Option<usize>> = Vec::with_capacity(columns.capacity());
    for (j, column) in frame.columns.iter().enumerate() {
        if j == anchor {
            columns.push(Column::Combined {
                kind,
                name: name.clone(),
                members: members.clone(),
            });
            sources.push(None);
        } else if !positions.contains(&j) {
            columns.push(column.clone());
            sources.push(Some(j));
        }
    }

    let mut values = Array2::zeros((frame.values.nrows(), columns.len()));
    for (target, source) in sources.iter().enumerate() {
        match source {
            Some(j) => values.column_mut(target).assign(&frame.values.column(*j)),
            None => values.column_mut(target).assign(&combined),
        }
    }

    view.install_columns(columns, values)?;
    log::info!(
        "Combined {} {} periods {:?} into '{}'",
        members.len(),
        kind,
        members,
        name
    );
    Ok(CombinedGroup {
        kind,
        name,
        members,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Kind;
    use crate::triangle::Triangle;

    fn view() -> DesignMatrixView {
        let tri = Triangle::from_incremental(
            2018,
            &[
                vec![100.0, 60.0, 20.0, 5.0, 1.0],
                vec![120.0, 70.0, 25.0, 6.0],
                vec![130.0, 80.0, 30.0],
                vec![150.0, 85.0],
                vec![160.0],
            ],
            None,
        )
        .unwrap();
        DesignMatrixView::new(&tri, true, true).unwrap()
    }

    #[test]
    fn synonyms_resolve_to_period_kinds() {
        assert_eq!(resolve_period_type("AY").unwrap(), PeriodKind::Accident);
        assert_eq!(
            resolve_period_type("development_year").unwrap(),
            PeriodKind::Development
        );
        assert_eq!(resolve_period_type(" cal ").unwrap(), PeriodKind::Calendar);
        assert!(matches!(
            resolve_period_type("quarter"),
            Err(CombineError::UnknownPeriodType(_))
        ));
    }

    #[test]
    fn combining_k_columns_leaves_p_minus_k_plus_one() {
        let mut view = view();
        let before = view.get_x(Kind::All);
        let group =
            combine_parameters(&mut view, PeriodKind::Development, &[2, 3, 4], None).unwrap();
        let after = view.get_x(Kind::All);

        assert_eq!(after.ncols(), before.ncols() - 3 + 1);
        assert!(view.has_combined_params());
        assert_eq!(group.name, "dev_combined");

        let summed = before
            .column(&Column::Period {
                kind: PeriodKind::Development,
                value: 2,
            })
            .unwrap()
            .to_owned()
            + before
                .column(&Column::Period {
                    kind: PeriodKind::Development,
                    value: 3,
                })
                .unwrap()
            + before
                .column(&Column::Period {
                    kind: PeriodKind::Development,
                    value: 4,
                })
                .unwrap();
        let combined = after
            .column(&Column::Combined {
                kind: PeriodKind::Development,
                name: "dev_combined".to_string(),
                members: vec![2, 3, 4],
            })
            .unwrap();
        assert_eq!(combined, summed.view());
    }

    #[test]
    fn calendar_columns_can_be_combined() {
        let mut view = view();
        let group = combine_parameters(
            &mut view,
            PeriodKind::Calendar,
            &[2020, 2019],
            Some("Early Cal.Trend"),
        )
        .unwrap();
        assert_eq!(group.name, "early_cal_trend");
        assert_eq!(group.members, vec![2019, 2020]);
        assert!(
            view.columns()
                .iter()
                .all(|c| !matches!(c, Column::Period { kind: PeriodKind::Calendar, value } if *value <= 2020))
        );
    }

    #[test]
    fn missing_member_fails_without_modifying_the_view() {
        let mut view = view();
        let before = view.columns().to_vec();
        let err = combine_parameters(&mut view, PeriodKind::Accident, &[2019, 2040], None)
            .unwrap_err();
        assert_eq!(
            err,
            CombineError::ColumnNotFound("accident_period_2040".to_string())
        );
        assert_eq!(view.columns(), before.as_slice());
        assert!(!view.has_combined_params());
    }

    #[test]
    fn name_collision_is_rejected() {
        let mut view = view();
        let err = combine_parameters(
            &mut view,
            PeriodKind::Accident,
            &[2019, 2020],
            Some("intercept"),
        )
        .unwrap_err();
        assert_eq!(err, CombineError::NameCollision("intercept".to_string()));
    }
}
