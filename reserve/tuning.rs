//! Hyperparameter search collaborator.
//!
//! The estimator only needs a grid and something that picks one candidate from
//! it given a scoring callback. The scoring itself is supplied by the caller
//! (for example a hold-out error), so the search strategy stays pluggable.

use crate::regression::Hyperparameters;
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuningError {
    #[error("The hyperparameter grid has no candidates.")]
    EmptyGrid,
    #[error("No candidate produced a finite score.")]
    NoFiniteScore,
}

fn stepped(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if step <= 0.0 || stop < start {
        return vec![start];
    }
    let count = ((stop - start) / step + 1e-9).floor() as usize;
    (0..=count).map(|k| start + k as f64 * step).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    pub alpha: Vec<f64>,
    pub l1_ratio: Vec<f64>,
    pub max_iter: Vec<usize>,
}

impl Default for ParameterGrid {
    fn default() -> Self {
        Self {
            alpha: stepped(0.0, 3.0, 0.1),
            l1_ratio: stepped(0.0, 1.0, 0.025),
            max_iter: vec![100_000],
        }
    }
}

impl ParameterGrid {
    pub fn len(&self) -> usize {
        self.alpha.len() * self.l1_ratio.len() * self.max_iter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every combination, alpha varying slowest.
    pub fn candidates(&self) -> Vec<Hyperparameters> {
        iproduct!(&self.alpha, &self.l1_ratio, &self.max_iter)
            .map(|(&alpha, &l1_ratio, &max_iter)| Hyperparameters {
                max_iter,
                ..Hyperparameters::fixed(alpha, l1_ratio)
            })
            .collect()
    }
}

/// Chooses hyperparameters from a grid.
pub trait HyperparameterSearch {
    /// `evaluate` scores one candidate; lower is better and a non-finite score
    /// disqualifies it.
    fn select(
        &mut self,
        grid: &ParameterGrid,
        evaluate: &mut dyn FnMut(&Hyperparameters) -> f64,
    ) -> Result<Hyperparameters, TuningError>;
}

/// Exhaustive search over the grid.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridSearch;

impl HyperparameterSearch for GridSearch {
    fn select(
        &mut self,
        grid: &ParameterGrid,
        evaluate: &mut dyn FnMut(&Hyperparameters) -> f64,
    ) -> Result<Hyperparameters, TuningError> {
        let candidates = grid.candidates();
        if candidates.is_empty() {
            return Err(TuningError::EmptyGrid);
        }
        let best = candidates
            .into_iter()
            .map(|candidate| (evaluate(&candidate), candidate))
            .filter(|(score, _)| score.is_finite())
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .ok_or(TuningError::NoFiniteScore)?;
        log::info!(
            "Grid search selected alpha={:?}, l1_ratio={:?} (score {:.6})",
            best.1.alpha,
            best.1.l1_ratio,
            best.0
        );
        Ok(best.1)
    }
}

/// Returns a preset choice without scoring anything.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelection(pub Hyperparameters);

impl HyperparameterSearch for FixedSelection {
    fn select(
        &mut self,
        _grid: &ParameterGrid,
        _evaluate: &mut dyn FnMut(&Hyperparameters) -> f64,
    ) -> Result<Hyperparameters, TuningError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grid_spans_the_search_space() {
        let grid = ParameterGrid::default();
        assert_eq!(grid.alpha.len(), 31);
        assert_eq!(grid.l1_ratio.len(), 41);
        assert_eq!(grid.len(), 31 * 41);
        assert!((grid.alpha[30] - 3.0).abs() < 1e-9);
        assert!((grid.l1_ratio[40] - 1.0).abs() < 1e-9);
        assert_eq!(grid.candidates().len(), grid.len());
    }

    #[test]
    fn grid_search_picks_the_lowest_finite_score() {
        let grid = ParameterGrid {
            alpha: vec![0.0, 0.5, 1.0],
            l1_ratio: vec![0.0, 1.0],
            max_iter: vec![10],
        };
        let mut evaluate = |h: &Hyperparameters| {
            let alpha = h.alpha.unwrap_or(0.0);
            if alpha == 0.0 {
                f64::NAN
            } else {
                (alpha - 0.5).abs() + h.l1_ratio.unwrap_or(0.0)
            }
        };
        let chosen = GridSearch.select(&grid, &mut evaluate).unwrap();
        assert_eq!(chosen.alpha, Some(0.5));
        assert_eq!(chosen.l1_ratio, Some(0.0));
        assert_eq!(chosen.max_iter, 10);
    }

    #[test]
    fn fixed_selection_never_scores() {
        let preset = Hyperparameters::fixed(0.2, 0.75);
        let mut scored = 0;
        let chosen = FixedSelection(preset)
            .select(&ParameterGrid::default(), &mut |_| {
                scored += 1;
                0.0
            })
            .unwrap();
        assert_eq!(chosen, preset);
        assert_eq!(scored, 0);
    }

    #[test]
    fn empty_grid_and_all_nan_scores_fail() {
        let empty = ParameterGrid {
            alpha: vec![],
            l1_ratio: vec![0.5],
            max_iter: vec![10],
        };
        assert_eq!(
            GridSearch.select(&empty, &mut |_| 0.0),
            Err(TuningError::EmptyGrid)
        );
        assert_eq!(
            GridSearch.select(&ParameterGrid::default(), &mut |_| f64::NAN),
            Err(TuningError::NoFiniteScore)
        );
    }
}
