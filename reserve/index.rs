//! Train / forecast index bookkeeping.
//!
//! The partition is computed once from a triangle's observed and positivity
//! masks. Training rows can later be retired (for example when the log of their
//! response is undefined); retired rows move to `excluded` so the three sets
//! always partition the triangle.

use crate::triangle::{CellId, TriangleData};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which slice of the triangle an accessor should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Train,
    Forecast,
    All,
}

impl Kind {
    /// `None` selects every row, as does `"all"`.
    pub fn parse_optional(kind: Option<&str>) -> Result<Self, IndexError> {
        kind.map_or(Ok(Kind::All), |kind| kind.parse())
    }
}

impl FromStr for Kind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Kind::Train),
            "forecast" => Ok(Kind::Forecast),
            "all" | "none" => Ok(Kind::All),
            _ => Err(IndexError::InvalidKind(s.to_string())),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Train => "train",
            Kind::Forecast => "forecast",
            Kind::All => "all",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("kind must be 'train', 'forecast', or 'all', got '{0}'")]
    InvalidKind(String),
    #[error(
        "Observed cell id {0} is not part of the triangle; the observed flags and the cell ids are inconsistent."
    )]
    ObservedOutsideTriangle(CellId),
    #[error("Positive cell id {0} is not part of the triangle.")]
    PositiveOutsideTriangle(CellId),
}

/// Sorted, deduplicated union of any number of index sets.
pub fn combine_indices(sets: &[&[CellId]]) -> Vec<CellId> {
    sets.iter()
        .map(|set| {
            let mut sorted = set.to_vec();
            sorted.sort_unstable();
            sorted
        })
        .kmerge()
        .dedup()
        .collect()
}

/// Disjoint train / forecast / excluded id sets over one triangle.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPartition {
    train: Vec<CellId>,
    forecast: Vec<CellId>,
    excluded: Vec<CellId>,
}

impl IndexPartition {
    /// `train = observed ∩ positive` when `must_be_positive`, else `observed`;
    /// `forecast = all \ observed`. Observed cells dropped by the positivity
    /// filter are recorded as excluded.
    pub fn build(
        all_ids: &[CellId],
        observed: &[CellId],
        positive: &[CellId],
        must_be_positive: bool,
    ) -> Result<Self, IndexError> {
        let all = combine_indices(&[all_ids]);
        let observed = combine_indices(&[observed]);
        let positive = combine_indices(&[positive]);

        if let Some(&id) = observed.iter().find(|id| all.binary_search(id).is_err()) {
            return Err(IndexError::ObservedOutsideTriangle(id));
        }
        if let Some(&id) = positive.iter().find(|id| all.binary_search(id).is_err()) {
            return Err(IndexError::PositiveOutsideTriangle(id));
        }

        let (train, excluded): (Vec<CellId>, Vec<CellId>) = observed
            .iter()
            .partition(|id| !must_be_positive || positive.binary_search(id).is_ok());
        let forecast = all
            .into_iter()
            .filter(|id| observed.binary_search(id).is_err())
            .collect();

        Ok(Self {
            train,
            forecast,
            excluded,
        })
    }

    pub fn from_triangle<T: TriangleData + ?Sized>(
        triangle: &T,
        must_be_positive: bool,
    ) -> Result<Self, IndexError> {
        Self::build(
            &triangle.all_ids(),
            &triangle.observed_ids(),
            &triangle.positive_ids(),
            must_be_positive,
        )
    }

    pub fn get(&self, kind: Kind) -> Vec<CellId> {
        match kind {
            Kind::Train => self.train.clone(),
            Kind::Forecast => self.forecast.clone(),
            Kind::All => combine_indices(&[&self.train, &self.forecast]),
        }
    }

    pub fn train(&self) -> &[CellId] {
        &self.train
    }

    pub fn forecast(&self) -> &[CellId] {
        &self.forecast
    }

    /// Observed rows that are not used for training.
    pub fn excluded(&self) -> &[CellId] {
        &self.excluded
    }

    /// Retires every training id for which `keep` is false and returns them.
    pub fn retain_train<F>(&mut self, mut keep: F) -> Vec<CellId>
    where
        F: FnMut(CellId) -> bool,
    {
        let (kept, dropped): (Vec<CellId>, Vec<CellId>) =
            self.train.iter().partition(|&&id| keep(id));
        if !dropped.is_empty() {
            self.excluded = combine_indices(&[&self.excluded, &dropped]);
            self.train = kept;
        }
        dropped
    }
}
