use crate::triangle::CellId;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// Regression coefficients, one per column of the design they were fit on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coefficients(pub Array1<f64>);

impl Coefficients {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for Coefficients {
    type Target = Array1<f64>;

    fn deref(&self) -> &Array1<f64> {
        &self.0
    }
}

impl DerefMut for Coefficients {
    fn deref_mut(&mut self) -> &mut Array1<f64> {
        &mut self.0
    }
}

/// `X * beta` on the scale the regression was fit on.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearPredictor(pub Array1<f64>);

impl LinearPredictor {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }
}

impl Deref for LinearPredictor {
    type Target = Array1<f64>;

    fn deref(&self) -> &Array1<f64> {
        &self.0
    }
}

/// One non-negative weight per training row, carrying the row ids it is
/// aligned to. The ids are always sorted ascending, matching the training index.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightVector {
    ids: Vec<CellId>,
    values: Array1<f64>,
}

impl WeightVector {
    /// Uniform weights of 1 for every id.
    pub fn uniform(ids: &[CellId]) -> Self {
        Self {
            ids: ids.to_vec(),
            values: Array1::ones(ids.len()),
        }
    }

    /// Pairs ids with values. Returns `None` if the lengths differ.
    pub fn from_parts(ids: Vec<CellId>, values: Array1<f64>) -> Option<Self> {
        if ids.len() != values.len() {
            return None;
        }
        Some(Self { ids, values })
    }

    pub fn ids(&self) -> &[CellId] {
        &self.ids
    }

    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, id: CellId) -> Option<f64> {
        self.ids
            .binary_search(&id)
            .ok()
            .map(|position| self.values[position])
    }

    /// Keeps only the entries whose id is in `keep` (sorted ascending).
    pub fn restrict(&self, keep: &[CellId]) -> Self {
        let mut ids = Vec::with_capacity(keep.len());
        let mut values = Vec::with_capacity(keep.len());
        for (&id, &value) in self.ids.iter().zip(self.values.iter()) {
            if keep.binary_search(&id).is_ok() {
                ids.push(id);
                values.push(value);
            }
        }
        Self {
            ids,
            values: Array1::from_vec(values),
        }
    }
}

impl FromIterator<(CellId, f64)> for WeightVector {
    /// Pairs must arrive in ascending id order.
    fn from_iter<I: IntoIterator<Item = (CellId, f64)>>(iter: I) -> Self {
        let (ids, values): (Vec<CellId>, Vec<f64>) = iter.into_iter().unzip();
        Self {
            ids,
            values: Array1::from_vec(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn restrict_keeps_alignment() {
        let weights = WeightVector::from_parts(vec![1, 4, 6, 9], array![0.5, 1.0, 1.5, 2.0])
            .expect("lengths match");
        let kept = weights.restrict(&[4, 9]);
        assert_eq!(kept.ids(), &[4, 9]);
        assert_eq!(kept.values(), array![1.0, 2.0].view());
        assert_eq!(kept.get(9), Some(2.0));
        assert_eq!(kept.get(1), None);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(WeightVector::from_parts(vec![0, 1], array![1.0]).is_none());
    }
}
