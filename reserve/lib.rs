#![deny(unused_imports)]

//! Log-linear reserving core.
//!
//! A loss triangle is indexed by accident and development period. Observed
//! cells train a weighted, optionally elastic-net-regularized regression of the
//! log incremental payment on accident, development and calendar effects; the
//! unobserved cells are forecast from it. The modules below are ordered leaves
//! first: index bookkeeping, the design-matrix view, parameter combination,
//! the regression fitter, the heteroskedasticity loop and the variance engine.
//! `model::LogLinear` drives them as one estimator.

pub mod triangle;
pub mod data;
pub mod types;

pub mod index;
pub mod design;
pub mod combine;
pub mod regression;
pub mod hetero;
pub mod variance;

pub mod family;
pub mod tuning;
pub mod model;
