//! # transflow-core: time grids and interpolating vectors
//!
//! States, controls and bounds of a transient network optimization all live
//! on their own time grids. This crate provides the grid helpers, the
//! piecewise-linear [`InterpolatingVector`] with its borrowed views, and the
//! JSON documents used to supply such vectors from configuration files.
//!
//! ```rust
//! use transflow_core::{Interpolating, InterpolatingVector};
//!
//! let inflow = InterpolatingVector::with_values(vec![0.0, 10.0], 1, vec![2.0, 4.0]).unwrap();
//! assert_eq!(inflow.evaluate(5.0).unwrap(), vec![3.0]);
//! ```

pub mod document;
pub mod error;
pub mod grid;
pub mod interpolation;

pub use document::{VectorDocument, VectorEntry};
pub use error::{TransflowError, TransflowResult};
pub use grid::{GridSpec, EPSILON};
pub use interpolation::{
    Interpolating, InterpolatingMut, InterpolatingVector, InterpolatingView, InterpolatingViewMut,
};
