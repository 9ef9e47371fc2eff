//! Piecewise-linear interpolating vectors.
//!
//! An interpolating vector stores one inner vector of fixed length per grid
//! node, in a single flat buffer laid out node after node. Between nodes the
//! value is the linear interpolation of the two bracketing inner vectors;
//! slightly outside the grid (within [`EPSILON`](crate::grid::EPSILON)) the
//! boundary node is returned.
//!
//! Three storage flavours share the algorithm:
//!
//! - [`InterpolatingVector`] owns its points and values.
//! - [`InterpolatingView`] borrows both immutably, e.g. the flat control
//!   vector handed over by an NLP solver.
//! - [`InterpolatingViewMut`] borrows the values mutably and can be rebound
//!   to another buffer of the same length.
//!
//! The interpolation itself lives once, in the provided methods of
//! [`Interpolating`] and [`InterpolatingMut`].

use crate::error::{TransflowError, TransflowResult};
use crate::grid::{self, GridSpec};

/// Read access to an interpolating vector's grid and flat value buffer.
pub trait Interpolating {
    fn points(&self) -> &[f64];
    fn inner_length(&self) -> usize;
    fn values(&self) -> &[f64];

    /// Number of interpolation points.
    fn size(&self) -> usize {
        self.points().len()
    }

    fn first_point(&self) -> Option<f64> {
        self.points().first().copied()
    }

    fn last_point(&self) -> Option<f64> {
        self.points().last().copied()
    }

    /// Borrows the data as a read-only view.
    fn as_view(&self) -> InterpolatingView<'_> {
        InterpolatingView {
            points: self.points(),
            inner_length: self.inner_length(),
            values: self.values(),
        }
    }

    /// Stored inner vector of node `index`.
    fn vector_at_index(&self, index: usize) -> TransflowResult<&[f64]> {
        let len = self.size();
        if index >= len {
            return Err(TransflowError::Index { index, len });
        }
        let inner = self.inner_length();
        Ok(&self.values()[index * inner..(index + 1) * inner])
    }

    /// Interpolated value at `time`, written into `out`.
    fn evaluate_into(&self, time: f64, out: &mut [f64]) -> TransflowResult<()> {
        let inner = self.inner_length();
        if out.len() != inner {
            return Err(TransflowError::IncompatibleStructure(format!(
                "output has length {}, inner length is {}",
                out.len(),
                inner
            )));
        }
        let (upper, lambda) = grid::locate(self.points(), time)?;
        let values = self.values();
        let next = &values[upper * inner..(upper + 1) * inner];
        if lambda == 1.0 {
            out.copy_from_slice(next);
            return Ok(());
        }
        let previous = &values[(upper - 1) * inner..upper * inner];
        for ((o, &p), &n) in out.iter_mut().zip(previous).zip(next) {
            *o = (1.0 - lambda) * p + lambda * n;
        }
        Ok(())
    }

    /// Interpolated value at `time`.
    fn evaluate(&self, time: f64) -> TransflowResult<Vec<f64>> {
        let mut out = vec![0.0; self.inner_length()];
        self.evaluate_into(time, &mut out)?;
        Ok(out)
    }

    /// Same inner length and identical interpolation points.
    fn same_structure<O: Interpolating + ?Sized>(&self, other: &O) -> bool {
        self.inner_length() == other.inner_length() && self.points() == other.points()
    }

    /// Same structure and exactly equal values.
    fn is_identical_to<O: Interpolating + ?Sized>(&self, other: &O) -> bool {
        self.same_structure(other) && self.values() == other.values()
    }
}

/// Write access on top of [`Interpolating`].
pub trait InterpolatingMut: Interpolating {
    fn values_mut(&mut self) -> &mut [f64];

    /// Mutable inner vector of node `index`.
    fn mut_timestep(&mut self, index: usize) -> TransflowResult<&mut [f64]> {
        let len = self.size();
        if index >= len {
            return Err(TransflowError::Index { index, len });
        }
        let inner = self.inner_length();
        Ok(&mut self.values_mut()[index * inner..(index + 1) * inner])
    }

    /// Replaces the whole value buffer.
    fn set_values_in_bulk(&mut self, values: &[f64]) -> TransflowResult<()> {
        let target = self.values_mut();
        if target.len() != values.len() {
            return Err(TransflowError::IncompatibleStructure(format!(
                "expected {} values, got {}",
                target.len(),
                values.len()
            )));
        }
        target.copy_from_slice(values);
        Ok(())
    }

    fn set_zero(&mut self) {
        self.values_mut().fill(0.0);
    }

    /// Copies the values of a vector with the same structure.
    fn assign_from<O: Interpolating + ?Sized>(&mut self, other: &O) -> TransflowResult<()> {
        if !self.same_structure(other) {
            return Err(TransflowError::IncompatibleStructure(format!(
                "cannot assign a vector with inner length {} on {} points to one with inner length {} on {} points",
                other.inner_length(),
                other.size(),
                self.inner_length(),
                self.size()
            )));
        }
        self.values_mut().copy_from_slice(other.values());
        Ok(())
    }

    /// Samples `other` at every own interpolation point.
    ///
    /// `other` must cover this grid's span up to the tolerance.
    fn interpolate_from<O: Interpolating + ?Sized>(&mut self, other: &O) -> TransflowResult<()> {
        let inner = self.inner_length();
        if other.inner_length() != inner {
            return Err(TransflowError::IncompatibleStructure(format!(
                "cannot interpolate inner length {} from inner length {}",
                inner,
                other.inner_length()
            )));
        }
        let points = self.points().to_vec();
        let values = self.values_mut();
        for (index, &time) in points.iter().enumerate() {
            other.evaluate_into(time, &mut values[index * inner..(index + 1) * inner])?;
        }
        Ok(())
    }
}

/// Interpolating vector owning its grid and values.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolatingVector {
    points: Vec<f64>,
    inner_length: usize,
    values: Vec<f64>,
}

impl InterpolatingVector {
    /// Zero-initialised vector on `points`.
    pub fn new(points: Vec<f64>, inner_length: usize) -> TransflowResult<Self> {
        grid::validate_points(&points)?;
        let values = vec![0.0; points.len() * inner_length];
        Ok(Self {
            points,
            inner_length,
            values,
        })
    }

    pub fn with_values(points: Vec<f64>, inner_length: usize, values: Vec<f64>) -> TransflowResult<Self> {
        grid::validate_points(&points)?;
        check_buffer_length(points.len(), inner_length, values.len())?;
        Ok(Self {
            points,
            inner_length,
            values,
        })
    }

    /// Zero-initialised vector on the points of `grid`.
    pub fn from_grid_spec(grid: &GridSpec, inner_length: usize) -> TransflowResult<Self> {
        Self::new(grid.points()?, inner_length)
    }

    /// New vector on `points` holding `other` resampled onto it.
    pub fn construct_and_interpolate_from<O: Interpolating + ?Sized>(
        points: Vec<f64>,
        inner_length: usize,
        other: &O,
    ) -> TransflowResult<Self> {
        let mut vector = Self::new(points, inner_length)?;
        vector.interpolate_from(other)?;
        Ok(vector)
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }
}

impl Interpolating for InterpolatingVector {
    fn points(&self) -> &[f64] {
        &self.points
    }

    fn inner_length(&self) -> usize {
        self.inner_length
    }

    fn values(&self) -> &[f64] {
        &self.values
    }
}

impl InterpolatingMut for InterpolatingVector {
    fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
}

/// Read-only view over borrowed points and values.
#[derive(Debug, Clone, Copy)]
pub struct InterpolatingView<'a> {
    points: &'a [f64],
    inner_length: usize,
    values: &'a [f64],
}

impl<'a> InterpolatingView<'a> {
    /// The points are trusted to be strictly increasing; only the buffer
    /// length is checked.
    pub fn new(points: &'a [f64], inner_length: usize, values: &'a [f64]) -> TransflowResult<Self> {
        check_buffer_length(points.len(), inner_length, values.len())?;
        Ok(Self {
            points,
            inner_length,
            values,
        })
    }

    pub fn to_owned_vector(&self) -> InterpolatingVector {
        InterpolatingVector {
            points: self.points.to_vec(),
            inner_length: self.inner_length,
            values: self.values.to_vec(),
        }
    }
}

impl Interpolating for InterpolatingView<'_> {
    fn points(&self) -> &[f64] {
        self.points
    }

    fn inner_length(&self) -> usize {
        self.inner_length
    }

    fn values(&self) -> &[f64] {
        self.values
    }
}

/// Mutable view over a borrowed value buffer.
#[derive(Debug)]
pub struct InterpolatingViewMut<'a> {
    points: &'a [f64],
    inner_length: usize,
    values: &'a mut [f64],
}

impl<'a> InterpolatingViewMut<'a> {
    pub fn new(points: &'a [f64], inner_length: usize, values: &'a mut [f64]) -> TransflowResult<Self> {
        check_buffer_length(points.len(), inner_length, values.len())?;
        Ok(Self {
            points,
            inner_length,
            values,
        })
    }

    /// Points the view at another buffer of identical length.
    pub fn rebind(&mut self, values: &'a mut [f64]) -> TransflowResult<()> {
        if values.len() != self.values.len() {
            return Err(TransflowError::IncompatibleStructure(format!(
                "cannot rebind a view of {} values to a buffer of {} values",
                self.values.len(),
                values.len()
            )));
        }
        self.values = values;
        Ok(())
    }
}

impl Interpolating for InterpolatingViewMut<'_> {
    fn points(&self) -> &[f64] {
        self.points
    }

    fn inner_length(&self) -> usize {
        self.inner_length
    }

    fn values(&self) -> &[f64] {
        self.values
    }
}

impl InterpolatingMut for InterpolatingViewMut<'_> {
    fn values_mut(&mut self) -> &mut [f64] {
        &mut *self.values
    }
}

fn check_buffer_length(number_of_points: usize, inner_length: usize, len: usize) -> TransflowResult<()> {
    let expected = number_of_points * inner_length;
    if expected != len {
        return Err(TransflowError::IncompatibleStructure(format!(
            "{} points with inner length {} need {} values, got {}",
            number_of_points, inner_length, expected, len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::EPSILON;

    fn sample() -> InterpolatingVector {
        InterpolatingVector::with_values(
            vec![0.0, 1.0, 3.0],
            2,
            vec![1.0, -1.0, 3.0, 0.5, -2.0, 4.0],
        )
        .unwrap()
    }

    #[test]
    fn test_exact_at_nodes() {
        let v = sample();
        for (i, &t) in v.points().iter().enumerate() {
            assert_eq!(v.evaluate(t).unwrap(), v.vector_at_index(i).unwrap());
        }
    }

    #[test]
    fn test_linear_between_nodes() {
        let v = sample();
        for &lambda in &[0.0, 0.1, 0.25, 0.5, 0.9, 1.0] {
            let t = 1.0 + lambda * 2.0;
            let value = v.evaluate(t).unwrap();
            let prev = v.vector_at_index(1).unwrap();
            let next = v.vector_at_index(2).unwrap();
            for k in 0..2 {
                let expected = (1.0 - lambda) * prev[k] + lambda * next[k];
                assert!(
                    (value[k] - expected).abs() < 1e-14,
                    "lambda {lambda}, component {k}: {} vs {expected}",
                    value[k]
                );
            }
        }
    }

    #[test]
    fn test_boundary_clamp() {
        let v = sample();
        assert_eq!(v.evaluate(-0.5 * EPSILON).unwrap(), vec![1.0, -1.0]);
        assert_eq!(v.evaluate(3.0 + 0.5 * EPSILON).unwrap(), vec![-2.0, 4.0]);
        assert!(matches!(
            v.evaluate(-2.0 * EPSILON),
            Err(TransflowError::OutOfRange { .. })
        ));
        assert!(v.evaluate(3.0 + 2.0 * EPSILON).is_err());
    }

    #[test]
    fn test_single_point_grid() {
        let v = InterpolatingVector::with_values(vec![2.0], 1, vec![7.0]).unwrap();
        assert_eq!(v.evaluate(2.0).unwrap(), vec![7.0]);
        assert!(v.evaluate(2.5).is_err());
    }

    #[test]
    fn test_construction_checks() {
        assert!(InterpolatingVector::new(vec![0.0, 0.0], 1).is_err());
        assert!(InterpolatingVector::with_values(vec![0.0, 1.0], 2, vec![0.0; 3]).is_err());
        let v = InterpolatingVector::new(vec![0.0, 1.0], 0).unwrap();
        assert!(v.values().is_empty());
        assert!(v.vector_at_index(1).unwrap().is_empty());
    }

    #[test]
    fn test_index_errors() {
        let mut v = sample();
        assert!(matches!(
            v.vector_at_index(3),
            Err(TransflowError::Index { index: 3, len: 3 })
        ));
        assert!(v.mut_timestep(3).is_err());
        v.mut_timestep(2).unwrap()[1] = 10.0;
        assert_eq!(v.vector_at_index(2).unwrap(), &[-2.0, 10.0]);
    }

    #[test]
    fn test_bulk_and_zero() {
        let mut v = sample();
        assert!(v.set_values_in_bulk(&[1.0; 5]).is_err());
        v.set_values_in_bulk(&[2.0; 6]).unwrap();
        assert_eq!(v.values(), &[2.0; 6]);
        v.set_zero();
        assert_eq!(v.values(), &[0.0; 6]);
    }

    #[test]
    fn test_assignment_requires_same_structure() {
        let source = sample();
        let mut target = InterpolatingVector::new(vec![0.0, 1.0, 3.0], 2).unwrap();
        target.assign_from(&source).unwrap();
        assert_eq!(target, source);

        let mut other_grid = InterpolatingVector::new(vec![0.0, 1.0, 2.0], 2).unwrap();
        assert!(matches!(
            other_grid.assign_from(&source),
            Err(TransflowError::IncompatibleStructure(_))
        ));
    }

    #[test]
    fn test_equality_and_structure() {
        let a = sample();
        let mut b = sample();
        assert!(a.is_identical_to(&b));
        b.mut_timestep(0).unwrap()[0] = 1.5;
        assert!(a.same_structure(&b));
        assert!(!a.is_identical_to(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_interpolate_from_coarser_grid() {
        let coarse = InterpolatingVector::with_values(vec![0.0, 4.0], 1, vec![0.0, 8.0]).unwrap();
        let fine =
            InterpolatingVector::construct_and_interpolate_from(vec![0.0, 1.0, 2.0, 4.0], 1, &coarse)
                .unwrap();
        assert_eq!(fine.values(), &[0.0, 2.0, 4.0, 8.0]);

        let too_wide = InterpolatingVector::new(vec![0.0, 5.0], 1).unwrap();
        let mut target = too_wide.clone();
        assert!(target.interpolate_from(&coarse).is_err());
    }

    #[test]
    fn test_views_share_semantics() {
        let owned = sample();
        let points = owned.points().to_vec();
        let values = owned.values().to_vec();
        let view = InterpolatingView::new(&points, 2, &values).unwrap();
        assert_eq!(view.evaluate(2.0).unwrap(), owned.evaluate(2.0).unwrap());
        assert!(view.is_identical_to(&owned));
        assert_eq!(view.to_owned_vector(), owned);
        assert!(InterpolatingView::new(&points, 2, &values[..4]).is_err());
    }

    #[test]
    fn test_mutable_view_rebind() {
        let points = [0.0, 1.0];
        let mut first = [1.0, 2.0];
        let mut second = [3.0, 4.0];
        let mut wrong = [0.0; 3];
        {
            let mut view = InterpolatingViewMut::new(&points, 1, &mut first).unwrap();
            view.mut_timestep(0).unwrap()[0] = 5.0;
            assert!(view.rebind(&mut wrong).is_err());
            view.rebind(&mut second).unwrap();
            view.set_zero();
        }
        assert_eq!(first, [5.0, 2.0]);
        assert_eq!(second, [0.0, 0.0]);
    }
}
