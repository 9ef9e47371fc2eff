//! LU factorization of timestep derivatives.
//!
//! Wraps `faer`'s partial-pivoting LU. One factorization serves both
//! `A x = b` (Newton steps) and `Aᵀ x = b` (adjoint sweep).

use std::fmt;

use faer::{prelude::*, solvers::PartialPivLu, Mat};

use crate::error::{OptimError, OptimResult};
use crate::matrix::PatternMatrix;

/// Pivots smaller than this are treated as zero.
const PIVOT_TOLERANCE: f64 = 1e-14;

pub struct LuFactorization {
    n: usize,
    lu: Option<PartialPivLu<f64>>,
}

impl fmt::Debug for LuFactorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuFactorization")
            .field("n", &self.n)
            .field("factored", &self.lu.is_some())
            .finish()
    }
}

impl LuFactorization {
    pub fn new(n: usize) -> Self {
        Self { n, lu: None }
    }

    /// Factors a square pattern matrix of this dimension.
    ///
    /// A pivot below `1e-14` in magnitude (or NaN) is reported as
    /// [`OptimError::SingularMatrix`] and leaves no usable factors behind.
    pub fn factorize(&mut self, matrix: &PatternMatrix) -> OptimResult<()> {
        if matrix.rows() != self.n || matrix.columns() != self.n {
            return Err(OptimError::DimensionMismatch {
                what: "LU factorization",
                expected: self.n,
                got: if matrix.rows() != self.n {
                    matrix.rows()
                } else {
                    matrix.columns()
                },
            });
        }
        self.lu = None;
        let dense = matrix.to_dense();
        let lu = PartialPivLu::new(dense.as_ref());

        let u = lu.compute_u();
        if let Some(column) = (0..self.n).find(|&k| !(u.read(k, k).abs() >= PIVOT_TOLERANCE)) {
            return Err(OptimError::SingularMatrix { column });
        }
        self.lu = Some(lu);
        Ok(())
    }

    fn factors(&self, b: &[f64]) -> OptimResult<Option<&PartialPivLu<f64>>> {
        if b.len() != self.n {
            return Err(OptimError::DimensionMismatch {
                what: "right-hand side",
                expected: self.n,
                got: b.len(),
            });
        }
        if self.n == 0 {
            return Ok(None);
        }
        match &self.lu {
            Some(lu) => Ok(Some(lu)),
            None => Err(OptimError::SingularMatrix { column: 0 }),
        }
    }

    /// Solves `A x = b` in place.
    pub fn solve(&self, b: &mut [f64]) -> OptimResult<()> {
        if let Some(lu) = self.factors(b)? {
            let rhs = Mat::from_fn(self.n, 1, |i, _| b[i]);
            let solution = lu.solve(&rhs);
            copy_column(&solution, b);
        }
        Ok(())
    }

    /// Solves `Aᵀ x = b` in place.
    pub fn solve_transposed(&self, b: &mut [f64]) -> OptimResult<()> {
        if let Some(lu) = self.factors(b)? {
            let rhs = Mat::from_fn(self.n, 1, |i, _| b[i]);
            let solution = lu.solve_transpose(&rhs);
            copy_column(&solution, b);
        }
        Ok(())
    }
}

fn copy_column(solution: &Mat<f64>, b: &mut [f64]) {
    for (i, value) in b.iter_mut().enumerate() {
        *value = solution.read(i, 0);
    }
}
