//! Sparse derivative matrices with a fixed nonzero pattern.
//!
//! Problems write partial derivatives through the [`MatrixFiller`]
//! capability without knowing whether the matrix is being assembled for the
//! first time or refilled.
//!
//! - The first [`PatternMatrix::fill`] collects triplets (duplicates are
//!   summed) and compresses them to CSR with `sprs`. Explicit zeros stay in
//!   the pattern.
//! - Every later fill zeroes the stored values and writes into the existing
//!   pattern. A nonzero written outside the pattern is reported as
//!   [`OptimError::PatternMismatch`]; an exact zero is dropped.
//!
//! `set_coefficient` overwrites on refill but sums on first assembly, so a
//! problem should set each entry at most once per fill.

use std::collections::HashMap;

use faer::Mat;
use sprs::{CsMat, TriMat};

use crate::error::{OptimError, OptimResult};

/// Write access to a derivative matrix.
pub trait MatrixFiller {
    fn add_to_coefficient(&mut self, row: usize, column: usize, value: f64);
    fn set_coefficient(&mut self, row: usize, column: usize, value: f64);
}

struct TripletFiller {
    triplets: TriMat<f64>,
    rows: usize,
    columns: usize,
    error: Option<OptimError>,
}

impl TripletFiller {
    fn push(&mut self, row: usize, column: usize, value: f64) {
        if row >= self.rows || column >= self.columns {
            self.error.get_or_insert(OptimError::EntryOutOfBounds {
                row,
                column,
                rows: self.rows,
                columns: self.columns,
            });
            return;
        }
        self.triplets.add_triplet(row, column, value);
    }
}

impl MatrixFiller for TripletFiller {
    fn add_to_coefficient(&mut self, row: usize, column: usize, value: f64) {
        self.push(row, column, value);
    }

    fn set_coefficient(&mut self, row: usize, column: usize, value: f64) {
        self.push(row, column, value);
    }
}

struct CoefficientFiller<'a> {
    positions: &'a HashMap<(usize, usize), usize>,
    data: &'a mut [f64],
    rows: usize,
    columns: usize,
    error: Option<OptimError>,
}

impl CoefficientFiller<'_> {
    fn position(&mut self, row: usize, column: usize, value: f64) -> Option<usize> {
        if row >= self.rows || column >= self.columns {
            self.error.get_or_insert(OptimError::EntryOutOfBounds {
                row,
                column,
                rows: self.rows,
                columns: self.columns,
            });
            return None;
        }
        match self.positions.get(&(row, column)) {
            Some(&index) => Some(index),
            None => {
                if value != 0.0 {
                    self.error
                        .get_or_insert(OptimError::PatternMismatch { row, column });
                }
                None
            }
        }
    }
}

impl MatrixFiller for CoefficientFiller<'_> {
    fn add_to_coefficient(&mut self, row: usize, column: usize, value: f64) {
        if let Some(index) = self.position(row, column, value) {
            self.data[index] += value;
        }
    }

    fn set_coefficient(&mut self, row: usize, column: usize, value: f64) {
        if let Some(index) = self.position(row, column, value) {
            self.data[index] = value;
        }
    }
}

/// CSR matrix whose pattern is fixed by its first fill.
#[derive(Debug, Clone)]
pub struct PatternMatrix {
    rows: usize,
    columns: usize,
    matrix: Option<CsMat<f64>>,
    positions: HashMap<(usize, usize), usize>,
}

impl PatternMatrix {
    pub fn new(rows: usize, columns: usize) -> Self {
        Self {
            rows,
            columns,
            matrix: None,
            positions: HashMap::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Runs `write` against the matrix, assembling it on first use.
    pub fn fill<F>(&mut self, write: F) -> OptimResult<()>
    where
        F: FnOnce(&mut dyn MatrixFiller),
    {
        if let Some(matrix) = self.matrix.as_mut() {
            let data = matrix.data_mut();
            data.fill(0.0);
            let mut filler = CoefficientFiller {
                positions: &self.positions,
                data,
                rows: self.rows,
                columns: self.columns,
                error: None,
            };
            write(&mut filler);
            return match filler.error {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }

        let mut filler = TripletFiller {
            triplets: TriMat::new((self.rows, self.columns)),
            rows: self.rows,
            columns: self.columns,
            error: None,
        };
        write(&mut filler);
        if let Some(err) = filler.error {
            return Err(err);
        }
        let matrix: CsMat<f64> = filler.triplets.to_csr();
        self.positions = matrix
            .iter()
            .enumerate()
            .map(|(index, (_, (row, column)))| ((row, column), index))
            .collect();
        self.matrix = Some(matrix);
        Ok(())
    }

    /// Stored entries as `(row, column, value)`.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.matrix
            .iter()
            .flat_map(|m| m.iter().map(|(&value, (row, column))| (row, column, value)))
    }

    /// `out += alpha * Aᵀ x`.
    pub fn transpose_mul_add(&self, x: &[f64], alpha: f64, out: &mut [f64]) {
        for (row, column, value) in self.entries() {
            out[column] += alpha * value * x[row];
        }
    }

    /// Dense copy for factorization with `faer`.
    pub fn to_dense(&self) -> Mat<f64> {
        let mut dense = Mat::zeros(self.rows, self.columns);
        for (row, column, value) in self.entries() {
            dense.write(row, column, value);
        }
        dense
    }
}
