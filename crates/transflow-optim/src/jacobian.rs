//! Block-staircase constraint Jacobian.
//!
//! Rows are blocked by constraint time (block height = constraints per time),
//! columns by control time (block width = controls per time). A constraint
//! only depends on controls up to its own time, plus the control node right
//! after it through linear interpolation, so column block `j` is nonzero only
//! from the first constraint time after control time `j - 1` downwards:
//!
//! ```text
//!   controls:  0   1   2
//!   t=0.0    [ X ]
//!   t=0.5    [ X   X ]
//!   t=1.0    [ X   X ]
//!   t=2.0    [ X   X   X ]
//! ```
//!
//! The whole pattern is one array of per-column outer row offsets. Values are
//! stored column block after column block, each block dense and row-major.
//! [`JacobianStorage::supply_indices`] emits the index pairs in exactly that
//! order, which is the layout NLP solvers receive values in.

use transflow_core::grid;

use crate::error::{OptimError, OptimResult};

/// Sparsity pattern of a block-staircase Jacobian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JacobianStructure {
    block_height: usize,
    block_width: usize,
    /// Outer row at which each column block starts; the trailing entry is
    /// the number of outer rows.
    block_column_offsets: Vec<usize>,
    /// Start of each column block in the value buffer, plus the total.
    value_offsets: Vec<usize>,
}

impl JacobianStructure {
    /// Derives the staircase from the constraint and control grids in one
    /// merge pass.
    pub fn new(
        block_height: usize,
        block_width: usize,
        constraint_timepoints: &[f64],
        control_timepoints: &[f64],
    ) -> OptimResult<Self> {
        grid::validate_points(control_timepoints)?;
        if !constraint_timepoints.is_empty() {
            grid::validate_points(constraint_timepoints)?;
        }
        let outer_rows = constraint_timepoints.len();
        let mut offsets = Vec::with_capacity(control_timepoints.len() + 1);
        let mut row = 0;
        offsets.push(0);
        for &previous_control in &control_timepoints[..control_timepoints.len() - 1] {
            while row < outer_rows && constraint_timepoints[row] <= previous_control {
                row += 1;
            }
            offsets.push(row);
        }
        offsets.push(outer_rows);
        Self::from_offsets(block_height, block_width, offsets)
    }

    /// Structure from explicit offsets (`number of columns + 1` entries).
    pub fn from_offsets(
        block_height: usize,
        block_width: usize,
        block_column_offsets: Vec<usize>,
    ) -> OptimResult<Self> {
        if block_column_offsets.len() < 2 {
            return Err(OptimError::IncompatibleStructure(
                "a Jacobian needs at least one column block".to_string(),
            ));
        }
        if block_column_offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(OptimError::IncompatibleStructure(format!(
                "column offsets must be non-decreasing: {block_column_offsets:?}"
            )));
        }
        let outer_rows = block_column_offsets[block_column_offsets.len() - 1];
        let block_size = block_height * block_width;
        let mut value_offsets = Vec::with_capacity(block_column_offsets.len());
        let mut total = 0;
        value_offsets.push(0);
        for &start in &block_column_offsets[..block_column_offsets.len() - 1] {
            total += (outer_rows - start) * block_size;
            value_offsets.push(total);
        }
        Ok(Self {
            block_height,
            block_width,
            block_column_offsets,
            value_offsets,
        })
    }

    pub fn block_height(&self) -> usize {
        self.block_height
    }

    pub fn block_width(&self) -> usize {
        self.block_width
    }

    pub fn block_column_offsets(&self) -> &[usize] {
        &self.block_column_offsets
    }

    pub fn number_of_block_columns(&self) -> usize {
        self.block_column_offsets.len() - 1
    }

    pub fn number_of_block_rows(&self) -> usize {
        self.block_column_offsets[self.number_of_block_columns()]
    }

    pub fn rows(&self) -> usize {
        self.number_of_block_rows() * self.block_height
    }

    pub fn columns(&self) -> usize {
        self.number_of_block_columns() * self.block_width
    }

    pub fn nonzeros(&self) -> usize {
        self.value_offsets[self.number_of_block_columns()]
    }

    /// First outer row (constraint time index) of column block `column`.
    pub fn outer_row_start(&self, column: usize) -> usize {
        self.block_column_offsets[column]
    }

    /// Number of scalar rows stored for column block `column`.
    pub fn column_block_rows(&self, column: usize) -> usize {
        (self.number_of_block_rows() - self.block_column_offsets[column]) * self.block_height
    }

    fn check_column(&self, column: usize) -> OptimResult<()> {
        if column >= self.number_of_block_columns() {
            return Err(OptimError::DimensionMismatch {
                what: "column block index",
                expected: self.number_of_block_columns(),
                got: column,
            });
        }
        Ok(())
    }
}

/// Dense read-only view of one column block.
#[derive(Debug, Clone, Copy)]
pub struct ColumnBlock<'a> {
    /// Scalar row of the block's first row in the whole matrix.
    pub first_row: usize,
    pub rows: usize,
    pub columns: usize,
    data: &'a [f64],
}

impl ColumnBlock<'_> {
    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.data[row * self.columns + column]
    }

    pub fn as_slice(&self) -> &[f64] {
        self.data
    }
}

/// Dense mutable view of one column block.
#[derive(Debug)]
pub struct ColumnBlockMut<'a> {
    pub first_row: usize,
    pub rows: usize,
    pub columns: usize,
    data: &'a mut [f64],
}

impl ColumnBlockMut<'_> {
    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.data[row * self.columns + column]
    }

    pub fn set(&mut self, row: usize, column: usize, value: f64) {
        self.data[row * self.columns + column] = value;
    }

    /// Mutable row `row` of the block.
    pub fn row_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.data[row * self.columns..(row + 1) * self.columns]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut *self.data
    }
}

/// Shared behaviour of owning and mapped Jacobians.
pub trait JacobianStorage {
    fn structure(&self) -> &JacobianStructure;
    fn values(&self) -> &[f64];
    fn values_mut(&mut self) -> &mut [f64];

    fn nonzeros(&self) -> usize {
        self.structure().nonzeros()
    }

    fn set_zero(&mut self) {
        self.values_mut().fill(0.0);
    }

    fn get_column_block(&self, column: usize) -> OptimResult<ColumnBlock<'_>> {
        let structure = self.structure();
        structure.check_column(column)?;
        let start = structure.value_offsets[column];
        let end = structure.value_offsets[column + 1];
        Ok(ColumnBlock {
            first_row: structure.outer_row_start(column) * structure.block_height,
            rows: structure.column_block_rows(column),
            columns: structure.block_width,
            data: &self.values()[start..end],
        })
    }

    fn get_column_block_mut(&mut self, column: usize) -> OptimResult<ColumnBlockMut<'_>> {
        let structure = self.structure();
        structure.check_column(column)?;
        let start = structure.value_offsets[column];
        let end = structure.value_offsets[column + 1];
        let first_row = structure.outer_row_start(column) * structure.block_height;
        let rows = structure.column_block_rows(column);
        let columns = structure.block_width;
        Ok(ColumnBlockMut {
            first_row,
            rows,
            columns,
            data: &mut self.values_mut()[start..end],
        })
    }

    /// Dense copy of the whole matrix, row by row.
    fn whole_matrix(&self) -> Vec<Vec<f64>> {
        let structure = self.structure();
        let mut dense = vec![vec![0.0; structure.columns()]; structure.rows()];
        for column in 0..structure.number_of_block_columns() {
            let first_row = structure.outer_row_start(column) * structure.block_height;
            let start = structure.value_offsets[column];
            for row in 0..structure.column_block_rows(column) {
                for inner in 0..structure.block_width {
                    dense[first_row + row][column * structure.block_width + inner] =
                        self.values()[start + row * structure.block_width + inner];
                }
            }
        }
        dense
    }

    /// Writes the `(row, column)` pair of every stored value, in storage
    /// order.
    fn supply_indices(&self, rows: &mut [usize], columns: &mut [usize]) -> OptimResult<()> {
        let structure = self.structure();
        let nonzeros = structure.nonzeros();
        for len in [rows.len(), columns.len()] {
            if len != nonzeros {
                return Err(OptimError::DimensionMismatch {
                    what: "Jacobian index buffer",
                    expected: nonzeros,
                    got: len,
                });
            }
        }
        let mut position = 0;
        for column in 0..structure.number_of_block_columns() {
            let first_row = structure.outer_row_start(column) * structure.block_height;
            for row in 0..structure.column_block_rows(column) {
                for inner in 0..structure.block_width {
                    rows[position] = first_row + row;
                    columns[position] = column * structure.block_width + inner;
                    position += 1;
                }
            }
        }
        Ok(())
    }

    /// Copies values from a Jacobian with an identical structure.
    fn assign_from<O: JacobianStorage + ?Sized>(&mut self, other: &O) -> OptimResult<()> {
        if self.structure() != other.structure() {
            return Err(OptimError::IncompatibleStructure(format!(
                "cannot assign a {}x{} Jacobian with offsets {:?} to a {}x{} Jacobian with offsets {:?}",
                other.structure().block_height,
                other.structure().block_width,
                other.structure().block_column_offsets,
                self.structure().block_height,
                self.structure().block_width,
                self.structure().block_column_offsets,
            )));
        }
        self.values_mut().copy_from_slice(other.values());
        Ok(())
    }
}

/// Jacobian owning its values.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintJacobian {
    structure: JacobianStructure,
    values: Vec<f64>,
}

impl ConstraintJacobian {
    pub fn new(structure: JacobianStructure) -> Self {
        let values = vec![0.0; structure.nonzeros()];
        Self { structure, values }
    }

    pub fn from_timepoints(
        block_height: usize,
        block_width: usize,
        constraint_timepoints: &[f64],
        control_timepoints: &[f64],
    ) -> OptimResult<Self> {
        Ok(Self::new(JacobianStructure::new(
            block_height,
            block_width,
            constraint_timepoints,
            control_timepoints,
        )?))
    }
}

impl JacobianStorage for ConstraintJacobian {
    fn structure(&self) -> &JacobianStructure {
        &self.structure
    }

    fn values(&self) -> &[f64] {
        &self.values
    }

    fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
}

/// Jacobian writing into a borrowed buffer, typically the NLP solver's.
#[derive(Debug)]
pub struct MappedConstraintJacobian<'a> {
    structure: JacobianStructure,
    values: &'a mut [f64],
}

impl<'a> MappedConstraintJacobian<'a> {
    pub fn new(structure: JacobianStructure, values: &'a mut [f64]) -> OptimResult<Self> {
        if values.len() != structure.nonzeros() {
            return Err(OptimError::IncompatibleStructure(format!(
                "Jacobian with {} nonzeros cannot map a buffer of {} values",
                structure.nonzeros(),
                values.len()
            )));
        }
        Ok(Self { structure, values })
    }

    /// Points the Jacobian at another buffer of identical length.
    pub fn replace_storage(&mut self, values: &'a mut [f64]) -> OptimResult<()> {
        if values.len() != self.values.len() {
            return Err(OptimError::IncompatibleStructure(format!(
                "cannot rebind a Jacobian of {} values to a buffer of {} values",
                self.values.len(),
                values.len()
            )));
        }
        self.values = values;
        Ok(())
    }
}

impl JacobianStorage for MappedConstraintJacobian<'_> {
    fn structure(&self) -> &JacobianStructure {
        &self.structure
    }

    fn values(&self) -> &[f64] {
        self.values
    }

    fn values_mut(&mut self) -> &mut [f64] {
        &mut *self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(structure: JacobianStructure) -> ConstraintJacobian {
        let mut jacobian = ConstraintJacobian::new(structure);
        for (i, value) in jacobian.values_mut().iter_mut().enumerate() {
            *value = (i + 1) as f64;
        }
        jacobian
    }

    #[test]
    fn test_offsets_for_regular_grids() {
        let structure = JacobianStructure::new(2, 3, &[0.0, 0.5, 1.0, 2.0], &[0.0, 1.0, 2.0]).unwrap();
        assert_eq!(structure.block_column_offsets(), &[0, 1, 3, 4]);
        assert_eq!(structure.outer_row_start(1) * 2, 2);
        assert_eq!(structure.outer_row_start(2) * 2, 6);
        assert_eq!(structure.rows(), 8);
        assert_eq!(structure.columns(), 9);
        // (4 + 3 + 1) block rows of 2x3 entries
        assert_eq!(structure.nonzeros(), 48);
    }

    #[test]
    fn test_nonzeros_match_dense_construction() {
        let mut jacobian = ConstraintJacobian::from_timepoints(2, 3, &[0.0, 0.5, 1.0, 2.0], &[0.0, 1.0, 2.0]).unwrap();
        jacobian.values_mut().fill(1.0);
        let dense = jacobian.whole_matrix();
        let counted: usize = dense
            .iter()
            .map(|row| row.iter().filter(|&&v| v != 0.0).count())
            .sum();
        assert_eq!(counted, jacobian.nonzeros());
        // The first two rows only see control column block 0.
        assert_eq!(dense[0], vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(dense[7], vec![1.0; 9]);
    }

    #[test]
    fn test_control_grid_extending_past_constraints() {
        let structure =
            JacobianStructure::new(1, 1, &[0.0, 0.5, 0.6, 1.0, 2.0], &[-1.0, 0.0, 1.0, 2.0, 3.0])
                .unwrap();
        assert_eq!(structure.block_column_offsets(), &[0, 0, 1, 4, 5, 5]);
        assert_eq!(structure.column_block_rows(4), 0);
        assert_eq!(structure.nonzeros(), 5 + 5 + 4 + 1);
    }

    #[test]
    fn test_column_blocks_are_row_major() {
        let jacobian = numbered(JacobianStructure::new(2, 2, &[1.0, 2.0], &[1.0, 2.0]).unwrap());
        let block = jacobian.get_column_block(0).unwrap();
        assert_eq!((block.first_row, block.rows, block.columns), (0, 4, 2));
        assert_eq!(block.get(0, 1), 2.0);
        assert_eq!(block.get(1, 0), 3.0);

        let block = jacobian.get_column_block(1).unwrap();
        assert_eq!((block.first_row, block.rows), (2, 2));
        assert_eq!(block.as_slice(), &[9.0, 10.0, 11.0, 12.0]);
        assert!(jacobian.get_column_block(2).is_err());

        let dense = jacobian.whole_matrix();
        assert_eq!(dense[2], vec![5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn test_indices_follow_value_layout() {
        let jacobian = numbered(JacobianStructure::new(2, 3, &[0.0, 0.5, 1.0, 2.0], &[0.0, 1.0, 2.0]).unwrap());
        let nnz = jacobian.nonzeros();
        let mut rows = vec![0; nnz];
        let mut columns = vec![0; nnz];
        jacobian.supply_indices(&mut rows, &mut columns).unwrap();
        let dense = jacobian.whole_matrix();
        for (k, value) in jacobian.values().iter().enumerate() {
            assert_eq!(dense[rows[k]][columns[k]], *value, "entry {k}");
        }
        // Column-major over blocks, row-major inside a block.
        assert_eq!((rows[0], columns[0]), (0, 0));
        assert_eq!((rows[1], columns[1]), (0, 1));
        assert_eq!((rows[3], columns[3]), (1, 0));
        assert_eq!((rows[24], columns[24]), (2, 3));

        let mut short = vec![0; nnz - 1];
        assert!(jacobian.supply_indices(&mut short, &mut columns).is_err());
    }

    #[test]
    fn test_mapped_assignment_and_rebind() {
        let owned = numbered(JacobianStructure::new(1, 2, &[0.5, 1.0], &[0.0, 1.0]).unwrap());
        let mut first = vec![0.0; owned.nonzeros()];
        let mut second = vec![0.0; owned.nonzeros()];
        let mut wrong = vec![0.0; owned.nonzeros() + 1];
        {
            let mut mapped =
                MappedConstraintJacobian::new(owned.structure().clone(), &mut first).unwrap();
            mapped.assign_from(&owned).unwrap();
            assert!(matches!(
                mapped.replace_storage(&mut wrong),
                Err(OptimError::IncompatibleStructure(_))
            ));
            mapped.replace_storage(&mut second).unwrap();
            mapped.get_column_block_mut(1).unwrap().set(0, 1, -1.0);
        }
        assert_eq!(first, owned.values());
        assert_eq!(second, vec![0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_assignment_requires_identical_structure() {
        let a = ConstraintJacobian::from_timepoints(1, 1, &[0.5, 1.0], &[0.0, 1.0]).unwrap();
        let mut b = ConstraintJacobian::from_timepoints(1, 1, &[0.5, 1.0], &[0.5, 1.0]).unwrap();
        assert_eq!(b.structure().block_column_offsets(), &[0, 1, 2]);
        assert!(matches!(
            b.assign_from(&a),
            Err(OptimError::IncompatibleStructure(_))
        ));

        let mut buffer = vec![0.0; 3];
        assert!(MappedConstraintJacobian::new(a.structure().clone(), &mut buffer).is_err());
    }
}
