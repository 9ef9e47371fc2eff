//! Backward (adjoint) sweep producing the objective gradient and the
//! constraint Jacobian with respect to the controls.
//!
//! With `A_k = ∂E_k/∂x_k`, `B_k = ∂E_k/∂x_{k-1}` and `C_k = ∂E_k/∂u`, the
//! cost adjoint of step `k` solves
//!
//! ```text
//! A_kᵀ ξ_k = -(w_k ∇ₓf_k + B_{k+1}ᵀ ξ_{k+1})
//! ```
//!
//! and contributes `ξ_kᵀ C_k + w_k ∇ᵤf_k` to the gradient at `u(t_k)`. Each
//! constraint row gets its own adjoint column, seeded with `-∇ₓg` when the
//! sweep reaches the constraint's time and carried to every earlier step.
//! All active columns are solved with the same factorization of `A_k`, taken
//! from the [`EquationDerivativeCache`](crate::EquationDerivativeCache).
//!
//! The derivative at `u(t_k)` is spread over the two bracketing control
//! nodes with the interpolation weights `λ` and `1 - λ`.

use transflow_core::{Interpolating, InterpolatingMut, InterpolatingVector, InterpolatingView};

use crate::derivative_cache::EquationDerivatives;
use crate::error::{OptimError, OptimResult};
use crate::jacobian::{ConstraintJacobian, JacobianStorage};
use crate::matrix::PatternMatrix;
use crate::optimizer::Discretization;
use crate::problem::OptimizableProblem;

/// Work matrices and buffers of the sweep, allocated on first use and kept
/// for later sweeps.
#[derive(Debug)]
pub(crate) struct AdjointSweep {
    cost_d_state: PatternMatrix,
    cost_d_control: PatternMatrix,
    constraint_d_state: PatternMatrix,
    constraint_d_control: PatternMatrix,
    control: Vec<f64>,
    /// Cost adjoint right-hand side, then solution.
    cost_rhs: Vec<f64>,
    cost_adjoint: Vec<f64>,
    cost_d_u: Vec<f64>,
    /// One right-hand side per constraint row, column-major (states long).
    constraint_rhs: Vec<f64>,
    constraint_adjoint: Vec<f64>,
    /// Row-major, constraint rows × controls per step.
    constraint_d_u: Vec<f64>,
}

impl AdjointSweep {
    pub(crate) fn new(grid: &Discretization) -> Self {
        let states = grid.number_of_states;
        let controls = grid.controls_per_step;
        let constraints = grid.constraints_per_step;
        let total_constraints = grid.constraint_timepoints.len() * constraints;
        Self {
            cost_d_state: PatternMatrix::new(1, states),
            cost_d_control: PatternMatrix::new(1, controls),
            constraint_d_state: PatternMatrix::new(constraints, states),
            constraint_d_control: PatternMatrix::new(constraints, controls),
            control: vec![0.0; controls],
            cost_rhs: vec![0.0; states],
            cost_adjoint: vec![0.0; states],
            cost_d_u: vec![0.0; controls],
            constraint_rhs: vec![0.0; total_constraints * states],
            constraint_adjoint: vec![0.0; states],
            constraint_d_u: vec![0.0; total_constraints * controls],
        }
    }

    /// Runs the sweep, overwriting `gradient` and `jacobian`. `steps[k - 1]`
    /// holds the factored derivatives of the step ending at state `k`.
    ///
    /// Numerical failures come back as errors for which
    /// [`OptimError::is_numerical`] holds.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run<P: OptimizableProblem>(
        &mut self,
        problem: &P,
        grid: &Discretization,
        controls: InterpolatingView<'_>,
        states: &InterpolatingVector,
        steps: &[EquationDerivatives],
        gradient: &mut InterpolatingVector,
        jacobian: &mut ConstraintJacobian,
    ) -> OptimResult<()> {
        gradient.set_zero();
        jacobian.set_zero();
        self.cost_rhs.fill(0.0);
        self.constraint_rhs.fill(0.0);
        self.constraint_d_u.fill(0.0);

        let number_of_states = grid.number_of_states;
        let controls_per_step = grid.controls_per_step;
        let constraints_per_step = grid.constraints_per_step;
        let points = &grid.state_timepoints;
        if steps.len() + 1 != points.len() {
            return Err(OptimError::DimensionMismatch {
                what: "equation derivatives",
                expected: points.len().saturating_sub(1),
                got: steps.len(),
            });
        }
        let mut active_from = grid.constraint_timepoints.len();

        for state_index in (1..points.len()).rev() {
            let new_time = points[state_index];
            let new_state = states.vector_at_index(state_index)?;
            controls.evaluate_into(new_time, &mut self.control)?;
            let control = &self.control;
            let equation = &steps[state_index - 1];
            let (upper, lambda) = grid.index_lambda_pairs[state_index];
            let weight = grid.integral_weights[state_index];

            // Cost adjoint.
            self.cost_d_state.fill(|f| {
                problem.d_evaluate_cost_d_state(f, new_time, new_state, control)
            })?;
            self.cost_d_control.fill(|f| {
                problem.d_evaluate_cost_d_control(f, new_time, new_state, control)
            })?;
            for (_, column, value) in self.cost_d_state.entries() {
                self.cost_rhs[column] -= weight * value;
            }
            self.cost_adjoint.copy_from_slice(&self.cost_rhs);
            equation
                .factorization()
                .solve_transposed(&mut self.cost_adjoint)?;
            self.cost_rhs.fill(0.0);
            equation
                .d_last_state
                .transpose_mul_add(&self.cost_adjoint, -1.0, &mut self.cost_rhs);

            self.cost_d_u.fill(0.0);
            equation
                .d_control
                .transpose_mul_add(&self.cost_adjoint, 1.0, &mut self.cost_d_u);
            for (_, column, value) in self.cost_d_control.entries() {
                self.cost_d_u[column] += weight * value;
            }
            distribute_to_gradient(gradient, upper, lambda, &self.cost_d_u)?;

            if constraints_per_step == 0 {
                continue;
            }

            // Constraint adjoints.
            let reaches_constraint = active_from > 0
                && grid.constraint_state_indices[active_from - 1] == state_index;
            if reaches_constraint {
                active_from -= 1;
                self.constraint_d_state.fill(|f| {
                    problem.d_evaluate_constraint_d_state(f, new_time, new_state, control)
                })?;
                self.constraint_d_control.fill(|f| {
                    problem.d_evaluate_constraint_d_control(f, new_time, new_state, control)
                })?;
                for (row, column, value) in self.constraint_d_state.entries() {
                    let rhs_column = active_from * constraints_per_step + row;
                    self.constraint_rhs[rhs_column * number_of_states + column] -= value;
                }
            }
            let first_active_row = active_from * constraints_per_step;
            let total_rows = grid.constraint_timepoints.len() * constraints_per_step;
            if first_active_row == total_rows {
                continue;
            }

            for row in first_active_row..total_rows {
                let rhs = &mut self.constraint_rhs
                    [row * number_of_states..(row + 1) * number_of_states];
                self.constraint_adjoint.copy_from_slice(rhs);
                equation
                    .factorization()
                    .solve_transposed(&mut self.constraint_adjoint)?;
                rhs.fill(0.0);
                equation
                    .d_last_state
                    .transpose_mul_add(&self.constraint_adjoint, -1.0, rhs);

                let d_u = &mut self.constraint_d_u
                    [row * controls_per_step..(row + 1) * controls_per_step];
                d_u.fill(0.0);
                equation
                    .d_control
                    .transpose_mul_add(&self.constraint_adjoint, 1.0, d_u);
            }
            if reaches_constraint {
                for (row, column, value) in self.constraint_d_control.entries() {
                    self.constraint_d_u
                        [(first_active_row + row) * controls_per_step + column] += value;
                }
            }

            distribute_to_jacobian(
                jacobian,
                upper,
                lambda,
                first_active_row,
                &self.constraint_d_u[first_active_row * controls_per_step..],
            )?;
        }
        Ok(())
    }
}

/// Adds `d_u` to the gradient at control node `upper` (weight `lambda`) and
/// `upper - 1` (weight `1 - lambda`).
fn distribute_to_gradient(
    gradient: &mut InterpolatingVector,
    upper: usize,
    lambda: f64,
    d_u: &[f64],
) -> OptimResult<()> {
    for (g, d) in gradient.mut_timestep(upper)?.iter_mut().zip(d_u) {
        *g += lambda * d;
    }
    if lambda != 1.0 {
        for (g, d) in gradient.mut_timestep(upper - 1)?.iter_mut().zip(d_u) {
            *g += (1.0 - lambda) * d;
        }
    }
    Ok(())
}

/// Adds the rows `first_row..` of the constraint derivative (row-major in
/// `d_u`) to the column blocks of the bracketing control nodes.
fn distribute_to_jacobian(
    jacobian: &mut ConstraintJacobian,
    upper: usize,
    lambda: f64,
    first_row: usize,
    d_u: &[f64],
) -> OptimResult<()> {
    add_rows(jacobian, upper, lambda, first_row, d_u)?;
    if lambda != 1.0 {
        add_rows(jacobian, upper - 1, 1.0 - lambda, first_row, d_u)?;
    }
    Ok(())
}

fn add_rows(
    jacobian: &mut ConstraintJacobian,
    column: usize,
    weight: f64,
    first_row: usize,
    d_u: &[f64],
) -> OptimResult<()> {
    let mut block = jacobian.get_column_block_mut(column)?;
    let width = block.columns;
    let offset = first_row.checked_sub(block.first_row).ok_or_else(|| {
        OptimError::IncompatibleStructure(format!(
            "row {first_row} lies above the first stored row {} of column block {column}",
            block.first_row
        ))
    })?;
    for (index, row) in d_u.chunks(width.max(1)).enumerate() {
        for (target, value) in block.row_mut(offset + index).iter_mut().zip(row) {
            *target += weight * value;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_above_the_staircase_are_rejected() {
        let mut jacobian =
            ConstraintJacobian::from_timepoints(1, 1, &[0.5, 2.0], &[0.0, 1.0, 2.0]).unwrap();
        assert_eq!(jacobian.structure().block_column_offsets(), &[0, 0, 1, 2]);

        add_rows(&mut jacobian, 2, 1.0, 1, &[4.0]).unwrap();
        let err = add_rows(&mut jacobian, 2, 1.0, 0, &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, OptimError::IncompatibleStructure(_)));
        assert_eq!(jacobian.whole_matrix()[1], vec![0.0, 0.0, 4.0]);
    }
}
