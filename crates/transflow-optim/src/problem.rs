//! Interface between the engine and a physical network model.
//!
//! A model advances its state with an implicit timestep equation
//!
//! ```text
//! E(t_last, t_new, x_last, x_new, u(t_new)) = 0
//! ```
//!
//! and contributes a running cost and pointwise constraints. The engine only
//! sees dimensions, residuals and the partial derivatives written through a
//! [`MatrixFiller`]. A model must write the same sparsity pattern every time
//! a derivative is requested.

use crate::matrix::MatrixFiller;

/// The timestep equation.
pub trait ControlProblem {
    fn number_of_states(&self) -> usize;
    fn number_of_controls_per_timepoint(&self) -> usize;

    /// Called once before each forward timestep is solved.
    fn prepare_timestep(
        &mut self,
        _last_time: f64,
        _new_time: f64,
        _last_state: &[f64],
        _control: &[f64],
    ) {
    }

    fn evaluate(
        &self,
        residual: &mut [f64],
        last_time: f64,
        new_time: f64,
        last_state: &[f64],
        new_state: &[f64],
        control: &[f64],
    );

    /// `∂E/∂x_new`, states × states.
    fn d_evaluate_d_new_state(
        &self,
        filler: &mut dyn MatrixFiller,
        last_time: f64,
        new_time: f64,
        last_state: &[f64],
        new_state: &[f64],
        control: &[f64],
    );

    /// `∂E/∂x_last`, states × states.
    fn d_evaluate_d_last_state(
        &self,
        filler: &mut dyn MatrixFiller,
        last_time: f64,
        new_time: f64,
        last_state: &[f64],
        new_state: &[f64],
        control: &[f64],
    );

    /// `∂E/∂u`, states × controls.
    fn d_evaluate_d_control(
        &self,
        filler: &mut dyn MatrixFiller,
        last_time: f64,
        new_time: f64,
        last_state: &[f64],
        new_state: &[f64],
        control: &[f64],
    );
}

/// Running cost `f(t, x, u)`, integrated over the state grid.
///
/// Penalty terms are part of the cost.
pub trait CostProblem {
    fn evaluate_cost(&self, time: f64, state: &[f64], control: &[f64]) -> f64;

    /// Row vector `∂f/∂x`, written as a 1 × states matrix.
    fn d_evaluate_cost_d_state(
        &self,
        filler: &mut dyn MatrixFiller,
        time: f64,
        state: &[f64],
        control: &[f64],
    );

    /// Row vector `∂f/∂u`, written as a 1 × controls matrix.
    fn d_evaluate_cost_d_control(
        &self,
        filler: &mut dyn MatrixFiller,
        time: f64,
        state: &[f64],
        control: &[f64],
    );
}

/// Pointwise constraints `g(t, x, u)` evaluated at constraint times.
pub trait ConstraintProblem {
    fn number_of_constraints_per_timepoint(&self) -> usize;

    fn evaluate_constraint(&self, values: &mut [f64], time: f64, state: &[f64], control: &[f64]);

    /// constraints × states
    fn d_evaluate_constraint_d_state(
        &self,
        filler: &mut dyn MatrixFiller,
        time: f64,
        state: &[f64],
        control: &[f64],
    );

    /// constraints × controls
    fn d_evaluate_constraint_d_control(
        &self,
        filler: &mut dyn MatrixFiller,
        time: f64,
        state: &[f64],
        control: &[f64],
    );
}

/// Everything the optimizer needs from a model.
pub trait OptimizableProblem: ControlProblem + CostProblem + ConstraintProblem {}

impl<T: ControlProblem + CostProblem + ConstraintProblem> OptimizableProblem for T {}
