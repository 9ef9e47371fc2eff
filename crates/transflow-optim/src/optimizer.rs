//! Optimal control of an implicitly time-stepped problem.
//!
//! [`ImplicitOptimizer`] answers the [`NlpCallbacks`] of an NLP solver for a
//! control vector living on the control grid. States come from a
//! [`StateCache`]; the cost is integrated over the state grid with the
//! trapezoidal rule, leaving out the fixed initial state; constraints are
//! evaluated at the constraint times, which must be state times up to
//! [`EPSILON`] and are replaced by the state times they match. Gradients
//! and Jacobians come from one adjoint sweep per control vector.
//!
//! Two staleness flags gate the cached states and derivatives. Both are
//! cleared by [`NlpCallbacks::new_x`] and nothing else, so callers must
//! signal every new control vector (see [`NewXTracker`](crate::NewXTracker)).

use tracing::{debug, info, warn};
use transflow_core::{grid, Interpolating, InterpolatingVector, InterpolatingView, EPSILON};

use crate::adjoint::AdjointSweep;
use crate::derivative_cache::EquationDerivativeCache;
use crate::error::{OptimError, OptimResult};
use crate::jacobian::{ConstraintJacobian, JacobianStorage, MappedConstraintJacobian};
use crate::nlp::NlpCallbacks;
use crate::problem::OptimizableProblem;
use crate::state_cache::StateCache;

/// The three independent time grids of a problem.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeGrids {
    pub states: Vec<f64>,
    pub controls: Vec<f64>,
    /// May be empty when the problem has no constraints.
    pub constraints: Vec<f64>,
}

/// Initial guess and bounds, on grids of their own.
///
/// They are resampled onto the control (or constraint) grid when requested.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialValues {
    pub controls: InterpolatingVector,
    pub lower_bounds: InterpolatingVector,
    pub upper_bounds: InterpolatingVector,
    pub constraint_lower_bounds: InterpolatingVector,
    pub constraint_upper_bounds: InterpolatingVector,
}

/// Grids and everything precomputed from them.
#[derive(Debug, Clone)]
pub(crate) struct Discretization {
    pub(crate) state_timepoints: Vec<f64>,
    pub(crate) control_timepoints: Vec<f64>,
    pub(crate) constraint_timepoints: Vec<f64>,
    pub(crate) initial_state: Vec<f64>,
    pub(crate) number_of_states: usize,
    pub(crate) controls_per_step: usize,
    pub(crate) constraints_per_step: usize,
    /// `(upper control index, lambda)` of every state time.
    pub(crate) index_lambda_pairs: Vec<(usize, f64)>,
    pub(crate) integral_weights: Vec<f64>,
    /// State index of every constraint time; `constraint_timepoints[i]` is
    /// exactly `state_timepoints[constraint_state_indices[i]]`.
    pub(crate) constraint_state_indices: Vec<usize>,
}

impl Discretization {
    fn new(
        grids: TimeGrids,
        initial_state: Vec<f64>,
        number_of_states: usize,
        controls_per_step: usize,
        constraints_per_step: usize,
    ) -> OptimResult<Self> {
        let TimeGrids {
            states,
            controls,
            constraints,
        } = grids;

        grid::validate_points(&states)
            .map_err(|err| OptimError::InvalidSetup(format!("state grid: {err}")))?;
        grid::validate_points(&controls)
            .map_err(|err| OptimError::InvalidSetup(format!("control grid: {err}")))?;
        if !constraints.is_empty() {
            grid::validate_points(&constraints)
                .map_err(|err| OptimError::InvalidSetup(format!("constraint grid: {err}")))?;
        }
        if !grid::span_covers(&controls, &states) {
            return Err(OptimError::InvalidSetup(format!(
                "control grid [{}, {}] does not cover the state grid [{}, {}]",
                controls[0],
                controls[controls.len() - 1],
                states[0],
                states[states.len() - 1]
            )));
        }
        if initial_state.len() != number_of_states {
            return Err(OptimError::InvalidSetup(format!(
                "initial state has {} entries, the problem has {} states",
                initial_state.len(),
                number_of_states
            )));
        }

        let constraint_state_indices = constraints
            .iter()
            .map(|&time| {
                let index = states.partition_point(|&t| t < time - EPSILON);
                match states.get(index) {
                    Some(&t) if index > 0 && (t - time).abs() <= EPSILON => Ok(index),
                    _ => Err(OptimError::InvalidSetup(format!(
                        "constraint time {time} is not a state time after the initial one"
                    ))),
                }
            })
            .collect::<OptimResult<Vec<_>>>()?;

        let index_lambda_pairs = states
            .iter()
            .map(|&time| grid::locate(&controls, time))
            .collect::<Result<Vec<_>, _>>()?;

        let integral_weights = integral_weights(&states);
        let constraint_timepoints: Vec<f64> =
            constraint_state_indices.iter().map(|&index| states[index]).collect();

        Ok(Self {
            state_timepoints: states,
            control_timepoints: controls,
            constraint_timepoints,
            initial_state,
            number_of_states,
            controls_per_step,
            constraints_per_step,
            index_lambda_pairs,
            integral_weights,
            constraint_state_indices,
        })
    }

    fn number_of_controls(&self) -> usize {
        self.control_timepoints.len() * self.controls_per_step
    }

    fn number_of_constraints(&self) -> usize {
        self.constraint_timepoints.len() * self.constraints_per_step
    }

    fn controls<'a>(&'a self, x: &'a [f64]) -> OptimResult<InterpolatingView<'a>> {
        if x.len() != self.number_of_controls() {
            return Err(OptimError::DimensionMismatch {
                what: "control vector",
                expected: self.number_of_controls(),
                got: x.len(),
            });
        }
        Ok(InterpolatingView::new(
            &self.control_timepoints,
            self.controls_per_step,
            x,
        )?)
    }
}

/// Trapezoidal weights: half of the adjacent interval(s) of each node.
fn integral_weights(points: &[f64]) -> Vec<f64> {
    let n = points.len();
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| {
            let left = if i == 0 { points[0] } else { points[i - 1] };
            let right = if i == n - 1 { points[n - 1] } else { points[i + 1] };
            0.5 * (right - left)
        })
        .collect()
}

/// Optimizer over the controls of an implicitly time-stepped problem.
pub struct ImplicitOptimizer<P> {
    problem: P,
    cache: Box<dyn StateCache>,
    grid: Discretization,
    initial_values: InitialValues,
    objective_gradient: InterpolatingVector,
    constraint_jacobian: ConstraintJacobian,
    /// Sweep targets, swapped with the published results on success.
    gradient_work: InterpolatingVector,
    jacobian_work: ConstraintJacobian,
    derivative_cache: EquationDerivativeCache,
    sweep: Option<AdjointSweep>,
    states_up_to_date: bool,
    derivatives_up_to_date: bool,
}

impl<P: OptimizableProblem> ImplicitOptimizer<P> {
    pub fn new(
        problem: P,
        cache: Box<dyn StateCache>,
        grids: TimeGrids,
        initial_state: Vec<f64>,
        initial_values: InitialValues,
    ) -> OptimResult<Self> {
        let controls_per_step = problem.number_of_controls_per_timepoint();
        let constraints_per_step = problem.number_of_constraints_per_timepoint();
        let grid = Discretization::new(
            grids,
            initial_state,
            problem.number_of_states(),
            controls_per_step,
            constraints_per_step,
        )?;
        check_initial_values(&initial_values, &grid)?;

        let objective_gradient =
            InterpolatingVector::new(grid.control_timepoints.clone(), controls_per_step)?;
        let constraint_jacobian = ConstraintJacobian::from_timepoints(
            constraints_per_step,
            controls_per_step,
            &grid.constraint_timepoints,
            &grid.control_timepoints,
        )?;

        info!(
            states = grid.state_timepoints.len(),
            controls = grid.number_of_controls(),
            constraints = grid.number_of_constraints(),
            jacobian_nonzeros = constraint_jacobian.nonzeros(),
            "set up implicit optimizer"
        );

        Ok(Self {
            problem,
            cache,
            grid,
            initial_values,
            gradient_work: objective_gradient.clone(),
            jacobian_work: constraint_jacobian.clone(),
            objective_gradient,
            constraint_jacobian,
            derivative_cache: EquationDerivativeCache::new(),
            sweep: None,
            states_up_to_date: false,
            derivatives_up_to_date: false,
        })
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn state_timepoints(&self) -> &[f64] {
        &self.grid.state_timepoints
    }

    pub fn control_timepoints(&self) -> &[f64] {
        &self.grid.control_timepoints
    }

    pub fn constraint_timepoints(&self) -> &[f64] {
        &self.grid.constraint_timepoints
    }

    pub fn integral_weights(&self) -> &[f64] {
        &self.grid.integral_weights
    }

    /// Trajectory of the last successful simulation.
    pub fn states(&self) -> Option<&InterpolatingVector> {
        self.cache.cached_states()
    }

    /// Gradient of the last successful sweep. A failed sweep leaves it
    /// untouched.
    pub fn objective_gradient(&self) -> &InterpolatingVector {
        &self.objective_gradient
    }

    /// Jacobian of the last successful sweep.
    pub fn constraint_jacobian(&self) -> &ConstraintJacobian {
        &self.constraint_jacobian
    }

    /// Simulates if the states are stale. Returns whether states exist.
    fn ensure_states(
        problem: &mut P,
        cache: &mut dyn StateCache,
        grid: &Discretization,
        controls: InterpolatingView<'_>,
        states_up_to_date: &mut bool,
    ) -> OptimResult<bool> {
        if !*states_up_to_date {
            *states_up_to_date = cache.refresh_cache(
                problem,
                controls,
                &grid.state_timepoints,
                &grid.initial_state,
            )?;
            if !*states_up_to_date {
                debug!("no states for this control vector");
            }
        }
        Ok(*states_up_to_date)
    }

    /// Runs the adjoint sweep unless its results are current.
    fn compute_derivatives(&mut self, x: &[f64]) -> OptimResult<bool> {
        if self.derivatives_up_to_date {
            return Ok(true);
        }
        let controls = self.grid.controls(x)?;
        if !Self::ensure_states(
            &mut self.problem,
            self.cache.as_mut(),
            &self.grid,
            controls,
            &mut self.states_up_to_date,
        )? {
            return Ok(false);
        }
        let Some(states) = self.cache.cached_states() else {
            return Ok(false);
        };

        let grid = &self.grid;
        let sweep = self.sweep.get_or_insert_with(|| AdjointSweep::new(grid));
        let result = self
            .derivative_cache
            .derivatives(&self.problem, controls, states, &grid.initial_state)
            .and_then(|steps| {
                sweep.run(
                    &self.problem,
                    grid,
                    controls,
                    states,
                    steps,
                    &mut self.gradient_work,
                    &mut self.jacobian_work,
                )
            });
        match result {
            Ok(()) => {
                std::mem::swap(&mut self.objective_gradient, &mut self.gradient_work);
                std::mem::swap(&mut self.constraint_jacobian, &mut self.jacobian_work);
                self.derivatives_up_to_date = true;
                Ok(true)
            }
            Err(err) if err.is_numerical() => {
                warn!(error = %err, "adjoint sweep failed, point not evaluable");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

fn check_initial_values(values: &InitialValues, grid: &Discretization) -> OptimResult<()> {
    let controls_per_step = grid.controls_per_step;
    let constraints_per_step = grid.constraints_per_step;

    let control_like = [
        ("initial controls", &values.controls),
        ("lower bounds", &values.lower_bounds),
        ("upper bounds", &values.upper_bounds),
    ];
    for (name, vector) in control_like {
        if vector.inner_length() != controls_per_step {
            return Err(OptimError::InvalidSetup(format!(
                "{name} have inner length {}, the problem has {controls_per_step} controls per time",
                vector.inner_length()
            )));
        }
        if !grid::span_covers(vector.points(), &grid.control_timepoints) {
            return Err(OptimError::InvalidSetup(format!(
                "{name} do not cover the control grid"
            )));
        }
    }
    if !values.lower_bounds.same_structure(&values.upper_bounds) {
        return Err(OptimError::InvalidSetup(
            "lower and upper bounds must share their grid".to_string(),
        ));
    }

    let constraint_like = [
        ("constraint lower bounds", &values.constraint_lower_bounds),
        ("constraint upper bounds", &values.constraint_upper_bounds),
    ];
    for (name, vector) in constraint_like {
        if vector.inner_length() != constraints_per_step {
            return Err(OptimError::InvalidSetup(format!(
                "{name} have inner length {}, the problem has {constraints_per_step} constraints per time",
                vector.inner_length()
            )));
        }
        if !grid.constraint_timepoints.is_empty()
            && !grid::span_covers(vector.points(), &grid.constraint_timepoints)
        {
            return Err(OptimError::InvalidSetup(format!(
                "{name} do not cover the constraint grid"
            )));
        }
    }
    if !values
        .constraint_lower_bounds
        .same_structure(&values.constraint_upper_bounds)
    {
        return Err(OptimError::InvalidSetup(
            "constraint lower and upper bounds must share their grid".to_string(),
        ));
    }
    Ok(())
}

fn resample(points: &[f64], inner_length: usize, source: &InterpolatingVector) -> OptimResult<Vec<f64>> {
    if points.is_empty() {
        return Ok(Vec::new());
    }
    Ok(
        InterpolatingVector::construct_and_interpolate_from(points.to_vec(), inner_length, source)?
            .into_values(),
    )
}

impl<P: OptimizableProblem> NlpCallbacks for ImplicitOptimizer<P> {
    fn number_of_controls(&self) -> usize {
        self.grid.number_of_controls()
    }

    fn number_of_constraints(&self) -> usize {
        self.grid.number_of_constraints()
    }

    fn nonzeros_in_jacobian(&self) -> usize {
        self.constraint_jacobian.nonzeros()
    }

    fn new_x(&mut self) {
        self.states_up_to_date = false;
        self.derivatives_up_to_date = false;
    }

    fn evaluate_objective(&mut self, x: &[f64], objective: &mut f64) -> OptimResult<bool> {
        let controls = self.grid.controls(x)?;
        if !Self::ensure_states(
            &mut self.problem,
            self.cache.as_mut(),
            &self.grid,
            controls,
            &mut self.states_up_to_date,
        )? {
            return Ok(false);
        }
        let Some(states) = self.cache.cached_states() else {
            return Ok(false);
        };

        let mut control = vec![0.0; self.grid.controls_per_step];
        let mut total = 0.0;
        for (index, &time) in self.grid.state_timepoints.iter().enumerate().skip(1) {
            controls.evaluate_into(time, &mut control)?;
            let state = states.vector_at_index(index)?;
            total += self.grid.integral_weights[index] * self.problem.evaluate_cost(time, state, &control);
        }
        *objective = total;
        Ok(true)
    }

    fn evaluate_constraints(&mut self, x: &[f64], constraints: &mut [f64]) -> OptimResult<bool> {
        let expected = self.grid.number_of_constraints();
        if constraints.len() != expected {
            return Err(OptimError::DimensionMismatch {
                what: "constraint buffer",
                expected,
                got: constraints.len(),
            });
        }
        let controls = self.grid.controls(x)?;
        if !Self::ensure_states(
            &mut self.problem,
            self.cache.as_mut(),
            &self.grid,
            controls,
            &mut self.states_up_to_date,
        )? {
            return Ok(false);
        }
        let Some(states) = self.cache.cached_states() else {
            return Ok(false);
        };

        let per_step = self.grid.constraints_per_step;
        let mut control = vec![0.0; self.grid.controls_per_step];
        for (row, &state_index) in self.grid.constraint_state_indices.iter().enumerate() {
            let time = self.grid.state_timepoints[state_index];
            controls.evaluate_into(time, &mut control)?;
            self.problem.evaluate_constraint(
                &mut constraints[row * per_step..(row + 1) * per_step],
                time,
                states.vector_at_index(state_index)?,
                &control,
            );
        }
        Ok(true)
    }

    fn evaluate_objective_gradient(&mut self, x: &[f64], gradient: &mut [f64]) -> OptimResult<bool> {
        let expected = self.grid.number_of_controls();
        if gradient.len() != expected {
            return Err(OptimError::DimensionMismatch {
                what: "gradient buffer",
                expected,
                got: gradient.len(),
            });
        }
        if !self.compute_derivatives(x)? {
            return Ok(false);
        }
        gradient.copy_from_slice(self.objective_gradient.values());
        Ok(true)
    }

    fn evaluate_constraint_jacobian(&mut self, x: &[f64], values: &mut [f64]) -> OptimResult<bool> {
        let mut mapped =
            MappedConstraintJacobian::new(self.constraint_jacobian.structure().clone(), values)?;
        if !self.compute_derivatives(x)? {
            return Ok(false);
        }
        mapped.assign_from(&self.constraint_jacobian)?;
        Ok(true)
    }

    fn supply_constraint_jacobian_indices(&self, rows: &mut [usize], columns: &mut [usize]) -> OptimResult<()> {
        self.constraint_jacobian.supply_indices(rows, columns)
    }

    fn initial_controls(&self) -> OptimResult<Vec<f64>> {
        resample(
            &self.grid.control_timepoints,
            self.grid.controls_per_step,
            &self.initial_values.controls,
        )
    }

    fn lower_bounds(&self) -> OptimResult<Vec<f64>> {
        resample(
            &self.grid.control_timepoints,
            self.grid.controls_per_step,
            &self.initial_values.lower_bounds,
        )
    }

    fn upper_bounds(&self) -> OptimResult<Vec<f64>> {
        resample(
            &self.grid.control_timepoints,
            self.grid.controls_per_step,
            &self.initial_values.upper_bounds,
        )
    }

    fn constraint_lower_bounds(&self) -> OptimResult<Vec<f64>> {
        resample(
            &self.grid.constraint_timepoints,
            self.grid.constraints_per_step,
            &self.initial_values.constraint_lower_bounds,
        )
    }

    fn constraint_upper_bounds(&self) -> OptimResult<Vec<f64>> {
        resample(
            &self.grid.constraint_timepoints,
            self.grid.constraints_per_step,
            &self.initial_values.constraint_upper_bounds,
        )
    }
}
