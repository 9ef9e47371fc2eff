//! Per-timestep derivatives of the timestep equation.
//!
//! [`EquationDerivatives`] holds `∂E/∂x_new` with its LU factors, `∂E/∂x_last`
//! and `∂E/∂u` for one step. [`EquationDerivativeCache`] keeps one per step
//! of a whole trajectory for the adjoint sweep, so that asking for
//! sensitivities at the same point again does not refactor anything.

use tracing::debug;
use transflow_core::{Interpolating, InterpolatingVector, InterpolatingView};

use crate::error::{OptimError, OptimResult};
use crate::lu::LuFactorization;
use crate::matrix::PatternMatrix;
use crate::problem::ControlProblem;
use crate::state_cache::CacheEntry;

#[derive(Debug)]
pub struct EquationDerivatives {
    pub d_new_state: PatternMatrix,
    pub d_last_state: PatternMatrix,
    pub d_control: PatternMatrix,
    factorization: LuFactorization,
}

impl EquationDerivatives {
    pub fn new(number_of_states: usize, number_of_controls: usize) -> Self {
        Self {
            d_new_state: PatternMatrix::new(number_of_states, number_of_states),
            d_last_state: PatternMatrix::new(number_of_states, number_of_states),
            d_control: PatternMatrix::new(number_of_states, number_of_controls),
            factorization: LuFactorization::new(number_of_states),
        }
    }

    /// Fills all three matrices for the step ending at `new_time` and
    /// factors `∂E/∂x_new`.
    pub fn evaluate(
        &mut self,
        problem: &dyn ControlProblem,
        last_time: f64,
        new_time: f64,
        last_state: &[f64],
        new_state: &[f64],
        control: &[f64],
    ) -> OptimResult<()> {
        self.d_new_state.fill(|f| {
            problem.d_evaluate_d_new_state(f, last_time, new_time, last_state, new_state, control)
        })?;
        self.d_last_state.fill(|f| {
            problem.d_evaluate_d_last_state(f, last_time, new_time, last_state, new_state, control)
        })?;
        self.d_control.fill(|f| {
            problem.d_evaluate_d_control(f, last_time, new_time, last_state, new_state, control)
        })?;
        self.factorization
            .factorize(&self.d_new_state)
            .map_err(|err| match err {
                OptimError::SingularMatrix { .. } => OptimError::SingularStep { time: new_time },
                other => other,
            })
    }

    pub fn factorization(&self) -> &LuFactorization {
        &self.factorization
    }
}

/// Derivatives and factorizations of every step of one trajectory.
#[derive(Debug, Default)]
pub struct EquationDerivativeCache {
    key: Option<CacheEntry>,
    steps: Vec<EquationDerivatives>,
    initialized: bool,
}

impl EquationDerivativeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Derivatives of the step ending at state index `state_index` (>= 1).
    pub fn step(&self, state_index: usize) -> Option<&EquationDerivatives> {
        state_index
            .checked_sub(1)
            .and_then(|index| self.steps.get(index))
    }

    /// Per-step derivatives for `states`, recomputed only when the key
    /// differs from the last successful call.
    pub fn derivatives(
        &mut self,
        problem: &dyn ControlProblem,
        controls: InterpolatingView<'_>,
        states: &InterpolatingVector,
        initial_state: &[f64],
    ) -> OptimResult<&[EquationDerivatives]> {
        let hit = self
            .key
            .as_ref()
            .is_some_and(|key| key.matches(&controls, states.points(), initial_state));
        if !hit {
            self.key = None;
            if !self.initialized || self.steps.len() + 1 != states.size() {
                self.initialize(problem, controls, states)?;
            } else {
                self.update(problem, controls, states)?;
            }
            self.key = Some(CacheEntry::new(controls, states.points(), initial_state));
        }
        Ok(&self.steps)
    }

    /// Allocates and fills every step.
    fn initialize(
        &mut self,
        problem: &dyn ControlProblem,
        controls: InterpolatingView<'_>,
        states: &InterpolatingVector,
    ) -> OptimResult<()> {
        let number_of_states = problem.number_of_states();
        let number_of_controls = problem.number_of_controls_per_timepoint();
        self.steps = (1..states.size())
            .map(|_| EquationDerivatives::new(number_of_states, number_of_controls))
            .collect();
        self.initialized = true;
        debug!(steps = self.steps.len(), "allocated equation derivatives");
        self.update(problem, controls, states)
    }

    /// Refills values and refactors, keeping the patterns.
    fn update(
        &mut self,
        problem: &dyn ControlProblem,
        controls: InterpolatingView<'_>,
        states: &InterpolatingVector,
    ) -> OptimResult<()> {
        let points = states.points();
        let mut control = vec![0.0; controls.inner_length()];
        for (index, step) in self.steps.iter_mut().enumerate() {
            let (last_time, new_time) = (points[index], points[index + 1]);
            controls.evaluate_into(new_time, &mut control)?;
            step.evaluate(
                problem,
                last_time,
                new_time,
                states.vector_at_index(index)?,
                states.vector_at_index(index + 1)?,
                &control,
            )?;
        }
        Ok(())
    }
}
