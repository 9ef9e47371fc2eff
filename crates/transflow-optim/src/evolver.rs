//! Forward simulation with an implicit timestep and a damped Newton solver.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use transflow_core::{
    Interpolating, InterpolatingMut, InterpolatingVector, InterpolatingView, TransflowError,
};

use crate::error::{OptimError, OptimResult};
use crate::lu::LuFactorization;
use crate::matrix::PatternMatrix;
use crate::problem::ControlProblem;

/// Smallest damping factor tried before a Newton step is given up.
const MINIMAL_DAMPING: f64 = 1e-12;

/// Newton settings, read from the `"time_evolution"` section of a
/// configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolverSettings {
    /// Reuse the first Jacobian factorization of each step.
    pub use_simplified_newton: bool,
    pub maximal_number_of_newton_iterations: usize,
    /// Max-norm of the residual accepted as converged.
    pub tolerance: f64,
    /// Extra attempts for a failed step, each starting with half the damping.
    pub retries: usize,
}

impl Default for EvolverSettings {
    fn default() -> Self {
        Self {
            use_simplified_newton: false,
            maximal_number_of_newton_iterations: 30,
            tolerance: 1e-8,
            retries: 0,
        }
    }
}

impl EvolverSettings {
    pub fn from_json_file(path: impl AsRef<Path>) -> OptimResult<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(TransflowError::Io)?;
        let settings = serde_json::from_str(&text).map_err(TransflowError::Json)?;
        Ok(settings)
    }
}

/// Produces a state trajectory from controls.
pub trait TimeEvolver {
    /// Fills every node of `states` (the state grid) starting from
    /// `initial_state`. A numerical failure leaves `states` partially
    /// written.
    fn simulate(
        &mut self,
        problem: &mut dyn ControlProblem,
        controls: InterpolatingView<'_>,
        initial_state: &[f64],
        states: &mut InterpolatingVector,
    ) -> OptimResult<()>;
}

/// Damped Newton iteration for one implicit timestep.
#[derive(Debug)]
pub struct NewtonSolver {
    settings: EvolverSettings,
    jacobian: PatternMatrix,
    lu: LuFactorization,
    residual: Vec<f64>,
    step: Vec<f64>,
    trial_state: Vec<f64>,
    trial_residual: Vec<f64>,
    trial_step: Vec<f64>,
}

/// Outcome of a successful timestep solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonReport {
    pub iterations: usize,
    pub residual: f64,
}

impl NewtonSolver {
    pub fn new(settings: EvolverSettings, number_of_states: usize) -> Self {
        Self {
            settings,
            jacobian: PatternMatrix::new(number_of_states, number_of_states),
            lu: LuFactorization::new(number_of_states),
            residual: vec![0.0; number_of_states],
            step: vec![0.0; number_of_states],
            trial_state: vec![0.0; number_of_states],
            trial_residual: vec![0.0; number_of_states],
            trial_step: vec![0.0; number_of_states],
        }
    }

    pub fn settings(&self) -> &EvolverSettings {
        &self.settings
    }

    /// Solves `E(.., last_state, new_state, control) = 0` for `new_state`,
    /// using its incoming value as the starting guess.
    pub fn solve(
        &mut self,
        problem: &dyn ControlProblem,
        new_state: &mut [f64],
        last_time: f64,
        new_time: f64,
        last_state: &[f64],
        control: &[f64],
    ) -> OptimResult<NewtonReport> {
        let start = new_state.to_vec();
        let mut attempt = 0;
        loop {
            let initial_damping = 0.5f64.powi(attempt as i32);
            match self.attempt(
                problem,
                new_state,
                last_time,
                new_time,
                last_state,
                control,
                initial_damping,
            ) {
                Ok(report) => return Ok(report),
                Err(err) if err.is_numerical() && attempt < self.settings.retries => {
                    debug!(new_time, attempt, "retrying Newton step with stronger damping");
                    new_state.copy_from_slice(&start);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &mut self,
        problem: &dyn ControlProblem,
        new_state: &mut [f64],
        last_time: f64,
        new_time: f64,
        last_state: &[f64],
        control: &[f64],
        initial_damping: f64,
    ) -> OptimResult<NewtonReport> {
        problem.evaluate(
            &mut self.residual,
            last_time,
            new_time,
            last_state,
            new_state,
            control,
        );
        let mut residual_norm = max_norm(&self.residual);
        let max_iterations = self.settings.maximal_number_of_newton_iterations;
        let failure = |iterations: usize, residual: f64| OptimError::NewtonFailure {
            time: new_time,
            iterations,
            residual,
        };

        for iteration in 0..max_iterations {
            if residual_norm < self.settings.tolerance {
                return Ok(NewtonReport {
                    iterations: iteration,
                    residual: residual_norm,
                });
            }

            if iteration == 0 || !self.settings.use_simplified_newton {
                self.jacobian.fill(|f| {
                    problem.d_evaluate_d_new_state(
                        f, last_time, new_time, last_state, new_state, control,
                    )
                })?;
                if self.lu.factorize(&self.jacobian).is_err() {
                    return Err(failure(iteration, residual_norm));
                }
            }

            for (s, r) in self.step.iter_mut().zip(&self.residual) {
                *s = -r;
            }
            self.lu.solve(&mut self.step)?;
            let step_norm = euclidean_norm(&self.step);

            // Affine-invariant monotonicity test on the simplified step.
            let mut damping = initial_damping;
            loop {
                for ((t, x), s) in self.trial_state.iter_mut().zip(new_state.iter()).zip(&self.step) {
                    *t = x + damping * s;
                }
                problem.evaluate(
                    &mut self.trial_residual,
                    last_time,
                    new_time,
                    last_state,
                    &self.trial_state,
                    control,
                );
                for (s, r) in self.trial_step.iter_mut().zip(&self.trial_residual) {
                    *s = -r;
                }
                self.lu.solve(&mut self.trial_step)?;
                let trial_norm = euclidean_norm(&self.trial_step);
                if trial_norm.is_finite() && trial_norm <= (1.0 - 0.5 * damping) * step_norm {
                    break;
                }
                if max_norm(&self.trial_residual) < self.settings.tolerance {
                    break;
                }
                damping *= 0.5;
                if damping < MINIMAL_DAMPING {
                    return Err(failure(iteration + 1, residual_norm));
                }
            }

            new_state.copy_from_slice(&self.trial_state);
            self.residual.copy_from_slice(&self.trial_residual);
            residual_norm = max_norm(&self.residual);
        }

        if residual_norm < self.settings.tolerance {
            return Ok(NewtonReport {
                iterations: max_iterations,
                residual: residual_norm,
            });
        }
        Err(failure(max_iterations, residual_norm))
    }
}

/// Implicit time stepping on the state grid.
#[derive(Debug)]
pub struct ImplicitTimeEvolver {
    settings: EvolverSettings,
    newton: Option<NewtonSolver>,
}

impl ImplicitTimeEvolver {
    pub fn new(settings: EvolverSettings) -> Self {
        Self {
            settings,
            newton: None,
        }
    }
}

impl TimeEvolver for ImplicitTimeEvolver {
    fn simulate(
        &mut self,
        problem: &mut dyn ControlProblem,
        controls: InterpolatingView<'_>,
        initial_state: &[f64],
        states: &mut InterpolatingVector,
    ) -> OptimResult<()> {
        let number_of_states = problem.number_of_states();
        if states.inner_length() != number_of_states {
            return Err(OptimError::DimensionMismatch {
                what: "state vector",
                expected: number_of_states,
                got: states.inner_length(),
            });
        }
        if initial_state.len() != number_of_states {
            return Err(OptimError::DimensionMismatch {
                what: "initial state",
                expected: number_of_states,
                got: initial_state.len(),
            });
        }
        if controls.inner_length() != problem.number_of_controls_per_timepoint() {
            return Err(OptimError::DimensionMismatch {
                what: "control vector",
                expected: problem.number_of_controls_per_timepoint(),
                got: controls.inner_length(),
            });
        }

        if self
            .newton
            .as_ref()
            .is_some_and(|newton| newton.jacobian.rows() != number_of_states)
        {
            self.newton = None;
        }
        let settings = &self.settings;
        let newton = self
            .newton
            .get_or_insert_with(|| NewtonSolver::new(settings.clone(), number_of_states));

        states.mut_timestep(0)?.copy_from_slice(initial_state);
        let points = states.points().to_vec();
        let mut last_state = initial_state.to_vec();
        let mut control = vec![0.0; controls.inner_length()];
        let mut total_iterations = 0;

        for (index, window) in points.windows(2).enumerate() {
            let (last_time, new_time) = (window[0], window[1]);
            controls.evaluate_into(new_time, &mut control)?;
            problem.prepare_timestep(last_time, new_time, &last_state, &control);

            let new_state = states.mut_timestep(index + 1)?;
            new_state.copy_from_slice(&last_state);
            match newton.solve(&*problem, new_state, last_time, new_time, &last_state, &control) {
                Ok(report) => total_iterations += report.iterations,
                Err(err) => {
                    warn!(last_time, new_time, error = %err, "timestep failed");
                    return Err(err);
                }
            }
            last_state.copy_from_slice(new_state);
        }

        debug!(
            steps = points.len().saturating_sub(1),
            total_iterations, "simulation finished"
        );
        Ok(())
    }
}

fn max_norm(values: &[f64]) -> f64 {
    values
        .iter()
        .fold(0.0f64, |acc, v| if v.is_nan() { f64::NAN } else { acc.max(v.abs()) })
}

fn euclidean_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}
