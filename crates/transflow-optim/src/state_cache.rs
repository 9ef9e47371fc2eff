//! Memoized forward simulations.
//!
//! An NLP solver asks for the objective, the constraints and their
//! derivatives at the same control vector in quick succession, and line
//! searches revisit rejected points. The cache keeps the last successful
//! trajectory and the key of the last numerically failed simulation so
//! neither case triggers a second simulation. Errors that are not numerical
//! (bad grids, wrong dimensions) are returned to the caller and never
//! remembered.

use tracing::debug;
use transflow_core::{Interpolating, InterpolatingVector, InterpolatingView};

use crate::error::OptimResult;
use crate::evolver::TimeEvolver;
use crate::problem::ControlProblem;

/// Memoization key of a simulation. Compared exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub controls: InterpolatingVector,
    pub state_timepoints: Vec<f64>,
    pub initial_state: Vec<f64>,
}

impl CacheEntry {
    pub fn new(controls: InterpolatingView<'_>, state_timepoints: &[f64], initial_state: &[f64]) -> Self {
        Self {
            controls: controls.to_owned_vector(),
            state_timepoints: state_timepoints.to_vec(),
            initial_state: initial_state.to_vec(),
        }
    }

    pub fn matches<I: Interpolating + ?Sized>(
        &self,
        controls: &I,
        state_timepoints: &[f64],
        initial_state: &[f64],
    ) -> bool {
        self.controls.is_identical_to(controls)
            && self.state_timepoints == state_timepoints
            && self.initial_state == initial_state
    }
}

/// Source of state trajectories for the optimizer.
pub trait StateCache {
    /// Makes the trajectory for this key available, simulating only if the
    /// key is unknown. `Ok(false)` means the simulation failed numerically.
    fn refresh_cache(
        &mut self,
        problem: &mut dyn ControlProblem,
        controls: InterpolatingView<'_>,
        state_timepoints: &[f64],
        initial_state: &[f64],
    ) -> OptimResult<bool>;

    /// Trajectory of the last successful simulation.
    fn cached_states(&self) -> Option<&InterpolatingVector>;
}

/// Two-entry memo (last success, last failure) around a [`TimeEvolver`].
#[derive(Debug)]
pub struct ControlStateCache<E> {
    evolver: E,
    success: Option<(CacheEntry, InterpolatingVector)>,
    failure: Option<CacheEntry>,
    simulations: usize,
}

impl<E: TimeEvolver> ControlStateCache<E> {
    pub fn new(evolver: E) -> Self {
        Self {
            evolver,
            success: None,
            failure: None,
            simulations: 0,
        }
    }

    /// Number of simulations run so far.
    pub fn simulation_count(&self) -> usize {
        self.simulations
    }

    pub fn evolver(&self) -> &E {
        &self.evolver
    }

    /// Cached trajectory for the key, simulating on a miss.
    ///
    /// `Ok(None)` means the simulation failed numerically, now or before
    /// for the same key.
    pub fn check_and_supply_states(
        &mut self,
        problem: &mut dyn ControlProblem,
        controls: InterpolatingView<'_>,
        state_timepoints: &[f64],
        initial_state: &[f64],
    ) -> OptimResult<Option<&InterpolatingVector>> {
        let hit = self
            .success
            .as_ref()
            .is_some_and(|(key, _)| key.matches(&controls, state_timepoints, initial_state));
        if hit {
            debug!("state cache hit");
            return Ok(self.success.as_ref().map(|(_, states)| states));
        }
        if self
            .failure
            .as_ref()
            .is_some_and(|key| key.matches(&controls, state_timepoints, initial_state))
        {
            debug!("state cache hit on a known failure");
            return Ok(None);
        }

        let mut states =
            InterpolatingVector::new(state_timepoints.to_vec(), problem.number_of_states())?;
        let entry = CacheEntry::new(controls, state_timepoints, initial_state);

        self.simulations += 1;
        match self
            .evolver
            .simulate(problem, controls, initial_state, &mut states)
        {
            Ok(()) => {
                debug!(simulations = self.simulations, "stored new state trajectory");
                self.success = Some((entry, states));
                Ok(self.success.as_ref().map(|(_, states)| states))
            }
            Err(err) if err.is_numerical() => {
                debug!(error = %err, "simulation failed, remembering control");
                self.failure = Some(entry);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl<E: TimeEvolver> StateCache for ControlStateCache<E> {
    fn refresh_cache(
        &mut self,
        problem: &mut dyn ControlProblem,
        controls: InterpolatingView<'_>,
        state_timepoints: &[f64],
        initial_state: &[f64],
    ) -> OptimResult<bool> {
        Ok(self
            .check_and_supply_states(problem, controls, state_timepoints, initial_state)?
            .is_some())
    }

    fn cached_states(&self) -> Option<&InterpolatingVector> {
        self.success.as_ref().map(|(_, states)| states)
    }
}
