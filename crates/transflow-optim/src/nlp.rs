//! Callback surface offered to nonlinear-programming solvers.
//!
//! Evaluators return `Ok(false)` when the point cannot be evaluated (the
//! forward simulation or a factorization failed); solvers treat that as a
//! request to try another step. `Err` is reserved for misuse such as
//! buffers of the wrong length.
//!
//! Implementors cache derived quantities per control vector and rely on
//! [`NlpCallbacks::new_x`] being called before the first evaluation at a new
//! vector. [`NewXTracker`] does that bookkeeping for solvers that do not
//! report it.

use tracing::trace;

use crate::error::OptimResult;

pub trait NlpCallbacks {
    /// Length of the flat control vector.
    fn number_of_controls(&self) -> usize;
    fn number_of_constraints(&self) -> usize;
    fn nonzeros_in_jacobian(&self) -> usize;

    /// Signals that the next evaluation uses a different control vector.
    fn new_x(&mut self);

    fn evaluate_objective(&mut self, x: &[f64], objective: &mut f64) -> OptimResult<bool>;
    fn evaluate_constraints(&mut self, x: &[f64], constraints: &mut [f64]) -> OptimResult<bool>;
    fn evaluate_objective_gradient(&mut self, x: &[f64], gradient: &mut [f64]) -> OptimResult<bool>;
    fn evaluate_constraint_jacobian(&mut self, x: &[f64], values: &mut [f64]) -> OptimResult<bool>;

    /// Sparsity pattern matching the value order of
    /// [`NlpCallbacks::evaluate_constraint_jacobian`].
    fn supply_constraint_jacobian_indices(&self, rows: &mut [usize], columns: &mut [usize]) -> OptimResult<()>;

    fn initial_controls(&self) -> OptimResult<Vec<f64>>;
    fn lower_bounds(&self) -> OptimResult<Vec<f64>>;
    fn upper_bounds(&self) -> OptimResult<Vec<f64>>;
    fn constraint_lower_bounds(&self) -> OptimResult<Vec<f64>>;
    fn constraint_upper_bounds(&self) -> OptimResult<Vec<f64>>;
}

/// Calls `new_x` on the wrapped callbacks whenever the control vector
/// differs bit for bit from the previous one.
#[derive(Debug)]
pub struct NewXTracker<C> {
    inner: C,
    last_x: Option<Vec<f64>>,
}

impl<C: NlpCallbacks> NewXTracker<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            last_x: None,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn track(&mut self, x: &[f64]) {
        let unchanged = self.last_x.as_deref().is_some_and(|last| {
            last.len() == x.len() && last.iter().zip(x).all(|(a, b)| a.to_bits() == b.to_bits())
        });
        if !unchanged {
            trace!("new control vector");
            self.inner.new_x();
            match &mut self.last_x {
                Some(last) => {
                    last.clear();
                    last.extend_from_slice(x);
                }
                None => self.last_x = Some(x.to_vec()),
            }
        }
    }
}

impl<C: NlpCallbacks> NlpCallbacks for NewXTracker<C> {
    fn number_of_controls(&self) -> usize {
        self.inner.number_of_controls()
    }

    fn number_of_constraints(&self) -> usize {
        self.inner.number_of_constraints()
    }

    fn nonzeros_in_jacobian(&self) -> usize {
        self.inner.nonzeros_in_jacobian()
    }

    fn new_x(&mut self) {
        self.last_x = None;
        self.inner.new_x();
    }

    fn evaluate_objective(&mut self, x: &[f64], objective: &mut f64) -> OptimResult<bool> {
        self.track(x);
        self.inner.evaluate_objective(x, objective)
    }

    fn evaluate_constraints(&mut self, x: &[f64], constraints: &mut [f64]) -> OptimResult<bool> {
        self.track(x);
        self.inner.evaluate_constraints(x, constraints)
    }

    fn evaluate_objective_gradient(&mut self, x: &[f64], gradient: &mut [f64]) -> OptimResult<bool> {
        self.track(x);
        self.inner.evaluate_objective_gradient(x, gradient)
    }

    fn evaluate_constraint_jacobian(&mut self, x: &[f64], values: &mut [f64]) -> OptimResult<bool> {
        self.track(x);
        self.inner.evaluate_constraint_jacobian(x, values)
    }

    fn supply_constraint_jacobian_indices(&self, rows: &mut [usize], columns: &mut [usize]) -> OptimResult<()> {
        self.inner.supply_constraint_jacobian_indices(rows, columns)
    }

    fn initial_controls(&self) -> OptimResult<Vec<f64>> {
        self.inner.initial_controls()
    }

    fn lower_bounds(&self) -> OptimResult<Vec<f64>> {
        self.inner.lower_bounds()
    }

    fn upper_bounds(&self) -> OptimResult<Vec<f64>> {
        self.inner.upper_bounds()
    }

    fn constraint_lower_bounds(&self) -> OptimResult<Vec<f64>> {
        self.inner.constraint_lower_bounds()
    }

    fn constraint_upper_bounds(&self) -> OptimResult<Vec<f64>> {
        self.inner.constraint_upper_bounds()
    }
}
