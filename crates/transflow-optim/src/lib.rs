//! # transflow-optim: sensitivities of implicitly time-stepped control problems
//!
//! A problem supplies the residual `E(t_{k-1}, t_k, x_{k-1}, x_k, u(t_k)) = 0`
//! of one implicit timestep together with a running cost and pointwise
//! constraints ([`OptimizableProblem`]). This crate simulates it
//! ([`ImplicitTimeEvolver`]), memoizes trajectories ([`ControlStateCache`])
//! and computes the objective gradient and the block-staircase constraint
//! Jacobian with one backward adjoint sweep per control vector
//! ([`ImplicitOptimizer`]).
//!
//! The optimizer speaks [`NlpCallbacks`], a solver-neutral callback surface:
//! evaluators return `Ok(false)` for points that cannot be evaluated and
//! `Err` for misuse.

mod adjoint;
pub mod derivative_cache;
pub mod error;
pub mod evolver;
pub mod jacobian;
pub mod lu;
pub mod matrix;
pub mod nlp;
pub mod optimizer;
pub mod problem;
pub mod state_cache;

pub use derivative_cache::{EquationDerivativeCache, EquationDerivatives};
pub use error::{OptimError, OptimResult};
pub use evolver::{EvolverSettings, ImplicitTimeEvolver, NewtonReport, NewtonSolver, TimeEvolver};
pub use jacobian::{
    ColumnBlock, ColumnBlockMut, ConstraintJacobian, JacobianStorage, JacobianStructure,
    MappedConstraintJacobian,
};
pub use lu::LuFactorization;
pub use matrix::{MatrixFiller, PatternMatrix};
pub use nlp::{NewXTracker, NlpCallbacks};
pub use optimizer::{ImplicitOptimizer, InitialValues, TimeGrids};
pub use problem::{ConstraintProblem, ControlProblem, CostProblem, OptimizableProblem};
pub use state_cache::{CacheEntry, ControlStateCache, StateCache};
