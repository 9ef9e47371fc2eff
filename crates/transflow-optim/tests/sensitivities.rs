//! Adjoint derivatives of a small nonlinear network against finite
//! differences of the simulated objective and constraints.

use transflow_core::{Interpolating, InterpolatingVector};
use transflow_optim::{
    ConstraintProblem, ControlProblem, ControlStateCache, CostProblem, EvolverSettings,
    ImplicitOptimizer, ImplicitTimeEvolver, InitialValues, JacobianStorage, MatrixFiller,
    NewXTracker, NlpCallbacks, TimeGrids,
};

/// Two nodes with a cubic damping on the first and a bilinear coupling of
/// both controls into the second.
struct TwoNodes;

impl ControlProblem for TwoNodes {
    fn number_of_states(&self) -> usize {
        2
    }

    fn number_of_controls_per_timepoint(&self) -> usize {
        2
    }

    fn evaluate(&self, r: &mut [f64], t0: f64, t1: f64, last: &[f64], x: &[f64], u: &[f64]) {
        let dt = t1 - t0;
        r[0] = x[0] - last[0] + dt * (0.5 * x[0] + 0.1 * x[0].powi(3) - u[0]);
        r[1] = x[1] - last[1] + dt * (x[1] - x[0] - u[0] * u[1]);
    }

    fn d_evaluate_d_new_state(&self, f: &mut dyn MatrixFiller, t0: f64, t1: f64, _: &[f64], x: &[f64], _: &[f64]) {
        let dt = t1 - t0;
        f.set_coefficient(0, 0, 1.0 + dt * (0.5 + 0.3 * x[0] * x[0]));
        f.set_coefficient(1, 0, -dt);
        f.set_coefficient(1, 1, 1.0 + dt);
    }

    fn d_evaluate_d_last_state(&self, f: &mut dyn MatrixFiller, _: f64, _: f64, _: &[f64], _: &[f64], _: &[f64]) {
        f.set_coefficient(0, 0, -1.0);
        f.set_coefficient(1, 1, -1.0);
    }

    fn d_evaluate_d_control(&self, f: &mut dyn MatrixFiller, t0: f64, t1: f64, _: &[f64], _: &[f64], u: &[f64]) {
        let dt = t1 - t0;
        f.set_coefficient(0, 0, -dt);
        f.set_coefficient(1, 0, -dt * u[1]);
        f.set_coefficient(1, 1, -dt * u[0]);
    }
}

impl CostProblem for TwoNodes {
    fn evaluate_cost(&self, t: f64, x: &[f64], u: &[f64]) -> f64 {
        x[0] * x[0] + 0.5 * x[1] * x[1] + 0.1 * (u[0] * u[0] + u[1] * u[1]) + t * x[1] * u[0]
    }

    fn d_evaluate_cost_d_state(&self, f: &mut dyn MatrixFiller, t: f64, x: &[f64], u: &[f64]) {
        f.set_coefficient(0, 0, 2.0 * x[0]);
        f.set_coefficient(0, 1, x[1] + t * u[0]);
    }

    fn d_evaluate_cost_d_control(&self, f: &mut dyn MatrixFiller, t: f64, x: &[f64], u: &[f64]) {
        f.set_coefficient(0, 0, 0.2 * u[0] + t * x[1]);
        f.set_coefficient(0, 1, 0.2 * u[1]);
    }
}

impl ConstraintProblem for TwoNodes {
    fn number_of_constraints_per_timepoint(&self) -> usize {
        1
    }

    fn evaluate_constraint(&self, values: &mut [f64], _: f64, x: &[f64], u: &[f64]) {
        values[0] = x[0] * x[1] + u[1];
    }

    fn d_evaluate_constraint_d_state(&self, f: &mut dyn MatrixFiller, _: f64, x: &[f64], _: &[f64]) {
        f.set_coefficient(0, 0, x[1]);
        f.set_coefficient(0, 1, x[0]);
    }

    fn d_evaluate_constraint_d_control(&self, f: &mut dyn MatrixFiller, _: f64, _: &[f64], _: &[f64]) {
        f.set_coefficient(0, 1, 1.0);
    }
}

fn constant(value: f64) -> InterpolatingVector {
    InterpolatingVector::with_values(vec![0.0, 2.0], 2, vec![value; 4]).unwrap()
}

fn optimizer() -> NewXTracker<ImplicitOptimizer<TwoNodes>> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let settings = EvolverSettings {
        tolerance: 1e-13,
        ..EvolverSettings::default()
    };
    let cache = ControlStateCache::new(ImplicitTimeEvolver::new(settings));
    let constraint_bounds = |value: f64| {
        InterpolatingVector::with_values(vec![0.0, 2.0], 1, vec![value; 2]).unwrap()
    };
    let optimizer = ImplicitOptimizer::new(
        TwoNodes,
        Box::new(cache),
        TimeGrids {
            states: vec![0.0, 0.5, 1.0, 1.25, 2.0],
            controls: vec![0.0, 0.8, 2.0],
            constraints: vec![0.5, 1.25, 2.0],
        },
        vec![1.0, 0.5],
        InitialValues {
            controls: constant(0.3),
            lower_bounds: constant(-2.0),
            upper_bounds: constant(2.0),
            constraint_lower_bounds: constraint_bounds(-1.0),
            constraint_upper_bounds: constraint_bounds(1.0),
        },
    )
    .unwrap();
    NewXTracker::new(optimizer)
}

const CONTROLS: [f64; 6] = [0.4, -0.3, 0.9, 0.2, -0.5, 0.7];
const STEP: f64 = 1e-5;

fn objective(nlp: &mut impl NlpCallbacks, x: &[f64]) -> f64 {
    let mut value = 0.0;
    assert!(nlp.evaluate_objective(x, &mut value).unwrap());
    value
}

fn constraints(nlp: &mut impl NlpCallbacks, x: &[f64]) -> Vec<f64> {
    let mut values = vec![0.0; nlp.number_of_constraints()];
    assert!(nlp.evaluate_constraints(x, &mut values).unwrap());
    values
}

fn perturbed(index: usize, delta: f64) -> Vec<f64> {
    let mut x = CONTROLS.to_vec();
    x[index] += delta;
    x
}

#[test]
fn test_gradient_matches_finite_differences() {
    let mut nlp = optimizer();
    let mut gradient = vec![0.0; nlp.number_of_controls()];
    assert!(nlp.evaluate_objective_gradient(&CONTROLS, &mut gradient).unwrap());

    for index in 0..CONTROLS.len() {
        let forward = objective(&mut nlp, &perturbed(index, STEP));
        let backward = objective(&mut nlp, &perturbed(index, -STEP));
        let estimate = (forward - backward) / (2.0 * STEP);
        assert!(
            (gradient[index] - estimate).abs() < 1e-6 * (1.0 + estimate.abs()),
            "control {index}: adjoint {} vs finite difference {estimate}",
            gradient[index]
        );
    }
}

#[test]
fn test_jacobian_matches_finite_differences() {
    let mut nlp = optimizer();
    let nonzeros = nlp.nonzeros_in_jacobian();
    let mut values = vec![0.0; nonzeros];
    let mut rows = vec![0; nonzeros];
    let mut columns = vec![0; nonzeros];
    assert!(nlp.evaluate_constraint_jacobian(&CONTROLS, &mut values).unwrap());
    nlp.supply_constraint_jacobian_indices(&mut rows, &mut columns)
        .unwrap();

    let mut dense = vec![vec![0.0; CONTROLS.len()]; nlp.number_of_constraints()];
    for k in 0..nonzeros {
        dense[rows[k]][columns[k]] = values[k];
    }

    for column in 0..CONTROLS.len() {
        let forward = constraints(&mut nlp, &perturbed(column, STEP));
        let backward = constraints(&mut nlp, &perturbed(column, -STEP));
        for row in 0..forward.len() {
            let estimate = (forward[row] - backward[row]) / (2.0 * STEP);
            assert!(
                (dense[row][column] - estimate).abs() < 1e-6 * (1.0 + estimate.abs()),
                "entry ({row}, {column}): adjoint {} vs finite difference {estimate}",
                dense[row][column]
            );
        }
    }
}

#[test]
fn test_staircase_pattern_of_the_jacobian() {
    let nlp = optimizer();
    // Constraint at 0.5 depends on the controls at 0.0 and 0.8, the later
    // ones on every node.
    assert_eq!(nlp.number_of_constraints(), 3);
    assert_eq!(nlp.nonzeros_in_jacobian(), 2 * 3 + 2 * 3 + 2 * 2);
    let structure = nlp.inner().constraint_jacobian().structure();
    assert_eq!(structure.block_column_offsets(), &[0, 0, 1, 3]);
}

#[test]
fn test_gradient_is_reproducible_after_moving_away() {
    let mut nlp = optimizer();
    let mut gradient = vec![0.0; 6];
    let mut values = vec![0.0; nlp.nonzeros_in_jacobian()];
    objective(&mut nlp, &CONTROLS);
    constraints(&mut nlp, &CONTROLS);
    nlp.evaluate_objective_gradient(&CONTROLS, &mut gradient)
        .unwrap();
    nlp.evaluate_constraint_jacobian(&CONTROLS, &mut values)
        .unwrap();
    let first = gradient.clone();

    objective(&mut nlp, &perturbed(0, 0.1));
    nlp.evaluate_objective_gradient(&CONTROLS, &mut gradient)
        .unwrap();
    assert_eq!(first, gradient);

    let states = nlp.inner().states().unwrap();
    assert_eq!(states.points(), &[0.0, 0.5, 1.0, 1.25, 2.0]);
}

#[test]
fn test_bounds_follow_the_grids() {
    let nlp = optimizer();
    assert_eq!(nlp.initial_controls().unwrap(), vec![0.3; 6]);
    assert_eq!(nlp.lower_bounds().unwrap(), vec![-2.0; 6]);
    assert_eq!(nlp.upper_bounds().unwrap(), vec![2.0; 6]);
    assert_eq!(nlp.constraint_lower_bounds().unwrap(), vec![-1.0; 3]);
    assert_eq!(nlp.constraint_upper_bounds().unwrap(), vec![1.0; 3]);
}

/// `x_new^2 + 1 + u^2 = 0` has no real solution.
struct Unsolvable;

impl ControlProblem for Unsolvable {
    fn number_of_states(&self) -> usize {
        1
    }

    fn number_of_controls_per_timepoint(&self) -> usize {
        1
    }

    fn evaluate(&self, r: &mut [f64], _: f64, _: f64, _: &[f64], x: &[f64], u: &[f64]) {
        r[0] = x[0] * x[0] + 1.0 + u[0] * u[0];
    }

    fn d_evaluate_d_new_state(&self, f: &mut dyn MatrixFiller, _: f64, _: f64, _: &[f64], x: &[f64], _: &[f64]) {
        f.set_coefficient(0, 0, 2.0 * x[0]);
    }

    fn d_evaluate_d_last_state(&self, _: &mut dyn MatrixFiller, _: f64, _: f64, _: &[f64], _: &[f64], _: &[f64]) {}

    fn d_evaluate_d_control(&self, f: &mut dyn MatrixFiller, _: f64, _: f64, _: &[f64], _: &[f64], u: &[f64]) {
        f.set_coefficient(0, 0, 2.0 * u[0]);
    }
}

impl CostProblem for Unsolvable {
    fn evaluate_cost(&self, _: f64, x: &[f64], _: &[f64]) -> f64 {
        x[0]
    }

    fn d_evaluate_cost_d_state(&self, f: &mut dyn MatrixFiller, _: f64, _: &[f64], _: &[f64]) {
        f.set_coefficient(0, 0, 1.0);
    }

    fn d_evaluate_cost_d_control(&self, _: &mut dyn MatrixFiller, _: f64, _: &[f64], _: &[f64]) {}
}

impl ConstraintProblem for Unsolvable {
    fn number_of_constraints_per_timepoint(&self) -> usize {
        0
    }

    fn evaluate_constraint(&self, _: &mut [f64], _: f64, _: &[f64], _: &[f64]) {}

    fn d_evaluate_constraint_d_state(&self, _: &mut dyn MatrixFiller, _: f64, _: &[f64], _: &[f64]) {}

    fn d_evaluate_constraint_d_control(&self, _: &mut dyn MatrixFiller, _: f64, _: &[f64], _: &[f64]) {}
}

#[test]
fn test_failed_simulation_is_not_evaluable() {
    let one = |value: f64| InterpolatingVector::with_values(vec![0.0, 1.0], 1, vec![value; 2]).unwrap();
    let none = || InterpolatingVector::new(vec![0.0], 0).unwrap();
    let mut nlp = NewXTracker::new(
        ImplicitOptimizer::new(
            Unsolvable,
            Box::new(ControlStateCache::new(ImplicitTimeEvolver::new(
                EvolverSettings::default(),
            ))),
            TimeGrids {
                states: vec![0.0, 0.5, 1.0],
                controls: vec![0.0, 1.0],
                constraints: Vec::new(),
            },
            vec![1.0],
            InitialValues {
                controls: one(0.0),
                lower_bounds: one(-1.0),
                upper_bounds: one(1.0),
                constraint_lower_bounds: none(),
                constraint_upper_bounds: none(),
            },
        )
        .unwrap(),
    );

    assert_eq!(nlp.number_of_constraints(), 0);
    assert_eq!(nlp.nonzeros_in_jacobian(), 0);
    let mut value = 0.0;
    assert!(!nlp.evaluate_objective(&[0.5, 0.5], &mut value).unwrap());
    let mut gradient = [0.0; 2];
    assert!(!nlp
        .evaluate_objective_gradient(&[0.5, 0.5], &mut gradient)
        .unwrap());
    assert!(nlp.constraint_lower_bounds().unwrap().is_empty());
}

/// `u * (x_new - x_last) = 0`: every control keeps the state constant, but a
/// zero control leaves `∂E/∂x_new` singular.
struct Frozen;

impl ControlProblem for Frozen {
    fn number_of_states(&self) -> usize {
        1
    }

    fn number_of_controls_per_timepoint(&self) -> usize {
        1
    }

    fn evaluate(&self, r: &mut [f64], _: f64, _: f64, last: &[f64], x: &[f64], u: &[f64]) {
        r[0] = u[0] * (x[0] - last[0]);
    }

    fn d_evaluate_d_new_state(&self, f: &mut dyn MatrixFiller, _: f64, _: f64, _: &[f64], _: &[f64], u: &[f64]) {
        f.set_coefficient(0, 0, u[0]);
    }

    fn d_evaluate_d_last_state(&self, f: &mut dyn MatrixFiller, _: f64, _: f64, _: &[f64], _: &[f64], u: &[f64]) {
        f.set_coefficient(0, 0, -u[0]);
    }

    fn d_evaluate_d_control(&self, f: &mut dyn MatrixFiller, _: f64, _: f64, last: &[f64], x: &[f64], _: &[f64]) {
        f.set_coefficient(0, 0, x[0] - last[0]);
    }
}

impl CostProblem for Frozen {
    fn evaluate_cost(&self, _: f64, x: &[f64], u: &[f64]) -> f64 {
        x[0] * x[0] + u[0] * u[0]
    }

    fn d_evaluate_cost_d_state(&self, f: &mut dyn MatrixFiller, _: f64, x: &[f64], _: &[f64]) {
        f.set_coefficient(0, 0, 2.0 * x[0]);
    }

    fn d_evaluate_cost_d_control(&self, f: &mut dyn MatrixFiller, _: f64, _: &[f64], u: &[f64]) {
        f.set_coefficient(0, 0, 2.0 * u[0]);
    }
}

impl ConstraintProblem for Frozen {
    fn number_of_constraints_per_timepoint(&self) -> usize {
        1
    }

    fn evaluate_constraint(&self, values: &mut [f64], _: f64, x: &[f64], u: &[f64]) {
        values[0] = x[0] + u[0];
    }

    fn d_evaluate_constraint_d_state(&self, f: &mut dyn MatrixFiller, _: f64, _: &[f64], _: &[f64]) {
        f.set_coefficient(0, 0, 1.0);
    }

    fn d_evaluate_constraint_d_control(&self, f: &mut dyn MatrixFiller, _: f64, _: &[f64], _: &[f64]) {
        f.set_coefficient(0, 0, 1.0);
    }
}

#[test]
fn test_singular_step_during_sweep_is_not_evaluable() {
    let one = |value: f64| InterpolatingVector::with_values(vec![0.0, 2.0], 1, vec![value; 2]).unwrap();
    let mut nlp = NewXTracker::new(
        ImplicitOptimizer::new(
            Frozen,
            Box::new(ControlStateCache::new(ImplicitTimeEvolver::new(
                EvolverSettings::default(),
            ))),
            TimeGrids {
                states: vec![0.0, 1.0, 2.0],
                controls: vec![0.0, 1.0, 2.0],
                constraints: vec![2.0],
            },
            vec![1.0],
            InitialValues {
                controls: one(1.0),
                lower_bounds: one(-1.0),
                upper_bounds: one(1.0),
                constraint_lower_bounds: one(-5.0),
                constraint_upper_bounds: one(5.0),
            },
        )
        .unwrap(),
    );
    let regular = [1.0, 1.0, 1.0];
    let degenerate = [1.0, 0.0, 1.0];
    let expected_gradient = [0.0, 2.0, 1.0];
    let expected_jacobian = [0.0, 0.0, 1.0];
    let close = |a: &[f64], b: &[f64]| a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-12);

    let mut gradient = [0.0; 3];
    let mut values = vec![0.0; nlp.nonzeros_in_jacobian()];
    assert_eq!(values.len(), 3);
    assert!(nlp.evaluate_objective_gradient(&regular, &mut gradient).unwrap());
    assert!(close(&gradient, &expected_gradient), "{gradient:?}");
    assert!(nlp.evaluate_constraint_jacobian(&regular, &mut values).unwrap());
    assert!(close(&values, &expected_jacobian), "{values:?}");

    // The simulation itself succeeds at the degenerate point.
    assert!(objective(&mut nlp, &degenerate).is_finite());
    assert_eq!(constraints(&mut nlp, &degenerate).len(), 1);

    let mut untouched = [7.0; 3];
    assert!(!nlp.evaluate_objective_gradient(&degenerate, &mut untouched).unwrap());
    assert_eq!(untouched, [7.0; 3]);
    let mut untouched_values = vec![7.0; 3];
    assert!(!nlp
        .evaluate_constraint_jacobian(&degenerate, &mut untouched_values)
        .unwrap());
    assert_eq!(untouched_values, vec![7.0; 3]);

    // A failed sweep keeps the results of the last successful one.
    assert!(close(
        nlp.inner().objective_gradient().values(),
        &expected_gradient
    ));
    assert!(close(
        nlp.inner().constraint_jacobian().values(),
        &expected_jacobian
    ));

    gradient = [0.0; 3];
    assert!(nlp.evaluate_objective_gradient(&regular, &mut gradient).unwrap());
    assert!(close(&gradient, &expected_gradient), "{gradient:?}");
    values.fill(0.0);
    assert!(nlp.evaluate_constraint_jacobian(&regular, &mut values).unwrap());
    assert!(close(&values, &expected_jacobian), "{values:?}");
}
