//! End-to-end planning scenarios against the reference oracle

use fractionation::{
    AdmmOracle, BoundSpec, HealthDynamics, OpenLoopPlanner, OptimizationOracle, PlanError,
    PlanOptions, Prescription, Problem, RecedingHorizonPlanner, Solution, SolveOptions,
    SolveStatus,
};
use nalgebra::{DMatrix, DVector};
use std::cell::Cell;
use std::time::Duration;

const TOL: f64 = 1e-3;

/// Route planner logs to the test output, filtered by `RUST_LOG`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "fractionation=warn".to_string()),
        )
        .with_test_writer()
        .try_init();
}

fn scalar_dynamics(f: f64, g: f64) -> HealthDynamics {
    HealthDynamics::new(DMatrix::from_element(1, 1, f), DMatrix::from_element(1, 1, g)).unwrap()
}

fn unit_influence(stages: usize) -> Vec<DMatrix<f64>> {
    vec![DMatrix::from_element(1, 1, 1.0); stages]
}

fn column(values: &[f64]) -> DMatrix<f64> {
    DMatrix::from_row_slice(values.len(), 1, values)
}

/// Delegates to the reference oracle but reports `Infeasible` on one call
struct FailingOnCall {
    inner: AdmmOracle,
    fail_at: usize,
    calls: Cell<usize>,
}

impl OptimizationOracle for FailingOnCall {
    fn solve(&self, problem: &Problem, options: &SolveOptions) -> Solution {
        let call = self.calls.get();
        self.calls.set(call + 1);
        if call == self.fail_at {
            return Solution::failed(SolveStatus::Infeasible, Duration::ZERO, 0);
        }
        self.inner.solve(problem, options)
    }
}

/// Counts calls without solving anything
#[derive(Default)]
struct CountingOracle {
    calls: Cell<usize>,
}

impl OptimizationOracle for CountingOracle {
    fn solve(&self, _problem: &Problem, _options: &SolveOptions) -> Solution {
        self.calls.set(self.calls.get() + 1);
        Solution::failed(SolveStatus::SolverError, Duration::ZERO, 0)
    }
}

#[test]
fn test_three_stage_scalar_plan() {
    init_tracing();
    let rx = Prescription::new(column(&[1.0, 1.0, 1.0]));
    let dynamics = scalar_dynamics(0.5, 1.0);
    let plan = OpenLoopPlanner::new(AdmmOracle::new())
        .plan(&unit_influence(3), &dynamics, &DVector::zeros(1), &rx)
        .unwrap();

    assert!(plan.status.is_optimal());
    assert_eq!(plan.stages(), 3);
    for t in 0..3 {
        assert!((plan.doses[(t, 0)] - 1.0).abs() < TOL, "stage {}", t);
        assert!((plan.beams[(t, 0)] - 1.0).abs() < TOL);
        let expected = 0.5 * plan.health[(t, 0)] + plan.doses[(t, 0)];
        assert!((plan.health[(t + 1, 0)] - expected).abs() < 1e-12);
    }
    assert!(plan.objective.abs() < TOL);
}

#[test]
fn test_open_loop_matches_receding_without_coupling() {
    init_tracing();
    let rx = Prescription::new(column(&[1.0, 2.0, 0.5]));
    let dynamics = scalar_dynamics(0.8, 1.0);
    let h_init = DVector::from_element(1, 0.3);

    let open = OpenLoopPlanner::new(AdmmOracle::new())
        .plan(&unit_influence(3), &dynamics, &h_init, &rx)
        .unwrap();
    let receding = RecedingHorizonPlanner::new(AdmmOracle::new())
        .plan(&unit_influence(3), &dynamics, &h_init, &rx)
        .unwrap();

    assert_eq!(open.doses.shape(), receding.doses.shape());
    for t in 0..3 {
        assert!((open.doses[(t, 0)] - receding.doses[(t, 0)]).abs() < TOL);
    }
    for t in 0..4 {
        assert!((open.health[(t, 0)] - receding.health[(t, 0)]).abs() < 10.0 * TOL);
    }
    assert!((open.objective - receding.objective).abs() < 10.0 * TOL);
}

#[test]
fn test_recovery_padding() {
    init_tracing();
    let rx = Prescription::new(column(&[1.0, 1.0]));
    let planner = OpenLoopPlanner::new(AdmmOracle::new())
        .with_options(PlanOptions::new().recovery_stages(3));
    let plan = planner
        .plan(&unit_influence(2), &scalar_dynamics(0.5, 1.0), &DVector::zeros(1), &rx)
        .unwrap();

    assert_eq!(plan.beams.shape(), (5, 1));
    assert_eq!(plan.doses.shape(), (5, 1));
    assert_eq!(plan.health.shape(), (6, 1));
    for t in 2..5 {
        assert_eq!(plan.doses[(t, 0)], 0.0);
        assert_eq!(plan.beams[(t, 0)], 0.0);
        assert!((plan.health[(t + 1, 0)] - 0.5 * plan.health[(t, 0)]).abs() < 1e-12);
    }
}

#[test]
fn test_recovery_bounds_shape_checked() {
    init_tracing();
    let rx = Prescription::new(column(&[1.0, 1.0]))
        .recovery_bounds(BoundSpec::new().upper(DMatrix::from_element(4, 1, 10.0)));
    let planner = OpenLoopPlanner::new(AdmmOracle::new())
        .with_options(PlanOptions::new().recovery_stages(2));
    assert!(matches!(
        planner.plan(&unit_influence(2), &scalar_dynamics(0.5, 1.0), &DVector::zeros(1), &rx),
        Err(PlanError::Validation(_))
    ));
}

#[test]
fn test_shape_errors_precede_any_solve() {
    init_tracing();
    let oracle = CountingOracle::default();
    let rx = Prescription::new(column(&[1.0, 1.0]));
    let influence = vec![DMatrix::from_element(1, 1, 1.0), DMatrix::from_element(2, 1, 1.0)];

    let open = OpenLoopPlanner::new(&oracle).plan(
        &influence,
        &scalar_dynamics(0.5, 1.0),
        &DVector::zeros(1),
        &rx,
    );
    assert!(matches!(open, Err(PlanError::Validation(_))));

    let receding = RecedingHorizonPlanner::new(&oracle).plan(
        &unit_influence(2),
        &scalar_dynamics(0.5, 1.0),
        &DVector::zeros(3),
        &rx,
    );
    assert!(matches!(receding, Err(PlanError::Validation(_))));
    assert_eq!(oracle.calls.get(), 0);
}

#[test]
fn test_receding_aborts_on_failed_stage() {
    init_tracing();
    let oracle = FailingOnCall {
        inner: AdmmOracle::new(),
        fail_at: 1,
        calls: Cell::new(0),
    };
    let rx = Prescription::new(column(&[1.0, 1.0, 1.0]));
    let result = RecedingHorizonPlanner::new(&oracle).plan(
        &unit_influence(3),
        &scalar_dynamics(0.5, 1.0),
        &DVector::zeros(1),
        &rx,
    );

    assert_eq!(
        result.unwrap_err(),
        PlanError::Solver {
            stage: 1,
            status: SolveStatus::Infeasible
        }
    );
    assert_eq!(oracle.calls.get(), 2);
}

#[test]
fn test_dose_upper_bound_respected() {
    init_tracing();
    let rx = Prescription::new(column(&[2.0, 2.0]))
        .dose_bounds(BoundSpec::new().upper(1.5));
    let plan = OpenLoopPlanner::new(AdmmOracle::new())
        .plan(&unit_influence(2), &scalar_dynamics(0.5, 1.0), &DVector::zeros(1), &rx)
        .unwrap();

    for t in 0..2 {
        assert!(plan.doses[(t, 0)] <= 1.5 + TOL);
        assert!((plan.doses[(t, 0)] - 1.5).abs() < TOL);
    }
    // under by 0.5 at unit weight in both stages
    assert!((plan.objective - 1.0).abs() < TOL);
}

#[test]
fn test_receding_slices_array_bounds_per_stage() {
    init_tracing();
    let rx = Prescription::new(column(&[2.0, 2.0, 2.0]))
        .dose_bounds(BoundSpec::new().upper(column(&[1.5, 9.0, 9.0])));
    let plan = RecedingHorizonPlanner::new(AdmmOracle::new())
        .plan(&unit_influence(3), &scalar_dynamics(0.5, 1.0), &DVector::zeros(1), &rx)
        .unwrap();

    assert!((plan.doses[(0, 0)] - 1.5).abs() < TOL);
    assert!((plan.doses[(1, 0)] - 2.0).abs() < TOL);
    assert!((plan.doses[(2, 0)] - 2.0).abs() < TOL);
    // only stage 0 falls short, by 0.5 at unit weight
    assert!((plan.objective - 0.5).abs() < TOL);
}

#[test]
fn test_health_bound_limits_dose() {
    init_tracing();
    // h_1 = d_0 must stay below 0.6 even though 1.0 is prescribed
    let rx = Prescription::new(column(&[1.0, 0.0]))
        .health_bounds(BoundSpec::new().upper(0.6));
    let plan = OpenLoopPlanner::new(AdmmOracle::new())
        .plan(&unit_influence(2), &scalar_dynamics(1.0, 1.0), &DVector::zeros(1), &rx)
        .unwrap();

    assert!(plan.health[(1, 0)] <= 0.6 + TOL);
    assert!((plan.doses[(0, 0)] - 0.6).abs() < TOL);
}

#[test]
fn test_health_weight_trades_off_dose() {
    init_tracing();
    // 1·|d - 1| + 2·d²: the marginal cost of dose passes 1 at d = 0.25
    let rx = Prescription::new(column(&[1.0])).health_weights(2.0);
    let plan = OpenLoopPlanner::new(AdmmOracle::new())
        .plan(&unit_influence(1), &scalar_dynamics(1.0, 1.0), &DVector::zeros(1), &rx)
        .unwrap();

    assert!((plan.doses[(0, 0)] - 0.25).abs() < TOL);
    assert!((plan.objective - (0.75 + 2.0 * 0.0625)).abs() < TOL);
}

#[test]
fn test_zero_time_limit_interrupts() {
    init_tracing();
    let rx = Prescription::new(column(&[1.0]));
    let planner = OpenLoopPlanner::new(AdmmOracle::new())
        .with_options(PlanOptions::new().time_limit(Duration::ZERO));
    let result = planner.plan(&unit_influence(1), &scalar_dynamics(1.0, 1.0), &DVector::zeros(1), &rx);

    assert_eq!(
        result.unwrap_err(),
        PlanError::Solver {
            stage: 0,
            status: SolveStatus::Interrupted
        }
    );
}

#[test]
fn test_two_structure_plan_serializes() {
    init_tracing();
    let influence = vec![DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]); 2];
    let dynamics = HealthDynamics::new(
        DMatrix::from_diagonal_element(2, 2, 0.9),
        DMatrix::from_diagonal_element(2, 2, -0.1),
    )
    .unwrap();
    let rx = Prescription::new(DMatrix::from_row_slice(2, 2, &[2.0, 2.0, 2.0, 2.0]));
    let plan = OpenLoopPlanner::new(AdmmOracle::new())
        .plan(&influence, &dynamics, &DVector::from_element(2, 1.0), &rx)
        .unwrap();

    let total = plan.doses[(0, 0)] + plan.doses[(0, 1)];
    assert!((total - 2.0).abs() < TOL);

    let json = serde_json::to_value(&plan).unwrap();
    assert_eq!(json["status"], "optimal");
    assert!(json.get("health").is_some());
}
