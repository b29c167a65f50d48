//! Open-loop planning
//!
//! One convex program over the full treatment horizon. The problem
//! builder here is shared with the receding-horizon planner, which calls
//! it once per stage on the remaining horizon.

use crate::dynamics::{pad_rows, HealthDynamics, HealthMap, IdentityHealthMap};
use crate::objective::{dose_penalty_terms, dyn_objective_terms, rx_to_constraints};
use crate::oracle::{OptimizationOracle, Solution, SolveOptions, SolveStatus};
use crate::prescription::{Bound, BoundSpec, Prescription};
use crate::problem::{AffineExpr, ExprMatrix, LinearConstraint, Problem, VarBlock};
use crate::{PlanError, PlanOptions, Result, TreatmentPlan};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Validation
// ============================================================================

/// Planning dimensions derived from the inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dimensions {
    pub stages: usize,
    pub structures: usize,
    pub beams: usize,
}

/// Check every input shape before anything is solved
pub(crate) fn validate_inputs(
    influence: &[DMatrix<f64>],
    dynamics: &HealthDynamics,
    h_init: &DVector<f64>,
    rx: &Prescription,
) -> Result<Dimensions> {
    let first = influence
        .first()
        .ok_or_else(|| PlanError::Validation("influence matrix list is empty".to_string()))?;
    let (structures, beams) = first.shape();
    if let Some((t, a)) = influence
        .iter()
        .enumerate()
        .find(|(_, a)| a.shape() != (structures, beams))
    {
        return Err(PlanError::Validation(format!(
            "influence matrix {} has dimensions {:?}, expected ({},{})",
            t,
            a.shape(),
            structures,
            beams
        )));
    }
    if dynamics.structures() != structures {
        return Err(PlanError::Validation(format!(
            "dynamics matrices must be ({},{}), got ({},{})",
            structures,
            structures,
            dynamics.structures(),
            dynamics.structures()
        )));
    }
    if h_init.len() != structures {
        return Err(PlanError::Validation(format!(
            "initial health must have {} entries, got {}",
            structures,
            h_init.len()
        )));
    }
    if h_init.iter().any(|h| !h.is_finite()) {
        return Err(PlanError::Domain("initial health must be finite".to_string()));
    }

    let stages = influence.len();
    rx.validate(stages, structures)?;
    Ok(Dimensions {
        stages,
        structures,
        beams,
    })
}

// ============================================================================
// Problem builder
// ============================================================================

/// Dynamic treatment program over a horizon of `influence.len()` stages
pub(crate) struct DynamicProblem {
    problem: Problem,
    beams: VarBlock,
    prescribed: VarBlock,
    doses: ExprMatrix,
}

/// Values extracted from a successful solve
pub(crate) struct SolvedHorizon {
    pub status: SolveStatus,
    pub objective: f64,
    pub solve_time: Duration,
    pub beams: DMatrix<f64>,
    pub doses: DMatrix<f64>,
    pub prescribed: DMatrix<f64>,
}

/// `A · b` row by row for a single stage
fn stage_doses(a: &DMatrix<f64>, beams: &VarBlock, stage: usize) -> Vec<AffineExpr> {
    (0..a.nrows())
        .map(|k| {
            let mut expr = AffineExpr::default();
            for j in 0..a.ncols() {
                expr.add_term(beams.index(stage, j), a[(k, j)]);
            }
            expr
        })
        .collect()
}

/// `F · h` for a health row held in `block`
fn propagate(f: &DMatrix<f64>, block: &VarBlock, row: usize, k: usize) -> AffineExpr {
    let mut expr = AffineExpr::default();
    for i in 0..f.ncols() {
        expr.add_term(block.index(row, i), f[(k, i)]);
    }
    expr
}

/// Reject failed solves and solutions that do not cover every variable
fn check_solution(problem: &Problem, solution: &Solution, stage: usize) -> Result<()> {
    if !solution.status.is_optimal() {
        warn!(stage, status = %solution.status, "Treatment solve failed");
        return Err(PlanError::Solver {
            stage,
            status: solution.status,
        });
    }
    if solution.values.len() != problem.num_variables() {
        warn!(
            stage,
            expected = problem.num_variables(),
            got = solution.values.len(),
            "Oracle returned a solution of the wrong size"
        );
        return Err(PlanError::Solver {
            stage,
            status: SolveStatus::SolverError,
        });
    }
    Ok(())
}

impl DynamicProblem {
    pub(crate) fn build(
        influence: &[DMatrix<f64>],
        dynamics: &HealthDynamics,
        h_init: &DVector<f64>,
        rx: &Prescription,
        recovery_stages: usize,
    ) -> Result<Self> {
        let dims = validate_inputs(influence, dynamics, h_init, rx)?;
        let Dimensions {
            stages,
            structures,
            beams: n_beams,
        } = dims;

        let mut problem = Problem::new();
        let beams = problem.add_variables(stages, n_beams, 0.0);
        let health = problem.add_variables(stages + 1, structures, f64::NEG_INFINITY);
        let prescribed = problem.add_variables(stages, structures, 0.0);

        let dose_rows: Vec<Vec<AffineExpr>> = influence
            .iter()
            .enumerate()
            .map(|(t, a)| stage_doses(a, &beams, t))
            .collect();
        let doses = ExprMatrix::from_fn(stages, structures, |t, k| dose_rows[t][k].clone());

        for k in 0..structures {
            problem.add_constraint(LinearConstraint::eq(health.expr(0, k), h_init[k]));
        }
        for t in 0..stages {
            for k in 0..structures {
                let mut next = propagate(dynamics.f(), &health, t, k);
                for j in 0..structures {
                    next = next + doses.get(t, j).clone() * dynamics.g()[(k, j)];
                }
                problem.add_constraint(LinearConstraint::eq(health.expr(t + 1, k) - next, 0.0));
                problem.add_constraint(LinearConstraint::eq(
                    prescribed.expr(t, k),
                    rx.dose[(t, k)],
                ));
            }
        }

        if let Some(bounds) = &rx.dose_constrs {
            problem.extend_constraints(rx_to_constraints(&doses, bounds)?);
        }
        if let Some(bounds) = &rx.health_constrs {
            let treatment_health = health.exprs().rows_range(1, stages);
            problem.extend_constraints(rx_to_constraints(&treatment_health, bounds)?);
        }

        if recovery_stages > 0 {
            let recovery =
                problem.add_variables(recovery_stages, structures, f64::NEG_INFINITY);
            for k in 0..structures {
                let start = propagate(dynamics.f(), &health, stages, k);
                problem.add_constraint(LinearConstraint::eq(recovery.expr(0, k) - start, 0.0));
                for t in 0..recovery_stages - 1 {
                    let next = propagate(dynamics.f(), &recovery, t, k);
                    problem
                        .add_constraint(LinearConstraint::eq(recovery.expr(t + 1, k) - next, 0.0));
                }
            }
            if let Some(bounds) = &rx.recov_constrs {
                problem.extend_constraints(rx_to_constraints(&recovery.exprs(), bounds)?);
            }
        }

        let terms = dyn_objective_terms(&doses, &health.exprs(), &prescribed.exprs(), rx)?;
        problem.extend_objective(terms);

        debug!(
            stages,
            structures,
            beams = n_beams,
            recovery_stages,
            variables = problem.num_variables(),
            constraints = problem.constraints().len(),
            "Built dynamic treatment problem"
        );

        Ok(Self {
            problem,
            beams,
            prescribed,
            doses,
        })
    }

    #[cfg(test)]
    pub(crate) fn problem(&self) -> &Problem {
        &self.problem
    }

    /// Solve and extract trajectories; `stage` tags a failure
    pub(crate) fn solve<O: OptimizationOracle + ?Sized>(
        &self,
        oracle: &O,
        options: &SolveOptions,
        stage: usize,
    ) -> Result<SolvedHorizon> {
        let solution = oracle.solve(&self.problem, options);
        check_solution(&self.problem, &solution, stage)?;
        if solution.status == SolveStatus::OptimalInaccurate {
            warn!(stage, "Treatment solve is only approximately optimal");
        }
        debug!(
            stage,
            iterations = solution.iterations,
            objective = solution.objective,
            max_violation = self.problem.max_violation(&solution.values),
            "Treatment solve finished"
        );

        Ok(SolvedHorizon {
            status: solution.status,
            objective: solution.objective,
            solve_time: solution.solve_time,
            beams: self.beams.values(&solution.values),
            doses: self.doses.evaluate(&solution.values),
            prescribed: self.prescribed.values(&solution.values),
        })
    }
}

// ============================================================================
// Open-loop planner
// ============================================================================

/// Plans the whole horizon with a single solve
pub struct OpenLoopPlanner<O> {
    oracle: O,
    options: PlanOptions,
    health_map: Box<dyn HealthMap + Send + Sync>,
}

impl<O: OptimizationOracle> OpenLoopPlanner<O> {
    pub fn new(oracle: O) -> Self {
        Self {
            oracle,
            options: PlanOptions::default(),
            health_map: Box::new(IdentityHealthMap),
        }
    }

    pub fn with_options(mut self, options: PlanOptions) -> Self {
        self.options = options;
        self
    }

    /// Post-processing applied to the reported health trajectory
    pub fn with_health_map(mut self, map: impl HealthMap + Send + Sync + 'static) -> Self {
        self.health_map = Box::new(map);
        self
    }

    pub fn options(&self) -> &PlanOptions {
        &self.options
    }

    /// Plan beams for every stage of `influence`.
    ///
    /// The returned trajectories are padded with `recovery_stages` dose-free
    /// rows; health is forward-simulated through the health map.
    pub fn plan(
        &self,
        influence: &[DMatrix<f64>],
        dynamics: &HealthDynamics,
        h_init: &DVector<f64>,
        rx: &Prescription,
    ) -> Result<TreatmentPlan> {
        let recovery = self.options.recovery_stages;
        let built = DynamicProblem::build(influence, dynamics, h_init, rx, recovery)?;
        info!(
            stages = influence.len(),
            structures = h_init.len(),
            recovery_stages = recovery,
            "Planning open-loop treatment"
        );

        let solved = built.solve(&self.oracle, &self.options.solve, 0)?;
        let beams = pad_rows(&solved.beams, recovery);
        let doses = pad_rows(&solved.doses, recovery);
        let health = dynamics.prognosis(h_init, &doses, self.health_map.as_ref());

        info!(
            status = %solved.status,
            objective = solved.objective,
            solve_time_ms = solved.solve_time.as_millis() as u64,
            "Open-loop plan complete"
        );

        Ok(TreatmentPlan {
            status: solved.status,
            objective: solved.objective,
            solve_time: solved.solve_time,
            beams,
            doses,
            health,
        })
    }
}

// ============================================================================
// Single treatment
// ============================================================================

/// Result of a one-stage plan without health dynamics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleTreatment {
    pub status: SolveStatus,
    pub objective: f64,
    pub solve_time: Duration,
    pub beams: DVector<f64>,
    pub doses: DVector<f64>,
}

fn first_row(bound: &Bound) -> Bound {
    match bound {
        Bound::Scalar(v) => Bound::Scalar(*v),
        Bound::Array(m) => Bound::Array(m.rows(0, m.nrows().min(1)).into_owned()),
    }
}

/// Plan a single fraction against stage 0 of `rx`
pub fn plan_single_treatment<O: OptimizationOracle + ?Sized>(
    a: &DMatrix<f64>,
    rx: &Prescription,
    oracle: &O,
    options: &SolveOptions,
) -> Result<SingleTreatment> {
    let (structures, n_beams) = a.shape();
    if rx.stages() == 0 || rx.structures() != structures {
        return Err(PlanError::Validation(format!(
            "prescribed dose must have at least one row of {} structures, got {:?}",
            structures,
            rx.dose.shape()
        )));
    }
    rx.validate(rx.stages(), structures)?;

    let mut problem = Problem::new();
    let beams = problem.add_variables(1, n_beams, 0.0);
    let dose_row = stage_doses(a, &beams, 0);
    let doses = ExprMatrix::from_fn(1, structures, |_, k| dose_row[k].clone());
    let total: AffineExpr = dose_row.iter().cloned().sum();

    for k in 0..structures {
        problem.extend_objective(dose_penalty_terms(
            &total,
            &AffineExpr::constant(rx.dose[(0, k)]),
            rx.dose_weights.under.get(k),
            rx.dose_weights.over.get(k),
        ));
    }
    if let Some(bounds) = &rx.dose_constrs {
        let stage_bounds = BoundSpec {
            lower: bounds.lower.as_ref().map(first_row),
            upper: bounds.upper.as_ref().map(first_row),
        };
        problem.extend_constraints(rx_to_constraints(&doses, &stage_bounds)?);
    }

    info!(structures, beams = n_beams, "Planning single treatment");
    let solution = oracle.solve(&problem, options);
    check_solution(&problem, &solution, 0)?;

    let dose_values = doses.evaluate(&solution.values);
    Ok(SingleTreatment {
        status: solution.status,
        objective: solution.objective,
        solve_time: solution.solve_time,
        beams: beams.values(&solution.values).row(0).transpose(),
        doses: dose_values.row(0).transpose(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admm::AdmmOracle;

    fn scalar_dynamics() -> HealthDynamics {
        HealthDynamics::new(
            DMatrix::from_element(1, 1, 0.5),
            DMatrix::from_element(1, 1, 1.0),
        )
        .unwrap()
    }

    fn unit_influence(stages: usize) -> Vec<DMatrix<f64>> {
        vec![DMatrix::from_element(1, 1, 1.0); stages]
    }

    #[test]
    fn test_validate_empty_influence() {
        let rx = Prescription::new(DMatrix::from_element(1, 1, 1.0));
        let err = validate_inputs(&[], &scalar_dynamics(), &DVector::zeros(1), &rx).unwrap_err();
        assert!(matches!(err, PlanError::Validation(_)));
    }

    #[test]
    fn test_validate_mismatched_influence() {
        let rx = Prescription::new(DMatrix::from_element(2, 1, 1.0));
        let influence = vec![DMatrix::from_element(1, 1, 1.0), DMatrix::from_element(1, 2, 1.0)];
        assert!(matches!(
            validate_inputs(&influence, &scalar_dynamics(), &DVector::zeros(1), &rx),
            Err(PlanError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_health_and_prescription_shapes() {
        let rx = Prescription::new(DMatrix::from_element(2, 1, 1.0));
        let influence = unit_influence(2);
        assert!(validate_inputs(&influence, &scalar_dynamics(), &DVector::zeros(2), &rx).is_err());

        let short_rx = Prescription::new(DMatrix::from_element(1, 1, 1.0));
        assert!(
            validate_inputs(&influence, &scalar_dynamics(), &DVector::zeros(1), &short_rx).is_err()
        );

        let dims = validate_inputs(&influence, &scalar_dynamics(), &DVector::zeros(1), &rx).unwrap();
        assert_eq!(
            dims,
            Dimensions {
                stages: 2,
                structures: 1,
                beams: 1
            }
        );
    }

    #[test]
    fn test_problem_layout_with_recovery() {
        let rx = Prescription::new(DMatrix::from_element(3, 1, 1.0));
        let built =
            DynamicProblem::build(&unit_influence(3), &scalar_dynamics(), &DVector::zeros(1), &rx, 2)
                .unwrap();
        // beams 3, health 4, prescribed 3, recovery 2
        assert_eq!(built.problem().num_variables(), 12);
        // initial state 1, dynamics 3, prescribed 3, recovery 2
        assert_eq!(built.problem().constraints().len(), 9);
    }

    #[test]
    fn test_open_loop_tracks_prescription() {
        let rx = Prescription::new(DMatrix::from_row_slice(2, 1, &[1.0, 2.0]));
        let planner = OpenLoopPlanner::new(AdmmOracle::new());
        let plan = planner
            .plan(&unit_influence(2), &scalar_dynamics(), &DVector::zeros(1), &rx)
            .unwrap();
        assert!(plan.status.is_optimal());
        assert!((plan.doses[(0, 0)] - 1.0).abs() < 1e-3);
        assert!((plan.doses[(1, 0)] - 2.0).abs() < 1e-3);
        assert!(plan.objective.abs() < 1e-3);
    }

    #[test]
    fn test_single_treatment() {
        let a = DMatrix::from_row_slice(1, 2, &[1.0, 0.5]);
        let rx = Prescription::new(DMatrix::from_row_slice(2, 1, &[2.0, 7.0]));
        let plan = plan_single_treatment(&a, &rx, &AdmmOracle::new(), &SolveOptions::default())
            .unwrap();
        assert!(plan.status.is_optimal());
        assert_eq!(plan.beams.len(), 2);
        assert!(plan.beams.iter().all(|b| *b >= 0.0));
        assert!((plan.doses[0] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_single_treatment_stage_bounds() {
        let a = DMatrix::from_element(1, 1, 1.0);
        let rx = Prescription::new(DMatrix::from_row_slice(2, 1, &[2.0, 2.0])).dose_bounds(
            BoundSpec::new().upper(DMatrix::from_row_slice(2, 1, &[1.5, 9.0])),
        );
        let plan = plan_single_treatment(&a, &rx, &AdmmOracle::new(), &SolveOptions::default())
            .unwrap();
        assert!((plan.doses[0] - 1.5).abs() < 1e-3);
    }

    /// Claims optimality but hands back a fixed number of values
    struct ShortSolutionOracle(usize);

    impl OptimizationOracle for ShortSolutionOracle {
        fn solve(&self, _problem: &Problem, _options: &SolveOptions) -> Solution {
            Solution {
                status: SolveStatus::Optimal,
                values: vec![0.0; self.0],
                objective: 0.0,
                solve_time: Duration::ZERO,
                iterations: 1,
            }
        }
    }

    #[test]
    fn test_short_solution_is_solver_error() {
        let rx = Prescription::new(DMatrix::from_element(3, 1, 1.0));
        let planner = OpenLoopPlanner::new(ShortSolutionOracle(2));
        assert_eq!(
            planner
                .plan(&unit_influence(3), &scalar_dynamics(), &DVector::zeros(1), &rx)
                .unwrap_err(),
            PlanError::Solver {
                stage: 0,
                status: SolveStatus::SolverError
            }
        );

        let a = DMatrix::from_element(1, 2, 1.0);
        let single = Prescription::new(DMatrix::from_element(1, 1, 1.0));
        assert_eq!(
            plan_single_treatment(&a, &single, &ShortSolutionOracle(0), &SolveOptions::default())
                .unwrap_err(),
            PlanError::Solver {
                stage: 0,
                status: SolveStatus::SolverError
            }
        );
    }

    #[test]
    fn test_single_treatment_shape_error() {
        let a = DMatrix::from_element(2, 1, 1.0);
        let rx = Prescription::new(DMatrix::from_element(1, 1, 1.0));
        assert!(matches!(
            plan_single_treatment(&a, &rx, &AdmmOracle::new(), &SolveOptions::default()),
            Err(PlanError::Validation(_))
        ));
    }
}
