//! Receding-horizon planning
//!
//! Every stage re-plans the remaining horizon from the realized health
//! state, delivers only the first stage of that plan and feeds the
//! resulting health (after the health map) back into the next solve.

use crate::dynamics::{pad_rows, HealthDynamics, HealthMap, IdentityHealthMap};
use crate::objective::dyn_objective;
use crate::open_loop::{validate_inputs, DynamicProblem};
use crate::oracle::{OptimizationOracle, SolveStatus};
use crate::prescription::Prescription;
use crate::{PlanOptions, Result, TreatmentPlan};
use nalgebra::{DMatrix, DVector};
use std::time::Duration;
use tracing::info;

pub struct RecedingHorizonPlanner<O> {
    oracle: O,
    options: PlanOptions,
    health_map: Box<dyn HealthMap + Send + Sync>,
}

impl<O: OptimizationOracle> RecedingHorizonPlanner<O> {
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

    /// Applied to every realized health state, in the loop and in the report
    pub fn with_health_map(mut self, map: impl HealthMap + Send + Sync + 'static) -> Self {
        self.health_map = Box::new(map);
        self
    }

    pub fn options(&self) -> &PlanOptions {
        &self.options
    }

    /// Plan stage by stage.
    ///
    /// Any stage whose solve is not optimal aborts the run with
    /// [`PlanError::Solver`](crate::PlanError::Solver) tagged with that stage.
    pub fn plan(
        &self,
        influence: &[DMatrix<f64>],
        dynamics: &HealthDynamics,
        h_init: &DVector<f64>,
        rx: &Prescription,
    ) -> Result<TreatmentPlan> {
        let dims = validate_inputs(influence, dynamics, h_init, rx)?;
        let recovery = self.options.recovery_stages;
        info!(
            stages = dims.stages,
            structures = dims.structures,
            recovery_stages = recovery,
            "Planning receding-horizon treatment"
        );

        let mut beams = DMatrix::<f64>::zeros(dims.stages, dims.beams);
        let mut doses = DMatrix::<f64>::zeros(dims.stages, dims.structures);
        let mut fracs = DMatrix::<f64>::zeros(dims.stages, dims.structures);
        let mut h_cur = h_init.clone();
        let mut solve_time = Duration::ZERO;
        let mut status = SolveStatus::Optimal;

        for stage in 0..dims.stages {
            let rx_rest = rx.starting_at(stage)?;
            let horizon =
                DynamicProblem::build(&influence[stage..], dynamics, &h_cur, &rx_rest, recovery)?;
            let solved = horizon.solve(&self.oracle, &self.options.solve, stage)?;

            beams.set_row(stage, &solved.beams.row(0));
            doses.set_row(stage, &solved.doses.row(0));
            fracs.set_row(stage, &solved.prescribed.row(0));

            let delivered = solved.doses.row(0).transpose();
            h_cur = self.health_map.apply(dynamics.step(&h_cur, &delivered), stage);
            solve_time += solved.solve_time;
            status = solved.status;

            info!(
                stage,
                status = %solved.status,
                dose = ?delivered.as_slice(),
                health = ?h_cur.as_slice(),
                "Receding-horizon stage delivered"
            );
        }

        let realized_health = dynamics.prognosis(h_init, &doses, self.health_map.as_ref());
        let objective = dyn_objective(&doses, &realized_health, &fracs, rx)?;

        let beams = pad_rows(&beams, recovery);
        let doses = pad_rows(&doses, recovery);
        let health = dynamics.prognosis(h_init, &doses, self.health_map.as_ref());

        info!(
            %status,
            objective,
            solve_time_ms = solve_time.as_millis() as u64,
            "Receding-horizon plan complete"
        );

        Ok(TreatmentPlan {
            status,
            objective,
            solve_time,
            beams,
            doses,
            health,
        })
    }
}
