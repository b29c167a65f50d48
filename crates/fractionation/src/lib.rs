//! Fractionation Planning Library
//!
//! Optimal-control planning of fractionated radiotherapy: beam intensities
//! are allocated across treatment stages so the delivered dose tracks a
//! prescription while a linear health-status model stays in bounds.
//!
//! # Model
//!
//! ```text
//! d_t     = A_t · b_t,            b_t >= 0
//! h_{t+1} = F · h_t + G · d_t
//! min  Σ_t  dose_penalty(Σ_k d_t[k], p_t) + Σ_k w_k · h_{t+1}[k]²
//! ```
//!
//! Two planners share one problem builder:
//!
//! | Planner | Strategy |
//! |---------|----------|
//! | [`OpenLoopPlanner`] | one solve over the full horizon |
//! | [`RecedingHorizonPlanner`] | re-solve the remaining horizon every stage, apply the first decision, feed the realized health back |
//!
//! The convex program itself is handed to an [`OptimizationOracle`];
//! [`AdmmOracle`] is a small dense reference backend.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod admm;
pub mod dynamics;
pub mod objective;
pub mod open_loop;
pub mod oracle;
pub mod prescription;
pub mod problem;
pub mod receding;

pub use admm::{AdmmOracle, AdmmSettings};
pub use dynamics::{HealthDynamics, HealthMap, IdentityHealthMap};
pub use objective::{dose_penalty, dyn_objective, health_penalty, rx_to_constraints};
pub use open_loop::{plan_single_treatment, OpenLoopPlanner, SingleTreatment};
pub use oracle::{CancelToken, OptimizationOracle, Solution, SolveOptions, SolveStatus};
pub use prescription::{Bound, BoundSpec, DoseWeights, Prescription, Weights};
pub use problem::{AffineExpr, ExprMatrix, LinearConstraint, ObjectiveTerm, Problem, VarBlock};
pub use receding::RecedingHorizonPlanner;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Domain error: {0}")]
    Domain(String),
    #[error("Solver reported {status} at stage {stage}")]
    Solver { stage: usize, status: SolveStatus },
}

pub type Result<T> = std::result::Result<T, PlanError>;

/// Options shared by both planners
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Dose-free stages appended after treatment
    pub recovery_stages: usize,
    #[serde(skip)]
    pub solve: SolveOptions,
}

impl PlanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recovery_stages(mut self, stages: usize) -> Self {
        self.recovery_stages = stages;
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.solve.time_limit = Some(limit);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.solve.cancel = Some(token);
        self
    }
}

/// Planned trajectories over treatment and recovery stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentPlan {
    pub status: SolveStatus,
    /// Treatment-stage objective value
    pub objective: f64,
    pub solve_time: Duration,
    /// (T + T_recov) × n beam intensities
    pub beams: DMatrix<f64>,
    /// (T + T_recov) × K structure doses
    pub doses: DMatrix<f64>,
    /// (T + T_recov + 1) × K health states, row 0 is the initial state
    pub health: DMatrix<f64>,
}

impl TreatmentPlan {
    pub fn stages(&self) -> usize {
        self.doses.nrows()
    }

    pub fn dose_at(&self, stage: usize) -> DVector<f64> {
        self.doses.row(stage).transpose()
    }

    pub fn health_at(&self, stage: usize) -> DVector<f64> {
        self.health.row(stage).transpose()
    }
}
