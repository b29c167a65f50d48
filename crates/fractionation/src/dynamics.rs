//! Linear health-status dynamics
//!
//! `h_{t+1} = F · h_t + G · d_t`, optionally post-processed per stage by a
//! [`HealthMap`] (e.g. clamping) when simulating realized trajectories.

use crate::{PlanError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Stage-dependent post-processing of a propagated health state
pub trait HealthMap {
    fn apply(&self, health: DVector<f64>, stage: usize) -> DVector<f64>;
}

impl<F> HealthMap for F
where
    F: Fn(DVector<f64>, usize) -> DVector<f64>,
{
    fn apply(&self, health: DVector<f64>, stage: usize) -> DVector<f64> {
        self(health, stage)
    }
}

/// Leaves the propagated state untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityHealthMap;

impl HealthMap for IdentityHealthMap {
    fn apply(&self, health: DVector<f64>, _stage: usize) -> DVector<f64> {
        health
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthDynamics {
    f: DMatrix<f64>,
    g: DMatrix<f64>,
}

impl HealthDynamics {
    /// `F` and `G` must both be K × K
    pub fn new(f: DMatrix<f64>, g: DMatrix<f64>) -> Result<Self> {
        let k = f.nrows();
        if f.ncols() != k {
            return Err(PlanError::Validation(format!(
                "F must be square, got {:?}",
                f.shape()
            )));
        }
        if g.shape() != (k, k) {
            return Err(PlanError::Validation(format!(
                "G must have dimensions ({},{}), got {:?}",
                k,
                k,
                g.shape()
            )));
        }
        Ok(Self { f, g })
    }

    pub fn structures(&self) -> usize {
        self.f.nrows()
    }

    pub fn f(&self) -> &DMatrix<f64> {
        &self.f
    }

    pub fn g(&self) -> &DMatrix<f64> {
        &self.g
    }

    /// One stage of the linear dynamics
    pub fn step(&self, health: &DVector<f64>, dose: &DVector<f64>) -> DVector<f64> {
        &self.f * health + &self.g * dose
    }

    /// Forward-simulate from `h_init` under the dose rows of `doses`.
    ///
    /// Returns (stages + 1) × K states with `h_init` in row 0.
    pub fn prognosis(
        &self,
        h_init: &DVector<f64>,
        doses: &DMatrix<f64>,
        health_map: &dyn HealthMap,
    ) -> DMatrix<f64> {
        let stages = doses.nrows();
        let mut health = DMatrix::zeros(stages + 1, self.structures());
        health.set_row(0, &h_init.transpose());

        let mut current = h_init.clone();
        for t in 0..stages {
            let dose = doses.row(t).transpose();
            current = health_map.apply(self.step(&current, &dose), t);
            health.set_row(t + 1, &current.transpose());
        }
        health
    }
}

/// Append `extra` zero rows, i.e. dose-free recovery stages
pub fn pad_rows(m: &DMatrix<f64>, extra: usize) -> DMatrix<f64> {
    let rows = m.nrows();
    DMatrix::from_fn(rows + extra, m.ncols(), |r, c| {
        if r < rows {
            m[(r, c)]
        } else {
            0.0
        }
    })
}
