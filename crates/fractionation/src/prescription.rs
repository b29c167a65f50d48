//! Treatment prescription
//!
//! Per-stage dose targets, penalty weights and optional bound blocks.
//! Bounds use `f64::INFINITY` / `f64::NEG_INFINITY` for "unbounded".

use crate::{PlanError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

// ============================================================================
// Bounds
// ============================================================================

/// A bound applied to every entry, or per (stage, structure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bound {
    Scalar(f64),
    Array(DMatrix<f64>),
}

impl Bound {
    /// Drop the stages before `start`; scalars are stage-independent
    pub fn starting_at(&self, start: usize) -> Bound {
        match self {
            Bound::Scalar(v) => Bound::Scalar(*v),
            Bound::Array(m) => {
                let start = start.min(m.nrows());
                Bound::Array(m.rows(start, m.nrows() - start).into_owned())
            }
        }
    }
}

impl From<f64> for Bound {
    fn from(value: f64) -> Self {
        Bound::Scalar(value)
    }
}

impl From<DMatrix<f64>> for Bound {
    fn from(values: DMatrix<f64>) -> Self {
        Bound::Array(values)
    }
}

/// `{lower, upper}` bound block; a missing side is unbounded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<Bound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<Bound>,
}

impl BoundSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lower(mut self, bound: impl Into<Bound>) -> Self {
        self.lower = Some(bound.into());
        self
    }

    pub fn upper(mut self, bound: impl Into<Bound>) -> Self {
        self.upper = Some(bound.into());
        self
    }

    pub fn starting_at(&self, start: usize) -> BoundSpec {
        BoundSpec {
            lower: self.lower.as_ref().map(|b| b.starting_at(start)),
            upper: self.upper.as_ref().map(|b| b.starting_at(start)),
        }
    }
}

// ============================================================================
// Weights
// ============================================================================

/// Penalty weight shared by all structures or given per structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Weights {
    Uniform(f64),
    PerStructure(Vec<f64>),
}

impl Weights {
    pub fn get(&self, structure: usize) -> f64 {
        match self {
            Weights::Uniform(w) => *w,
            Weights::PerStructure(ws) => ws[structure],
        }
    }

    fn validate(&self, name: &str, structures: usize) -> Result<()> {
        let values: &[f64] = match self {
            Weights::Uniform(w) => std::slice::from_ref(w),
            Weights::PerStructure(ws) => {
                if ws.len() != structures {
                    return Err(PlanError::Validation(format!(
                        "{} must have {} entries, got {}",
                        name,
                        structures,
                        ws.len()
                    )));
                }
                ws
            }
        };
        if let Some(bad) = values.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(PlanError::Domain(format!(
                "{} must be finite and nonnegative, got {}",
                name, bad
            )));
        }
        Ok(())
    }
}

impl From<f64> for Weights {
    fn from(value: f64) -> Self {
        Weights::Uniform(value)
    }
}

impl From<Vec<f64>> for Weights {
    fn from(values: Vec<f64>) -> Self {
        Weights::PerStructure(values)
    }
}

/// Under- and overdose weights of the dose penalty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseWeights {
    pub under: Weights,
    pub over: Weights,
}

impl Default for DoseWeights {
    fn default() -> Self {
        Self {
            under: Weights::Uniform(1.0),
            over: Weights::Uniform(1.0),
        }
    }
}

// ============================================================================
// Prescription
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    /// T × K prescribed dose per stage and structure
    pub dose: DMatrix<f64>,
    #[serde(default)]
    pub dose_weights: DoseWeights,
    pub health_weights: Weights,
    /// Bounds on delivered dose, T × K
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_constrs: Option<BoundSpec>,
    /// Bounds on health during treatment (stages 1..=T), T × K
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_constrs: Option<BoundSpec>,
    /// Bounds on health during recovery, T_recov × K
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recov_constrs: Option<BoundSpec>,
}

impl Prescription {
    /// Prescription with unit dose weights and no health penalty
    pub fn new(dose: DMatrix<f64>) -> Self {
        Self {
            dose,
            dose_weights: DoseWeights::default(),
            health_weights: Weights::Uniform(0.0),
            dose_constrs: None,
            health_constrs: None,
            recov_constrs: None,
        }
    }

    pub fn dose_weights(mut self, under: impl Into<Weights>, over: impl Into<Weights>) -> Self {
        self.dose_weights = DoseWeights {
            under: under.into(),
            over: over.into(),
        };
        self
    }

    pub fn health_weights(mut self, weights: impl Into<Weights>) -> Self {
        self.health_weights = weights.into();
        self
    }

    pub fn dose_bounds(mut self, bounds: BoundSpec) -> Self {
        self.dose_constrs = Some(bounds);
        self
    }

    pub fn health_bounds(mut self, bounds: BoundSpec) -> Self {
        self.health_constrs = Some(bounds);
        self
    }

    pub fn recovery_bounds(mut self, bounds: BoundSpec) -> Self {
        self.recov_constrs = Some(bounds);
        self
    }

    pub fn stages(&self) -> usize {
        self.dose.nrows()
    }

    pub fn structures(&self) -> usize {
        self.dose.ncols()
    }

    /// Check dose shape and weights against a `stages` × `structures` plan
    pub fn validate(&self, stages: usize, structures: usize) -> Result<()> {
        if self.dose.shape() != (stages, structures) {
            return Err(PlanError::Validation(format!(
                "prescribed dose must have dimensions ({},{}), got {:?}",
                stages,
                structures,
                self.dose.shape()
            )));
        }
        if let Some(bad) = self.dose.iter().find(|d| !d.is_finite() || **d < 0.0) {
            return Err(PlanError::Domain(format!(
                "prescribed dose must be finite and nonnegative, got {}",
                bad
            )));
        }
        self.validate_weights(structures)
    }

    /// Check weight lengths and signs against `structures`
    pub fn validate_weights(&self, structures: usize) -> Result<()> {
        self.dose_weights.under.validate("underdose weights", structures)?;
        self.dose_weights.over.validate("overdose weights", structures)?;
        self.health_weights.validate("health weights", structures)
    }

    /// The prescription for the remaining horizon starting at `start`.
    ///
    /// Dose targets and treatment-stage bound arrays lose their first
    /// `start` rows; recovery bounds are kept as they are.
    pub fn starting_at(&self, start: usize) -> Result<Prescription> {
        if start >= self.stages() {
            return Err(PlanError::Validation(format!(
                "start stage {} is past the {}-stage prescription",
                start,
                self.stages()
            )));
        }
        Ok(Prescription {
            dose: self.dose.rows(start, self.stages() - start).into_owned(),
            dose_weights: self.dose_weights.clone(),
            health_weights: self.health_weights.clone(),
            dose_constrs: self.dose_constrs.as_ref().map(|b| b.starting_at(start)),
            health_constrs: self.health_constrs.as_ref().map(|b| b.starting_at(start)),
            recov_constrs: self.recov_constrs.clone(),
        })
    }
}
