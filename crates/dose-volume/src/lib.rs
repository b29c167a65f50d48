//! Dose-Volume Library
//!
//! Dose-volume constraints and compressed dose-volume histograms (DVH)
//! for judging the quality of a planned dose distribution.
//!
//! # Constraint Forms
//!
//! | Threshold | Meaning | Allowed directions |
//! |-----------|---------|--------------------|
//! | `D{p}`    | dose received by at least `p`% of the structure | `<`, `>` |
//! | `Dmean`   | mean dose over the structure | `<`, `>` |
//! | `Dmin`    | minimum voxel dose (same as `D100`) | `>` only |
//! | `Dmax`    | maximum voxel dose (same as `D0`) | `<` only |

use thiserror::Error;

pub mod constraint;
pub mod constraint_list;
pub mod dvh;
pub mod export;

pub use constraint::{Constraint, ConstraintWarning, Direction, Threshold};
pub use constraint_list::{ConstraintId, ConstraintList};
pub use dvh::{Dvh, DVH_MAX_LENGTH};
pub use export::{ConstraintMarker, DvhCurve, PlotExporter};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DoseVolumeError {
    #[error("Dimension mismatch: expected {expected} values, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
    #[error("Invalid direction: {0:?} (expected one of <, <=, >, >=)")]
    InvalidDirection(String),
    #[error("Invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: f64 },
    #[error("DVH has no dose data")]
    NotPopulated,
    #[error("Operation not supported for {0} constraints")]
    UnsupportedThreshold(String),
}

pub type Result<T> = std::result::Result<T, DoseVolumeError>;
