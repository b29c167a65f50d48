//! Dose-volume constraints
//!
//! A constraint bounds the dose at a percentile of a structure's volume,
//! or its mean, minimum or maximum dose. Clinically meaningless pairings
//! (an upper-bounded `Dmin`, a lower-bounded `Dmax`) are corrected to the
//! valid direction and reported as a [`ConstraintWarning`].

use crate::{DoseVolumeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Highest allowed constraint priority
pub const MAX_PRIORITY: u8 = 3;

/// Absorbs float noise when converting a volume fraction to a voxel count.
const COUNT_EPSILON: f64 = 1e-9;

// ============================================================================
// Threshold & Direction
// ============================================================================

/// What part of the dose distribution a constraint bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Threshold {
    /// Dose received by at least this percentage of the volume, in (0, 100)
    Percentile(f64),
    Mean,
    Min,
    Max,
}

impl Threshold {
    /// Map a numeric percentile onto a threshold.
    ///
    /// `100` is the minimum dose and `0` the maximum dose; anything else in
    /// between is a percentile threshold.
    pub fn from_percentile(percentile: f64) -> Result<Self> {
        if !percentile.is_finite() || !(0.0..=100.0).contains(&percentile) {
            return Err(DoseVolumeError::InvalidThreshold(format!(
                "percentile must lie in [0, 100], got {}",
                percentile
            )));
        }
        Ok(if percentile == 100.0 {
            Threshold::Min
        } else if percentile == 0.0 {
            Threshold::Max
        } else {
            Threshold::Percentile(percentile)
        })
    }

    /// Equivalent volume percentile, if the threshold has one
    pub fn percentile(&self) -> Option<f64> {
        match self {
            Threshold::Percentile(p) => Some(*p),
            Threshold::Min => Some(100.0),
            Threshold::Max => Some(0.0),
            Threshold::Mean => None,
        }
    }

    /// Label used in plotting markers
    pub fn kind(&self) -> &'static str {
        match self {
            Threshold::Percentile(_) => "percentile",
            Threshold::Mean => "mean",
            Threshold::Min => "min",
            Threshold::Max => "max",
        }
    }
}

impl FromStr for Threshold {
    type Err = DoseVolumeError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "mean" => Ok(Threshold::Mean),
            "min" | "minimum" => Ok(Threshold::Min),
            "max" | "maximum" => Ok(Threshold::Max),
            _ => {
                let value: f64 = trimmed.parse().map_err(|_| {
                    DoseVolumeError::InvalidThreshold(format!(
                        "{:?} is neither a percentile nor one of mean/min/max",
                        s
                    ))
                })?;
                Threshold::from_percentile(value)
            }
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Percentile(p) => write!(f, "{}", p),
            Threshold::Mean => write!(f, "mean"),
            Threshold::Min => write!(f, "min"),
            Threshold::Max => write!(f, "max"),
        }
    }
}

/// Bound direction of a constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// `<` / `<=`
    Upper,
    /// `>` / `>=`
    Lower,
}

impl Direction {
    pub fn symbol(&self) -> &'static str {
        match self {
            Direction::Upper => "<",
            Direction::Lower => ">",
        }
    }
}

impl FromStr for Direction {
    type Err = DoseVolumeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "<" | "<=" => Ok(Direction::Upper),
            ">" | ">=" => Ok(Direction::Lower),
            other => Err(DoseVolumeError::InvalidDirection(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

// ============================================================================
// Warnings
// ============================================================================

/// A soft input that was corrected instead of rejected
#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintWarning {
    DirectionOverridden {
        threshold: Threshold,
        requested: Direction,
        applied: Direction,
    },
    SlackClamped {
        requested: f64,
    },
    PriorityClamped {
        requested: i64,
        applied: u8,
    },
}

impl fmt::Display for ConstraintWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintWarning::DirectionOverridden {
                threshold,
                requested,
                applied,
            } => write!(
                f,
                "constraint of form \"D{} {} x Gy\" not allowed, setting direction to \"{}\"",
                threshold, requested, applied
            ),
            ConstraintWarning::SlackClamped { requested } => write!(
                f,
                "slack must be nonnegative (got {}); setting to zero",
                requested
            ),
            ConstraintWarning::PriorityClamped { requested, applied } => write!(
                f,
                "priority must be between 0 and {} (got {}); setting to {}",
                MAX_PRIORITY, requested, applied
            ),
        }
    }
}

// ============================================================================
// Constraint
// ============================================================================

/// A single dose-volume constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConstraint")]
pub struct Constraint {
    threshold: Threshold,
    direction: Direction,
    dose: f64,
    slack: f64,
    priority: u8,
}

/// Serialized form of a [`Constraint`], replayed through the setters on load
#[derive(Debug, Deserialize)]
struct RawConstraint {
    threshold: Threshold,
    direction: Direction,
    #[serde(default)]
    dose: f64,
    #[serde(default)]
    slack: f64,
    #[serde(default)]
    priority: i64,
}

impl TryFrom<RawConstraint> for Constraint {
    type Error = DoseVolumeError;

    fn try_from(raw: RawConstraint) -> Result<Self> {
        let threshold = match raw.threshold {
            Threshold::Percentile(p) => Threshold::from_percentile(p)?,
            other => other,
        };
        let mut constraint = Constraint::new(threshold);
        constraint.set_direction(raw.direction);
        constraint.set_dose(raw.dose)?;
        constraint.set_slack(raw.slack)?;
        constraint.set_priority(raw.priority);
        Ok(constraint)
    }
}

impl Constraint {
    /// Create a constraint with zero dose and the direction natural to
    /// `threshold` (lower bound for `Dmin`, upper bound otherwise).
    pub fn new(threshold: Threshold) -> Self {
        let direction = match threshold {
            Threshold::Min => Direction::Lower,
            _ => Direction::Upper,
        };
        Self {
            threshold,
            direction,
            dose: 0.0,
            slack: 0.0,
            priority: 0,
        }
    }

    /// Factory keyed by a threshold phrase: `"mean"`, `"min"`, `"max"`, or
    /// a numeric percentile such as `"90"`.
    pub fn from_threshold(threshold: &str) -> Result<Self> {
        Ok(Self::new(threshold.parse()?))
    }

    /// Factory keyed by a numeric percentile (100 → `Dmin`, 0 → `Dmax`).
    pub fn at_percentile(percentile: f64) -> Result<Self> {
        Ok(Self::new(Threshold::from_percentile(percentile)?))
    }

    pub fn mean() -> Self {
        Self::new(Threshold::Mean)
    }

    pub fn min() -> Self {
        Self::new(Threshold::Min)
    }

    pub fn max() -> Self {
        Self::new(Threshold::Max)
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_upper(&self) -> bool {
        self.direction == Direction::Upper
    }

    pub fn dose(&self) -> f64 {
        self.dose
    }

    pub fn slack(&self) -> f64 {
        self.slack
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Dose bound after applying slack: relaxed upward for upper bounds,
    /// downward for lower bounds.
    pub fn dose_achieved(&self) -> f64 {
        match self.direction {
            Direction::Upper => self.dose + self.slack,
            Direction::Lower => self.dose - self.slack,
        }
    }

    /// Set the bound direction, correcting pairings that are not allowed
    /// for `Dmin`/`Dmax`.
    pub fn set_direction(&mut self, direction: Direction) -> Option<ConstraintWarning> {
        let applied = match (self.threshold, direction) {
            (Threshold::Max, Direction::Lower) => Direction::Upper,
            (Threshold::Min, Direction::Upper) => Direction::Lower,
            _ => direction,
        };
        self.direction = applied;

        if applied == direction {
            return None;
        }
        let warning = ConstraintWarning::DirectionOverridden {
            threshold: self.threshold,
            requested: direction,
            applied,
        };
        warn!("{}", warning);
        Some(warning)
    }

    /// Parse and set the bound direction (`<`, `<=`, `>`, `>=`).
    pub fn set_direction_str(&mut self, direction: &str) -> Result<Option<ConstraintWarning>> {
        let parsed: Direction = direction.parse()?;
        Ok(self.set_direction(parsed))
    }

    /// Set the dose bound in Gy. Negative doses are clamped to zero.
    pub fn set_dose(&mut self, dose: f64) -> Result<()> {
        if !dose.is_finite() {
            return Err(DoseVolumeError::InvalidValue {
                field: "dose",
                value: dose,
            });
        }
        self.dose = dose.max(0.0);
        Ok(())
    }

    pub fn set_slack(&mut self, slack: f64) -> Result<Option<ConstraintWarning>> {
        if !slack.is_finite() {
            return Err(DoseVolumeError::InvalidValue {
                field: "slack",
                value: slack,
            });
        }
        if slack < 0.0 {
            self.slack = 0.0;
            let warning = ConstraintWarning::SlackClamped { requested: slack };
            warn!("{}", warning);
            return Ok(Some(warning));
        }
        self.slack = slack;
        Ok(None)
    }

    pub fn set_priority(&mut self, priority: i64) -> Option<ConstraintWarning> {
        let applied = priority.clamp(0, MAX_PRIORITY as i64) as u8;
        self.priority = applied;

        if applied as i64 == priority {
            return None;
        }
        let warning = ConstraintWarning::PriorityClamped {
            requested: priority,
            applied,
        };
        warn!("{}", warning);
        Some(warning)
    }

    /// `D{threshold} <= dose`, as a new constraint value
    pub fn with_upper_bound(mut self, dose: f64) -> Result<Self> {
        self.set_direction(Direction::Upper);
        self.set_dose(dose)?;
        Ok(self)
    }

    /// `D{threshold} >= dose`, as a new constraint value
    pub fn with_lower_bound(mut self, dose: f64) -> Result<Self> {
        self.set_direction(Direction::Lower);
        self.set_dose(dose)?;
        Ok(self)
    }

    pub fn with_slack(mut self, slack: f64) -> Result<Self> {
        self.set_slack(slack)?;
        Ok(self)
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.set_priority(priority);
        self
    }

    /// Indices of the voxels in `y` that satisfy this constraint with the
    /// largest margin.
    ///
    /// The count is the non-violating share of the structure: `100 - p`
    /// percent for upper bounds, `p` percent for lower bounds. Voxels are
    /// ranked by `y[i] - dose` (or `dose_achieved` when `use_achieved_dose`
    /// is set); upper bounds take the most negative margins, lower bounds
    /// the most positive ones.
    pub fn maxmargin_fulfillers(&self, y: &[f64], use_achieved_dose: bool) -> Result<Vec<usize>> {
        let percentile = self
            .threshold
            .percentile()
            .ok_or_else(|| DoseVolumeError::UnsupportedThreshold(self.threshold.to_string()))?;

        let non_violating = if self.is_upper() {
            100.0 - percentile
        } else {
            percentile
        };
        let n_returned = ((non_violating * y.len() as f64) / 100.0 + COUNT_EPSILON).floor() as usize;
        let n_returned = n_returned.min(y.len());

        let reference = if use_achieved_dose {
            self.dose_achieved()
        } else {
            self.dose
        };

        let mut order: Vec<usize> = (0..y.len()).collect();
        order.sort_by(|&a, &b| (y[a] - reference).total_cmp(&(y[b] - reference)));

        if self.is_upper() {
            order.truncate(n_returned);
            Ok(order)
        } else {
            Ok(order.split_off(y.len() - n_returned))
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{} {}= {}Gy", self.threshold, self.direction, self.dose)
    }
}
