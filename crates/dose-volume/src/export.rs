//! Plot-ready export shapes
//!
//! The JSON layout of [`DvhCurve`] and [`ConstraintMarker`] is consumed by
//! external plotting front ends and must not change.

use crate::constraint::{Constraint, Threshold};
use crate::constraint_list::{ConstraintId, ConstraintList};
use crate::dvh::Dvh;
use serde::{Deserialize, Serialize};

/// `{"percentile": [...], "dose": [...]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DvhCurve {
    pub percentile: Vec<f64>,
    pub dose: Vec<f64>,
}

/// Marker drawn on a DVH plot for one constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintMarker {
    #[serde(rename = "type")]
    pub kind: String,
    /// `[p, p]`, percentile constraints only
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub percentile: Option<[f64; 2]>,
    /// `[requested, achieved]`
    pub dose: [f64; 2],
    pub symbol: String,
}

impl From<&Constraint> for ConstraintMarker {
    fn from(c: &Constraint) -> Self {
        let percentile = match c.threshold() {
            Threshold::Percentile(p) => Some([p, p]),
            _ => None,
        };
        Self {
            kind: c.threshold().kind().to_string(),
            percentile,
            dose: [c.dose(), c.dose_achieved()],
            symbol: c.direction().symbol().to_string(),
        }
    }
}

/// Export gate for plotting data.
///
/// Whether plotting is available is decided by whoever composes the
/// planning session; a disabled exporter yields `None` everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotExporter {
    enabled: bool,
}

impl PlotExporter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dvh(&self, dvh: &Dvh) -> Option<DvhCurve> {
        self.enabled.then(|| dvh.plotting_data())
    }

    pub fn constraints(&self, list: &ConstraintList) -> Option<Vec<(ConstraintId, ConstraintMarker)>> {
        self.enabled.then(|| list.plotting_data())
    }
}
