//! Compressed dose-volume histogram
//!
//! Stores the sorted per-voxel doses of one structure, subsampled to at
//! most `max_length` buckets, against a fixed descending percentile axis.
//! Slot 0 is an anchor at (100%, 0 Gy) so exported curves start on the
//! axis; the data buckets follow from slot 1.
//!
//! ```text
//! percentile: 100 | 100 ........................ 0
//! dose:         0 | min ........................ max
//! ```

use crate::export::DvhCurve;
use crate::{DoseVolumeError, Result};
use tracing::debug;

/// Default maximum number of data buckets
pub const DVH_MAX_LENGTH: usize = 1000;

/// Percentile distance within which a bucket is returned without interpolation
const SNAP_TOLERANCE: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct Dvh {
    n_voxels: usize,
    stride: usize,
    doses: Vec<f64>,
    percentiles: Vec<f64>,
    populated: bool,
}

impl Dvh {
    pub fn new(n_voxels: usize) -> Result<Self> {
        Self::with_max_length(n_voxels, DVH_MAX_LENGTH)
    }

    pub fn with_max_length(n_voxels: usize, max_length: usize) -> Result<Self> {
        if n_voxels == 0 || max_length == 0 {
            return Err(DoseVolumeError::DimensionMismatch {
                expected: 1,
                found: 0,
            });
        }

        let stride = if n_voxels <= max_length {
            1
        } else {
            (n_voxels + max_length - 1) / max_length
        };
        let buckets = (n_voxels + stride - 1) / stride;

        let mut percentiles = Vec::with_capacity(buckets + 1);
        percentiles.push(100.0);
        if buckets == 1 {
            percentiles.push(100.0);
        } else {
            let step = 100.0 / (buckets - 1) as f64;
            percentiles.extend((0..buckets).map(|i| {
                if i == buckets - 1 {
                    0.0
                } else {
                    100.0 - step * i as f64
                }
            }));
        }

        debug!(
            "DVH for {} voxels: stride {}, {} buckets",
            n_voxels, stride, buckets
        );

        Ok(Self {
            n_voxels,
            stride,
            doses: vec![0.0; buckets + 1],
            percentiles,
            populated: false,
        })
    }

    pub fn n_voxels(&self) -> usize {
        self.n_voxels
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Length of the stored curve arrays, anchor slot included.
    /// Fixed at construction, before any data is loaded.
    pub fn curve_len(&self) -> usize {
        self.doses.len()
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// Load a per-voxel dose vector of exactly `n_voxels` entries
    pub fn set_data(&mut self, y: &[f64]) -> Result<()> {
        if y.len() != self.n_voxels {
            return Err(DoseVolumeError::DimensionMismatch {
                expected: self.n_voxels,
                found: y.len(),
            });
        }
        if let Some(bad) = y.iter().find(|v| !v.is_finite()) {
            return Err(DoseVolumeError::InvalidValue {
                field: "voxel dose",
                value: *bad,
            });
        }

        let mut sorted = y.to_vec();
        sorted.sort_by(f64::total_cmp);

        for (slot, dose) in self.doses[1..]
            .iter_mut()
            .zip(sorted.iter().step_by(self.stride))
        {
            *slot = *dose;
        }
        if let (Some(last), Some(max)) = (self.doses.last_mut(), sorted.last()) {
            *last = *max;
        }

        self.populated = true;
        Ok(())
    }

    /// Sorted, subsampled doses without the anchor slot
    pub fn data(&self) -> Option<&[f64]> {
        self.populated.then(|| &self.doses[1..])
    }

    pub fn min_dose(&self) -> Option<f64> {
        self.populated.then(|| self.doses[1])
    }

    pub fn max_dose(&self) -> Option<f64> {
        self.populated.then(|| self.doses[self.doses.len() - 1])
    }

    /// Dose received by at least `percentile` percent of the structure
    pub fn dose_at_percentile(&self, percentile: f64) -> Result<f64> {
        if !self.populated {
            return Err(DoseVolumeError::NotPopulated);
        }
        if !percentile.is_finite() || !(0.0..=100.0).contains(&percentile) {
            return Err(DoseVolumeError::InvalidValue {
                field: "percentile",
                value: percentile,
            });
        }

        let last = self.doses.len() - 1;
        if percentile == 100.0 || last == 1 {
            return Ok(self.doses[1]);
        }
        if percentile == 0.0 {
            return Ok(self.doses[last]);
        }

        // percentiles descend: keep percentiles[lo] > p >= percentiles[hi]
        let mut lo = 1;
        let mut hi = last;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.percentiles[mid] > percentile {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        let p1 = self.percentiles[lo];
        let p2 = self.percentiles[hi];
        let half_bucket = (self.percentiles[last - 1] - self.percentiles[last]) / 2.0;

        let nearest = if p1 - percentile < percentile - p2 { lo } else { hi };
        if half_bucket <= SNAP_TOLERANCE
            || (self.percentiles[nearest] - percentile).abs() <= SNAP_TOLERANCE
        {
            return Ok(self.doses[nearest]);
        }

        let alpha = (percentile - p2) / (p1 - p2);
        Ok(alpha * self.doses[lo] + (1.0 - alpha) * self.doses[hi])
    }

    /// Full percentile/dose arrays, anchor slot included
    pub fn plotting_data(&self) -> DvhCurve {
        DvhCurve {
            percentile: self.percentiles.clone(),
            dose: self.doses.clone(),
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]

        // Dose never decreases as the percentile threshold drops
        #[test]
        fn fuzz_dose_monotone_in_percentile(
            y in prop::collection::vec(0.0f64..80.0, 1..3000),
            mut ps in prop::collection::vec(0.0f64..=100.0, 2..40),
        ) {
            let mut dvh = Dvh::new(y.len()).unwrap();
            dvh.set_data(&y).unwrap();

            ps.sort_by(|a, b| b.total_cmp(a));
            let doses: Vec<f64> = ps.iter().map(|p| dvh.dose_at_percentile(*p).unwrap()).collect();
            for pair in doses.windows(2) {
                prop_assert!(pair[1] >= pair[0] - 1e-9);
            }
        }

        // Every query stays within the observed dose range
        #[test]
        fn fuzz_dose_within_range(
            y in prop::collection::vec(0.0f64..80.0, 1..3000),
            p in 0.0f64..=100.0,
        ) {
            let mut dvh = Dvh::new(y.len()).unwrap();
            dvh.set_data(&y).unwrap();

            let lo = y.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let d = dvh.dose_at_percentile(p).unwrap();
            prop_assert!(d >= lo - 1e-9 && d <= hi + 1e-9);
        }
    }
}
