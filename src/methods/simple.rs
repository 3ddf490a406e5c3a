// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The small sample-domain operators: calibration, raw-copy, window
//! cut, constant offset, amplitude scale and FIR convolution.

use std::fmt;

use crate::ts::{Segment, TimeSeries};

/// Apply (counts to physical units) or remove the per-segment
/// calibration gain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalibData {
    remove: bool,
}

impl CalibData {
    pub fn apply_gain() -> CalibData {
        CalibData { remove: false }
    }

    pub fn remove_gain() -> CalibData {
        CalibData { remove: true }
    }

    pub fn apply(&self, ts: &mut TimeSeries) {
        for seg in ts.segments_mut() {
            self.apply_segment(seg);
        }
    }

    pub fn apply_segment(&self, seg: &mut Segment) {
        let calib = seg.calib();
        if calib == 1.0 {
            return;
        }
        let factor = if self.remove { 1.0 / calib } else { calib } as f32;
        for v in seg.data_mut() {
            *v *= factor;
        }
    }
}

impl fmt::Display for CalibData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CalibData: remove={}", i32::from(self.remove))
    }
}

/// Restore the raw, as-read samples (a chain containing only a copy is a
/// chain of nothing).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyData;

impl CopyData {
    pub fn apply(&self, ts: &mut TimeSeries) {
        ts.restore_raw();
    }
}

impl fmt::Display for CopyData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CopyData")
    }
}

/// Truncate the series to a time window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CutData {
    t_min: f64,
    t_max: f64,
}

impl CutData {
    pub fn new(t_min: f64, t_max: f64) -> CutData {
        CutData { t_min, t_max }
    }

    pub fn apply(&self, ts: &mut TimeSeries) {
        let cut = ts.subseries(self.t_min, self.t_max);
        ts.remove_all_segments();
        for seg in cut.segments() {
            // Truncations of non-overlapping segments cannot overlap.
            let _ = ts.push_current(seg.clone());
        }
    }
}

impl fmt::Display for CutData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CutData: {:.2} {:.2}", self.t_min, self.t_max)
    }
}

/// Add a constant to every sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OffsetData {
    offset: f64,
}

impl OffsetData {
    pub fn new(offset: f64) -> OffsetData {
        OffsetData { offset }
    }

    pub fn apply(&self, ts: &mut TimeSeries) {
        for seg in ts.segments_mut() {
            self.apply_segment(seg);
        }
    }

    pub fn apply_segment(&self, seg: &mut Segment) {
        let offset = self.offset as f32;
        for v in seg.data_mut() {
            *v += offset;
        }
    }
}

impl fmt::Display for OffsetData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OffsetData: offset={}", self.offset)
    }
}

/// Scale every sample by a constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AmpData {
    factor: f64,
}

impl AmpData {
    pub fn new(factor: f64) -> AmpData {
        AmpData { factor }
    }

    pub fn apply(&self, ts: &mut TimeSeries) {
        for seg in ts.segments_mut() {
            self.apply_segment(seg);
        }
    }

    pub fn apply_segment(&self, seg: &mut Segment) {
        let factor = self.factor as f32;
        for v in seg.data_mut() {
            *v *= factor;
        }
    }
}

impl fmt::Display for AmpData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AmpData: factor={}", self.factor)
    }
}

/// Convolve each segment with a FIR kernel (same-length output, kernel
/// anchored at its first tap).
#[derive(Clone, Debug, PartialEq)]
pub struct ConvolveData {
    kernel: Vec<f64>,
}

impl ConvolveData {
    pub fn new(kernel: Vec<f64>) -> ConvolveData {
        ConvolveData { kernel }
    }

    pub fn apply(&self, ts: &mut TimeSeries) {
        for seg in ts.segments_mut() {
            self.apply_segment(seg);
        }
    }

    pub fn apply_segment(&self, seg: &mut Segment) {
        if self.kernel.is_empty() {
            return;
        }
        let input: Vec<f64> = seg.data().iter().map(|&v| f64::from(v)).collect();
        for (i, v) in seg.data_mut().iter_mut().enumerate() {
            let mut acc = 0.0;
            for (k, &h) in self.kernel.iter().enumerate() {
                if k > i {
                    break;
                }
                acc += h * input[i - k];
            }
            *v = acc as f32;
        }
    }
}

impl fmt::Display for ConvolveData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConvolveData: ntaps={}", self.kernel.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn series(data: Vec<f32>, calib: f64) -> TimeSeries {
        let mut ts = TimeSeries::new();
        ts.add_segment(Segment::new(data, 0.0, 1.0, calib, 1.0).unwrap())
            .unwrap();
        ts
    }

    #[test]
    fn test_calib_and_inverse() {
        let mut ts = series(vec![2.0; 10], 0.5);
        CalibData::apply_gain().apply(&mut ts);
        assert_abs_diff_eq!(ts.segment(0).data()[0], 1.0);
        CalibData::remove_gain().apply(&mut ts);
        assert_abs_diff_eq!(ts.segment(0).data()[0], 2.0);
    }

    #[test]
    fn test_copy_restores_raw() {
        let mut ts = series(vec![1.0; 10], 1.0);
        OffsetData::new(4.0).apply(&mut ts);
        assert_abs_diff_eq!(ts.segment(0).data()[0], 5.0);
        CopyData.apply(&mut ts);
        assert_abs_diff_eq!(ts.segment(0).data()[0], 1.0);
    }

    #[test]
    fn test_cut() {
        let mut ts = series((0..20).map(|i| i as f32).collect(), 1.0);
        CutData::new(5.0, 9.0).apply(&mut ts);
        assert_eq!(ts.segment(0).data(), &[5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_amp_and_offset() {
        let mut ts = series(vec![3.0; 4], 1.0);
        AmpData::new(2.0).apply(&mut ts);
        OffsetData::new(-1.0).apply(&mut ts);
        assert!(ts.segment(0).data().iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_convolve_identity_and_delay() {
        let mut ts = series(vec![1.0, 2.0, 3.0, 4.0], 1.0);
        ConvolveData::new(vec![1.0]).apply(&mut ts);
        assert_eq!(ts.segment(0).data(), &[1.0, 2.0, 3.0, 4.0]);

        ConvolveData::new(vec![0.0, 1.0]).apply(&mut ts);
        assert_eq!(ts.segment(0).data(), &[0.0, 1.0, 2.0, 3.0]);
    }
}
