// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Remove the overall mean from a series.

use std::fmt;

use crate::ts::TimeSeries;

/// Subtracts the mean over *all* segments from every sample. Because the
/// mean is a whole-series quantity this method cannot be applied to an
/// appended segment on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Demean;

impl Demean {
    pub fn apply(&self, ts: &mut TimeSeries) {
        let mean = ts.mean() as f32;
        for seg in ts.segments_mut() {
            for v in seg.data_mut() {
                *v -= mean;
            }
        }
    }
}

impl fmt::Display for Demean {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Demean")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::Segment;

    #[test]
    fn test_constant_becomes_zero() {
        // A single 1 Hz segment of 1000 samples, constant value 5.0:
        // mean removed leaves all samples 0.0.
        let mut ts = TimeSeries::new();
        ts.add_segment(Segment::new(vec![5.0; 1000], 0.0, 1.0, 1.0, 1.0).unwrap())
            .unwrap();
        Demean.apply(&mut ts);
        assert!(ts.segment(0).data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_mean_is_across_segments() {
        let mut ts = TimeSeries::new();
        ts.add_segment(Segment::new(vec![1.0; 10], 0.0, 1.0, 1.0, 1.0).unwrap())
            .unwrap();
        ts.add_segment(Segment::new(vec![3.0; 10], 100.0, 1.0, 1.0, 1.0).unwrap())
            .unwrap();
        Demean.apply(&mut ts);
        assert!(ts.segment(0).data().iter().all(|&v| v == -1.0));
        assert!(ts.segment(1).data().iter().all(|&v| v == 1.0));
    }
}
