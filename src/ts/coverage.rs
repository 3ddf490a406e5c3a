// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Periods of complete data coverage across a set of time series.
//!
//! A coverage window is a time interval over which every input channel
//! has contiguous samples. The computation is a recursive product over
//! the segments of the first input, clipping the candidate window
//! against each further input in turn.

use ndarray::Array2;
use thiserror::Error;

use super::TimeSeries;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("coverage requires at least one time series")]
    NoSeries,

    #[error(
        "sample interval {dt} differs from the first channel's {expected} by more than the tolerance"
    )]
    SampleRate { dt: f64, expected: f64 },
}

/// The place of one channel inside a coverage window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSlot {
    /// Index of the covering segment within its series.
    pub segment: usize,
    /// Index of the first sample of the window within that segment.
    pub begin: usize,
}

/// One time interval over which every input channel has contiguous
/// samples. Every channel has at least `npts` samples starting at its
/// slot's begin index.
#[derive(Clone, Debug)]
pub struct CoverageWindow {
    pub t_min: f64,
    pub t_max: f64,
    pub npts: usize,
    pub slots: Vec<WindowSlot>,
}

impl CoverageWindow {
    /// Materialize the aligned samples of this window as a
    /// channels-by-samples array. `ts` must be the series the coverage
    /// was computed over, in the same order.
    pub fn aligned(&self, ts: &[&TimeSeries]) -> Array2<f32> {
        let mut out = Array2::zeros((self.slots.len(), self.npts));
        for (c, slot) in self.slots.iter().enumerate() {
            let data = ts[c].segment(slot.segment).data();
            for (j, v) in out.row_mut(c).iter_mut().enumerate() {
                *v = data[slot.begin + j];
            }
        }
        out
    }
}

/// The coverage windows of a set of series over a requested interval, in
/// ascending time order.
#[derive(Clone, Debug, Default)]
pub struct Coverage {
    windows: Vec<CoverageWindow>,
    dt: f64,
}

impl Coverage {
    /// Determine the periods of complete data coverage for `ts` within
    /// `[t_min, t_max]`. The window is first clipped to the span common
    /// to all inputs. Fails when a candidate segment's sample interval
    /// differs from the first input's by more than its tolerance.
    pub fn new(ts: &[&TimeSeries], t_min: f64, t_max: f64) -> Result<Coverage, CoverageError> {
        if ts.is_empty() {
            return Err(CoverageError::NoSeries);
        }
        let mut t_min = t_min;
        let mut t_max = t_max;
        for t in ts {
            if !t.is_empty() {
                t_min = t_min.max(t.t_begin());
                t_max = t_max.min(t.t_end());
            }
        }

        let tol = ts[0].dt_tolerance();
        let mut cov = Coverage::default();
        let mut slots = vec![WindowSlot { segment: 0, begin: 0 }; ts.len()];
        cov.recurse(ts, 0, &mut slots, t_min, t_max, tol)?;
        cov.index_windows(ts);
        Ok(cov)
    }

    /// Coverage over the full common span of the inputs.
    pub fn full(ts: &[&TimeSeries]) -> Result<Coverage, CoverageError> {
        let t0 = ts.first().ok_or(CoverageError::NoSeries)?;
        Coverage::new(ts, t0.t_begin(), t0.t_end())
    }

    fn recurse(
        &mut self,
        ts: &[&TimeSeries],
        i: usize,
        slots: &mut Vec<WindowSlot>,
        t_min: f64,
        t_max: f64,
        tol: f64,
    ) -> Result<(), CoverageError> {
        if i >= ts.len() {
            self.windows.push(CoverageWindow {
                t_min,
                t_max,
                npts: 0,
                slots: slots.clone(),
            });
            return Ok(());
        }
        for (j, s) in ts[i].segments().iter().enumerate() {
            if !s.is_empty() && s.t_begin() < t_max && s.t_end() > t_min {
                let t_beg = t_min.max(s.t_begin());
                let t_end = t_max.min(s.t_end());
                if i == 0 {
                    self.dt = s.dt();
                } else if (self.dt - s.dt()).abs() / self.dt > tol {
                    return Err(CoverageError::SampleRate {
                        dt: s.dt(),
                        expected: self.dt,
                    });
                }
                slots[i].segment = j;
                self.recurse(ts, i + 1, slots, t_beg, t_end, tol)?;
            }
        }
        Ok(())
    }

    /// Fill in begin indices and reconcile the per-channel sample counts
    /// to the shortest span.
    fn index_windows(&mut self, ts: &[&TimeSeries]) {
        for w in &mut self.windows {
            let mut n = 0usize;
            for (c, slot) in w.slots.iter_mut().enumerate() {
                let s = ts[c].segment(slot.segment);
                let dt = s.dt();
                let len = s.len() as i64;

                let mut beg = ((w.t_min - s.t_begin()) / dt + 0.5) as i64;
                if s.t_begin() + beg as f64 * dt < w.t_min {
                    beg += 1;
                }
                beg = beg.clamp(0, len - 1);

                let mut end = ((w.t_max - s.t_begin()) / dt + 0.5) as i64;
                if s.t_begin() + end as f64 * dt > w.t_max {
                    end -= 1;
                }
                end = end.clamp(0, len - 1);

                let count = (end - beg + 1).max(0) as usize;
                if c == 0 || count < n {
                    n = count;
                }
                slot.begin = beg as usize;
            }
            w.npts = n;
        }
        // Degenerate windows (shorter than a sample) carry no data.
        self.windows.retain(|w| w.npts > 0);
    }

    pub fn windows(&self) -> &[CoverageWindow] {
        &self.windows
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Sample interval of the coverage (the first channel's).
    pub fn dt(&self) -> f64 {
        self.dt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::Segment;
    use approx::assert_abs_diff_eq;

    fn series(spans: &[(f64, usize)]) -> TimeSeries {
        let mut ts = TimeSeries::new();
        for &(t0, n) in spans {
            ts.add_segment(Segment::new(vec![1.0; n], t0, 1.0, 1.0, 1.0).unwrap())
                .unwrap();
        }
        ts
    }

    #[test]
    fn test_two_channel_windows() {
        // T1 = [0,10] + [15,25], T2 = [5,20] over [0,30] -> [5,10] and
        // [15,20].
        let t1 = series(&[(0.0, 11), (15.0, 11)]);
        let t2 = series(&[(5.0, 16)]);
        let cov = Coverage::new(&[&t1, &t2], 0.0, 30.0).unwrap();
        let w = cov.windows();
        assert_eq!(w.len(), 2);
        assert_abs_diff_eq!(w[0].t_min, 5.0);
        assert_abs_diff_eq!(w[0].t_max, 10.0);
        assert_eq!(w[0].npts, 6);
        assert_abs_diff_eq!(w[1].t_min, 15.0);
        assert_abs_diff_eq!(w[1].t_max, 20.0);
        assert_eq!(w[1].npts, 6);

        // Channel begin indices point at the window start.
        assert_eq!(w[0].slots[0], WindowSlot { segment: 0, begin: 5 });
        assert_eq!(w[0].slots[1], WindowSlot { segment: 0, begin: 0 });
        assert_eq!(w[1].slots[0], WindowSlot { segment: 1, begin: 0 });
        assert_eq!(w[1].slots[1], WindowSlot { segment: 0, begin: 10 });
    }

    #[test]
    fn test_windows_partition_intersection() {
        // Where both inputs are continuous, the windows cover the
        // intersection without gaps and without reaching outside it.
        let t1 = series(&[(2.0, 50)]);
        let t2 = series(&[(0.0, 30), (30.0, 30)]);
        let cov = Coverage::new(&[&t1, &t2], 0.0, 100.0).unwrap();
        let w = cov.windows();
        assert_eq!(w.len(), 2);
        assert_abs_diff_eq!(w[0].t_min, 2.0);
        assert_abs_diff_eq!(w[0].t_max, 29.0);
        assert_abs_diff_eq!(w[1].t_min, 30.0);
        assert_abs_diff_eq!(w[1].t_max, 51.0);
    }

    #[test]
    fn test_sample_rate_exception() {
        let t1 = series(&[(0.0, 10)]);
        let mut t2 = TimeSeries::new();
        t2.add_segment(Segment::new(vec![1.0; 20], 0.0, 0.5, 1.0, 1.0).unwrap())
            .unwrap();
        assert!(matches!(
            Coverage::new(&[&t1, &t2], 0.0, 10.0),
            Err(CoverageError::SampleRate { .. })
        ));
    }

    #[test]
    fn test_aligned_view() {
        let t1 = series(&[(0.0, 20)]);
        let t2 = series(&[(5.0, 10)]);
        let cov = Coverage::new(&[&t1, &t2], 0.0, 20.0).unwrap();
        let w = &cov.windows()[0];
        let a = w.aligned(&[&t1, &t2]);
        assert_eq!(a.dim(), (2, w.npts));
    }

    #[test]
    fn test_no_series() {
        assert!(matches!(
            Coverage::new(&[], 0.0, 1.0),
            Err(CoverageError::NoSeries)
        ));
    }
}
