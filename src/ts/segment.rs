// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A contiguous, uniformly sampled block of waveform samples.

use super::TsError;

/// A uniformly sampled block of single-precision samples addressed by
/// epoch time. Alongside the current calibration, the calibration the
/// segment was created with is preserved so that a method chain can be
/// replayed from pristine values.
#[derive(Clone, Debug)]
pub struct Segment {
    t_begin: f64,
    dt: f64,
    data: Vec<f32>,
    calib: f64,
    calper: f64,
    initial_calib: f64,
    initial_calper: f64,
}

impl Segment {
    /// Make a new segment. `calib == 0` is replaced by 1; `dt` must be
    /// positive.
    pub fn new(
        data: Vec<f32>,
        t_begin: f64,
        dt: f64,
        calib: f64,
        calper: f64,
    ) -> Result<Segment, TsError> {
        if dt <= 0.0 {
            return Err(TsError::NonPositiveDt(dt));
        }
        let calib = if calib != 0.0 { calib } else { 1.0 };
        Ok(Segment {
            t_begin,
            dt,
            data,
            calib,
            calper,
            initial_calib: calib,
            initial_calper: calper,
        })
    }

    /// Make a new segment of `len` zeroed samples.
    pub fn zeros(len: usize, t_begin: f64, dt: f64, calib: f64, calper: f64) -> Result<Segment, TsError> {
        Segment::new(vec![0.0; len], t_begin, dt, calib, calper)
    }

    /// Make a new segment from double-precision samples, narrowing to
    /// `f32`.
    pub fn from_f64(
        data: &[f64],
        t_begin: f64,
        dt: f64,
        calib: f64,
        calper: f64,
    ) -> Result<Segment, TsError> {
        Segment::new(data.iter().map(|&v| v as f32).collect(), t_begin, dt, calib, calper)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn t_begin(&self) -> f64 {
        self.t_begin
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Time of the last sample. Equals `t_begin` for an empty segment.
    pub fn t_end(&self) -> f64 {
        if self.data.is_empty() {
            self.t_begin
        } else {
            self.t_begin + (self.data.len() - 1) as f64 * self.dt
        }
    }

    /// Time of sample `i`.
    pub fn time(&self, i: usize) -> f64 {
        self.t_begin + i as f64 * self.dt
    }

    /// Index of the sample nearest to epoch time `t` (may be out of
    /// range; negative times round toward the first sample).
    pub fn index_at(&self, t: f64) -> i64 {
        ((t - self.t_begin) / self.dt).round() as i64
    }

    pub fn calib(&self) -> f64 {
        self.calib
    }

    pub fn calper(&self) -> f64 {
        self.calper
    }

    pub fn initial_calib(&self) -> f64 {
        self.initial_calib
    }

    pub fn initial_calper(&self) -> f64 {
        self.initial_calper
    }

    /// Set the calibration factor and period. A zero factor is replaced
    /// by 1. The initial calibration is not touched.
    pub fn set_calibration(&mut self, calib: f64, calper: f64) {
        self.calib = if calib != 0.0 { calib } else { 1.0 };
        self.calper = calper;
    }

    /// Replace the sample values. The replacement must cover the current
    /// length; extra input samples are ignored.
    pub fn set_data(&mut self, data: &[f32]) {
        let n = self.data.len();
        self.data.copy_from_slice(&data[..n]);
    }

    /// A copy of this segment over the index range `i1..i2` (end
    /// exclusive). The copy's initial calibration comes from this
    /// segment's initial values while its current calibration is carried
    /// over.
    pub fn subsegment(&self, i1: usize, i2: usize) -> Result<Segment, TsError> {
        if i1 >= self.data.len() || i2 <= i1 || i2 > self.data.len() {
            return Err(TsError::SubsegmentRange {
                i1,
                i2,
                len: self.data.len(),
            });
        }
        let mut seg = Segment::new(
            self.data[i1..i2].to_vec(),
            self.t_begin + i1 as f64 * self.dt,
            self.dt,
            self.initial_calib,
            self.initial_calper,
        )?;
        seg.calib = self.calib;
        seg.calper = self.calper;
        Ok(seg)
    }

    /// Keep only samples `i1..=i2`, clamping the range to the data. A
    /// range that misses the data entirely is a no-op.
    pub fn truncate(&mut self, i1: i64, i2: i64) {
        let len = self.data.len() as i64;
        if i1 >= len || i2 < 0 || i1 > i2 {
            return;
        }
        let i1 = i1.max(0) as usize;
        let i2 = i2.min(len - 1) as usize;
        self.t_begin += i1 as f64 * self.dt;
        self.data.drain(..i1);
        self.data.truncate(i2 - i1 + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    #[test]
    fn test_times() {
        let s = Segment::new(ramp(100), 1000.0, 0.025, 1.0, 1.0).unwrap();
        assert_abs_diff_eq!(s.time(0), 1000.0);
        assert_abs_diff_eq!(s.time(40), 1001.0);
        assert_abs_diff_eq!(s.t_end(), 1000.0 + 99.0 * 0.025);
        assert_eq!(s.index_at(1001.0), 40);
    }

    #[test]
    fn test_zero_calib_becomes_one() {
        let mut s = Segment::new(ramp(4), 0.0, 1.0, 0.0, 1.0).unwrap();
        assert_abs_diff_eq!(s.calib(), 1.0);
        s.set_calibration(0.0, 2.0);
        assert_abs_diff_eq!(s.calib(), 1.0);
        s.set_calibration(0.5, 2.0);
        assert_abs_diff_eq!(s.calib(), 0.5);
        // The as-created calibration survives for replay.
        assert_abs_diff_eq!(s.initial_calib(), 1.0);
    }

    #[test]
    fn test_bad_dt_rejected() {
        assert!(Segment::new(ramp(4), 0.0, 0.0, 1.0, 1.0).is_err());
        assert!(Segment::new(ramp(4), 0.0, -0.5, 1.0, 1.0).is_err());
    }

    #[test]
    fn test_subsegment() {
        let s = Segment::new(ramp(10), 100.0, 0.5, 2.0, 1.0).unwrap();
        let sub = s.subsegment(2, 6).unwrap();
        assert_eq!(sub.len(), 4);
        assert_abs_diff_eq!(sub.t_begin(), 101.0);
        assert_eq!(sub.data(), &[2.0, 3.0, 4.0, 5.0]);

        assert!(s.subsegment(6, 2).is_err());
        assert!(s.subsegment(0, 11).is_err());
        assert!(s.subsegment(10, 10).is_err());
    }

    #[test]
    fn test_truncate() {
        let mut s = Segment::new(ramp(10), 0.0, 1.0, 1.0, 1.0).unwrap();
        s.truncate(3, 7);
        assert_eq!(s.len(), 5);
        assert_abs_diff_eq!(s.t_begin(), 3.0);
        assert_eq!(s.data()[0], 3.0);

        // Out-of-range indices clamp.
        let mut s = Segment::new(ramp(10), 0.0, 1.0, 1.0, 1.0).unwrap();
        s.truncate(-5, 100);
        assert_eq!(s.len(), 10);

        // A range missing the data is a no-op.
        let mut s = Segment::new(ramp(10), 0.0, 1.0, 1.0, 1.0).unwrap();
        s.truncate(20, 30);
        assert_eq!(s.len(), 10);
    }
}
