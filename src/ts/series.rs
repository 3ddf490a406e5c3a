// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An ordered collection of segments for one channel, together with the
//! channel metadata and the chain of data methods applied to it.

use super::{Segment, TsError};
use crate::methods::DataMethod;

/// Segmented waveform data for a single channel.
///
/// Segments are kept strictly ordered by begin time and never overlap.
/// The series retains the segments as they were added (the "raw"
/// samples) so that the applied method chain can be replayed at any
/// time; the invariant is that the current samples always equal the
/// result of replaying the chain over the raw samples.
#[derive(Clone, Debug, Default)]
pub struct TimeSeries {
    sta: String,
    chan: String,
    net: String,
    lat: Option<f64>,
    lon: Option<f64>,
    elev: Option<f64>,
    hang: Option<f64>,
    vang: Option<f64>,
    euler: Option<(f64, f64, f64)>,
    dt_tolerance: f64,
    segments: Vec<Segment>,
    raw: Vec<Segment>,
    methods: Vec<DataMethod>,
}

impl TimeSeries {
    pub fn new() -> TimeSeries {
        TimeSeries {
            dt_tolerance: crate::constants::DEFAULT_DT_TOLERANCE,
            ..TimeSeries::default()
        }
    }

    /// A new, empty series carrying this series' channel metadata.
    pub fn empty_copy(&self) -> TimeSeries {
        TimeSeries {
            segments: vec![],
            raw: vec![],
            methods: vec![],
            ..self.clone()
        }
    }

    pub fn set_channel(&mut self, sta: &str, chan: &str, net: &str) {
        self.sta = sta.to_string();
        self.chan = chan.to_string();
        self.net = net.to_string();
    }

    pub fn sta(&self) -> &str {
        &self.sta
    }

    pub fn chan(&self) -> &str {
        &self.chan
    }

    pub fn net(&self) -> &str {
        &self.net
    }

    pub fn set_coordinates(&mut self, lat: f64, lon: f64, elev: f64) {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self.elev = Some(elev);
    }

    pub fn lat(&self) -> Option<f64> {
        self.lat
    }

    pub fn lon(&self) -> Option<f64> {
        self.lon
    }

    pub fn elev(&self) -> Option<f64> {
        self.elev
    }

    /// Component orientation: `hang` is measured clockwise from north,
    /// `vang` from vertical (90 = horizontal).
    pub fn set_orientation(&mut self, hang: f64, vang: f64) {
        self.hang = Some(hang);
        self.vang = Some(vang);
    }

    pub fn hang(&self) -> Option<f64> {
        self.hang
    }

    pub fn vang(&self) -> Option<f64> {
        self.vang
    }

    /// The Euler angles (alpha, beta, gamma) of the series' current
    /// rotation state, or `None` if it has never been oriented.
    pub fn euler(&self) -> Option<(f64, f64, f64)> {
        self.euler
    }

    pub fn set_euler(&mut self, alpha: f64, beta: f64, gamma: f64) {
        self.euler = Some((alpha, beta, gamma));
    }

    /// Relative tolerance used when comparing sample intervals.
    pub fn dt_tolerance(&self) -> f64 {
        self.dt_tolerance
    }

    pub fn set_dt_tolerance(&mut self, tol: f64) {
        self.dt_tolerance = tol;
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, i: usize) -> &Segment {
        &self.segments[i]
    }

    pub(crate) fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    /// Sample interval of the first segment.
    pub fn dt(&self) -> Option<f64> {
        self.segments.first().map(|s| s.dt())
    }

    pub fn t_begin(&self) -> f64 {
        self.segments.first().map(|s| s.t_begin()).unwrap_or(0.0)
    }

    pub fn t_end(&self) -> f64 {
        self.segments.last().map(|s| s.t_end()).unwrap_or(0.0)
    }

    /// Total number of samples across all segments.
    pub fn npts(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Append a segment, preserving time order. The segment is also
    /// retained as raw data for method replay. Overlapping segments and
    /// segments whose sample interval disagrees with the series beyond
    /// the tolerance are rejected.
    pub fn add_segment(&mut self, seg: Segment) -> Result<(), TsError> {
        if let Some(dt) = self.dt() {
            if (dt - seg.dt()).abs() / dt > self.dt_tolerance {
                return Err(TsError::IncompatibleDt {
                    dt: seg.dt(),
                    expected: dt,
                });
            }
        }
        let pos = self.insertion_point(&seg)?;
        self.raw.insert(pos, seg.clone());
        self.segments.insert(pos, seg);
        Ok(())
    }

    /// Append a segment to the current data only, leaving the raw
    /// segments untouched. Used by operators (rotation) that rebuild the
    /// current samples.
    pub(crate) fn push_current(&mut self, seg: Segment) -> Result<(), TsError> {
        let pos = self.insertion_point(&seg)?;
        self.segments.insert(pos, seg);
        Ok(())
    }

    fn insertion_point(&self, seg: &Segment) -> Result<usize, TsError> {
        let pos = self
            .segments
            .partition_point(|s| s.t_begin() < seg.t_begin());
        if pos > 0 && self.segments[pos - 1].t_end() >= seg.t_begin() {
            return Err(TsError::OverlappingSegment {
                t_begin: seg.t_begin(),
            });
        }
        if pos < self.segments.len() && seg.t_end() >= self.segments[pos].t_begin() {
            return Err(TsError::OverlappingSegment {
                t_begin: seg.t_begin(),
            });
        }
        Ok(pos)
    }

    /// Drop all current segments. Raw segments are retained for replay.
    pub fn remove_all_segments(&mut self) {
        self.segments.clear();
    }

    /// Restore the current samples to the raw, as-added state.
    pub(crate) fn restore_raw(&mut self) {
        self.segments = self.raw.clone();
    }

    /// Mean of all samples across all segments; 0 for an empty series.
    pub fn mean(&self) -> f64 {
        let n = self.npts();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .segments
            .iter()
            .flat_map(|s| s.data().iter())
            .map(|&v| v as f64)
            .sum();
        sum / n as f64
    }

    /// A new series containing this series' data truncated to
    /// `[t1, t2]`. The method chain is not carried over; the truncated
    /// samples become the new series' raw data.
    pub fn subseries(&self, t1: f64, t2: f64) -> TimeSeries {
        let mut out = self.empty_copy();
        for s in &self.segments {
            if s.t_begin() > t2 || s.t_end() < t1 {
                continue;
            }
            let eps = 1e-6 * s.dt();
            let i1 = (((t1 - s.t_begin()) / s.dt() - eps).ceil() as i64).max(0);
            let i2 = ((t2 - s.t_begin()) / s.dt() + eps).floor() as i64;
            let mut seg = s.clone();
            seg.truncate(i1, i2);
            if !seg.is_empty() {
                // Cannot overlap: the inputs didn't.
                let _ = out.add_segment(seg);
            }
        }
        out
    }

    /// Does segment `i` connect to segment `i-1` without a gap? The
    /// expected begin time is one sample interval past the previous
    /// segment's end; `tol_start`/`tol_end` bound the acceptable early
    /// and late deviation. Segment 0 never connects.
    pub fn continuous(&self, i: usize, tol_start: f64, tol_end: f64) -> bool {
        if i == 0 || i >= self.segments.len() {
            return false;
        }
        let prev = &self.segments[i - 1];
        let expected = prev.t_end() + prev.dt();
        let gap = self.segments[i].t_begin() - expected;
        gap > -tol_start && gap < tol_end
    }

    pub fn methods(&self) -> &[DataMethod] {
        &self.methods
    }

    pub(crate) fn methods_mut(&mut self) -> &mut Vec<DataMethod> {
        &mut self.methods
    }

    /// The most recently applied method with the given name.
    pub fn get_method(&self, name: &str) -> Option<&DataMethod> {
        self.methods.iter().rev().find(|m| m.name() == name)
    }

    /// Drop the whole method chain without touching the samples.
    pub fn remove_all_methods(&mut self) {
        self.methods.clear();
    }
}
