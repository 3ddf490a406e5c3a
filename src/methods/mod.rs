// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Replayable sample-domain operators.
//!
//! A [`DataMethod`] is a tagged operator applied to one or more time
//! series. Each series carries the ordered list of method instances that
//! have been applied to it; the invariant maintained by the chain
//! operations here is that the current samples always equal the result
//! of replaying the chain, in order, over the raw samples.

mod demean;
mod hilbert;
mod iir;
mod rotate;
mod simple;
mod taper;

pub use demean::Demean;
pub use hilbert::Hilbert;
pub use iir::{FilterType, IirFilter};
pub use rotate::{max_angle, max_angles, Rotation};
pub use simple::{AmpData, CalibData, ConvolveData, CopyData, CutData, OffsetData};
pub use taper::{TaperData, TaperType};

use std::fmt;

use thiserror::Error;

use crate::ts::{CoverageError, Segment, TimeSeries, TsError};

#[derive(Error, Debug)]
pub enum MethodError {
    #[error("time series has no samples")]
    EmptySeries,

    #[error("filter order {0} is outside 1..=10")]
    FilterOrder(usize),

    #[error("sample interval must be positive, got {0}")]
    BadSampleInterval(f64),

    #[error("bad corner frequencies flow={flow} fhigh={fhigh} for {ftype} (Nyquist {nyquist})")]
    CornerFreqs {
        ftype: FilterType,
        flow: f64,
        fhigh: f64,
        nyquist: f64,
    },

    #[error("{method} cannot be applied to a single segment")]
    SegmentApply { method: &'static str },

    #[error("rotation needs 2 or 3 matching components, got {0}")]
    ComponentCount(usize),

    #[error("{sta}/{chan}: component orientation is unknown")]
    UnknownOrientation { sta: String, chan: String },

    #[error("components have incompatible sample rates")]
    VariableSampleRate,

    #[error("rotation entries disagree across the component set")]
    ConflictingRotation,

    #[error(transparent)]
    Ts(#[from] TsError),

    #[error(transparent)]
    Coverage(#[from] CoverageError),
}

/// A sample-domain operator. Dispatch is by variant; the capabilities
/// each operator declares (`can_append`, `rotation_commutative`) steer
/// how the chain machinery may re-apply it.
#[derive(Clone, Debug)]
pub enum DataMethod {
    Demean(Demean),
    Taper(TaperData),
    IirFilter(IirFilter),
    Rotate(Rotation),
    Hilbert(Hilbert),
    Calib(CalibData),
    Copy(CopyData),
    Cut(CutData),
    Offset(OffsetData),
    Convolve(ConvolveData),
    Amp(AmpData),
}

impl DataMethod {
    /// The method's class name, used by name-based chain edits.
    pub fn name(&self) -> &'static str {
        match self {
            DataMethod::Demean(_) => "Demean",
            DataMethod::Taper(_) => "TaperData",
            DataMethod::IirFilter(_) => "IIRFilter",
            DataMethod::Rotate(_) => "RotateData",
            DataMethod::Hilbert(_) => "Hilbert",
            DataMethod::Calib(_) => "CalibData",
            DataMethod::Copy(_) => "CopyData",
            DataMethod::Cut(_) => "CutData",
            DataMethod::Offset(_) => "OffsetData",
            DataMethod::Convolve(_) => "ConvolveData",
            DataMethod::Amp(_) => "AmpData",
        }
    }

    pub fn same_type(&self, other: &DataMethod) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// May the method be applied to a newly appended segment
    /// independently of the earlier ones?
    pub fn can_append(&self) -> bool {
        match self {
            DataMethod::IirFilter(_) => true,
            DataMethod::Taper(t) => t.can_append(),
            _ => false,
        }
    }

    /// Does the method commute with component rotation? When it does,
    /// the caller is free to always rotate first.
    pub fn rotation_commutative(&self) -> bool {
        matches!(self, DataMethod::IirFilter(_) | DataMethod::Taper(_))
    }

    /// Apply the method to a set of series. Most methods treat the
    /// series independently; rotation consumes the whole set as one
    /// component group.
    pub fn apply(&mut self, ts: &mut [&mut TimeSeries]) -> Result<(), MethodError> {
        if let DataMethod::Rotate(r) = self {
            return r.apply(ts);
        }
        for t in ts.iter_mut() {
            self.apply_single(t)?;
        }
        Ok(())
    }

    /// Apply the method to one series. Fails for rotation, which needs
    /// its component set.
    pub fn apply_single(&mut self, ts: &mut TimeSeries) -> Result<(), MethodError> {
        match self {
            DataMethod::Demean(m) => m.apply(ts),
            DataMethod::Taper(m) => m.apply(ts),
            DataMethod::IirFilter(m) => m.apply_series(ts),
            DataMethod::Rotate(_) => return Err(MethodError::ComponentCount(1)),
            DataMethod::Hilbert(m) => m.apply(ts),
            DataMethod::Calib(m) => m.apply(ts),
            DataMethod::Copy(m) => m.apply(ts),
            DataMethod::Cut(m) => m.apply(ts),
            DataMethod::Offset(m) => m.apply(ts),
            DataMethod::Convolve(m) => m.apply(ts),
            DataMethod::Amp(m) => m.apply(ts),
        }
        Ok(())
    }

    /// Apply the method to a single segment, where that is meaningful.
    pub fn apply_to_segment(&mut self, seg: &mut Segment) -> Result<(), MethodError> {
        match self {
            DataMethod::Taper(m) => m.apply_segment(seg),
            DataMethod::IirFilter(m) => m.apply_samples(seg.data_mut(), true),
            DataMethod::Hilbert(m) => m.apply_segment(seg),
            DataMethod::Calib(m) => m.apply_segment(seg),
            DataMethod::Offset(m) => m.apply_segment(seg),
            DataMethod::Amp(m) => m.apply_segment(seg),
            DataMethod::Convolve(m) => m.apply_segment(seg),
            _ => {
                return Err(MethodError::SegmentApply {
                    method: self.name(),
                })
            }
        }
        Ok(())
    }

    /// Apply the method to a segment appended without a gap, continuing
    /// any streaming state instead of resetting it.
    pub fn continue_segment(&mut self, seg: &mut Segment) -> Result<(), MethodError> {
        if let DataMethod::IirFilter(m) = self {
            m.apply_samples(seg.data_mut(), false);
            return Ok(());
        }
        self.apply_to_segment(seg)
    }
}

impl fmt::Display for DataMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DataMethod::Demean(m) => fmt::Display::fmt(m, f),
            DataMethod::Taper(m) => fmt::Display::fmt(m, f),
            DataMethod::IirFilter(m) => fmt::Display::fmt(m, f),
            DataMethod::Rotate(m) => fmt::Display::fmt(m, f),
            DataMethod::Hilbert(m) => fmt::Display::fmt(m, f),
            DataMethod::Calib(m) => fmt::Display::fmt(m, f),
            DataMethod::Copy(m) => fmt::Display::fmt(m, f),
            DataMethod::Cut(m) => fmt::Display::fmt(m, f),
            DataMethod::Offset(m) => fmt::Display::fmt(m, f),
            DataMethod::Convolve(m) => fmt::Display::fmt(m, f),
            DataMethod::Amp(m) => fmt::Display::fmt(m, f),
        }
    }
}

/// Run each method in order over the set and append it to every chain.
pub fn apply_methods(
    methods: &[DataMethod],
    ts: &mut [&mut TimeSeries],
) -> Result<(), MethodError> {
    for m in methods {
        let mut inst = m.clone();
        inst.apply(ts)?;
        for t in ts.iter_mut() {
            t.methods_mut().push(inst.clone());
        }
    }
    Ok(())
}

/// Replace the most recent subsequence of each chain whose class types
/// match `methods` (in order) with `methods`; when no such subsequence
/// exists, prepend. The raw samples are then re-read and the full chain
/// replayed.
pub fn change_methods(
    methods: &[DataMethod],
    ts: &mut [&mut TimeSeries],
) -> Result<(), MethodError> {
    for t in ts.iter_mut() {
        let chain = t.methods_mut();
        let k = methods.len();
        let mut found = None;
        if k > 0 && chain.len() >= k {
            for start in (0..=chain.len() - k).rev() {
                if (0..k).all(|j| chain[start + j].same_type(&methods[j])) {
                    found = Some(start);
                    break;
                }
            }
        }
        match found {
            Some(start) => {
                for (j, m) in methods.iter().enumerate() {
                    chain[start + j] = m.clone();
                }
            }
            None => {
                for (j, m) in methods.iter().enumerate() {
                    chain.insert(j, m.clone());
                }
            }
        }
    }
    update(ts)
}

/// Strip every occurrence of the named methods from each chain and
/// replay what remains.
pub fn remove_methods(names: &[&str], ts: &mut [&mut TimeSeries]) -> Result<(), MethodError> {
    for t in ts.iter_mut() {
        t.methods_mut().retain(|m| !names.contains(&m.name()));
    }
    update(ts)
}

/// Replay the current chains against freshly restored raw samples.
///
/// Methods are replayed step-by-step across the set so that a rotation
/// entry is applied once to the whole component group. A step at which
/// some chains hold a rotation and others disagree is a conflicting
/// rotation state.
pub fn update(ts: &mut [&mut TimeSeries]) -> Result<(), MethodError> {
    for t in ts.iter_mut() {
        t.restore_raw();
    }
    let max_len = ts.iter().map(|t| t.methods().len()).max().unwrap_or(0);
    for step in 0..max_len {
        let any_rotate = ts
            .iter()
            .any(|t| matches!(t.methods().get(step), Some(DataMethod::Rotate(_))));
        if any_rotate {
            let rot = match ts[0].methods().get(step) {
                Some(DataMethod::Rotate(r)) => *r,
                _ => return Err(MethodError::ConflictingRotation),
            };
            for t in ts.iter() {
                match t.methods().get(step) {
                    Some(DataMethod::Rotate(r)) if *r == rot => {}
                    _ => return Err(MethodError::ConflictingRotation),
                }
            }
            rot.apply(ts)?;
        } else {
            for t in ts.iter_mut() {
                if let Some(m) = t.methods().get(step) {
                    let mut inst = m.clone();
                    inst.apply_single(t)?;
                    t.methods_mut()[step] = inst;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PI;
    use approx::assert_abs_diff_eq;

    fn noisy_series() -> TimeSeries {
        let mut ts = TimeSeries::new();
        let data: Vec<f32> = (0..512)
            .map(|i| ((i as f32) * 0.13).sin() * 3.0 + 2.0 + ((i as f32) * 0.7).cos())
            .collect();
        ts.add_segment(Segment::new(data, 0.0, 0.01, 1.0, 1.0).unwrap())
            .unwrap();
        ts
    }

    fn standard_chain() -> Vec<DataMethod> {
        vec![
            DataMethod::Demean(Demean),
            DataMethod::Taper(TaperData::new(TaperType::Cosine, 5, 5, 50)),
            DataMethod::IirFilter(
                IirFilter::new(3, FilterType::BP, 1.0, 10.0, 0.01, false).unwrap(),
            ),
        ]
    }

    #[test]
    fn test_replay_invariant() {
        // Applying a chain and then replaying it against the raw data
        // reproduces the current samples exactly.
        let mut ts = noisy_series();
        apply_methods(&standard_chain(), &mut [&mut ts]).unwrap();
        let applied: Vec<f32> = ts.segment(0).data().to_vec();

        update(&mut [&mut ts]).unwrap();
        assert_eq!(ts.segment(0).data(), applied.as_slice());
    }

    #[test]
    fn test_change_methods_replaces_trailing_match() {
        // Filtering at one band then "changing" to another equals
        // applying the second band fresh.
        let mut a = noisy_series();
        apply_methods(&standard_chain(), &mut [&mut a]).unwrap();
        let replacement = vec![
            DataMethod::Demean(Demean),
            DataMethod::Taper(TaperData::new(TaperType::Cosine, 5, 5, 50)),
            DataMethod::IirFilter(
                IirFilter::new(3, FilterType::BP, 2.0, 8.0, 0.01, false).unwrap(),
            ),
        ];
        change_methods(&replacement, &mut [&mut a]).unwrap();

        let mut b = noisy_series();
        apply_methods(&replacement, &mut [&mut b]).unwrap();

        assert_eq!(a.methods().len(), 3);
        for (x, y) in a.segment(0).data().iter().zip(b.segment(0).data()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_change_methods_prepends_without_match() {
        let mut ts = noisy_series();
        apply_methods(
            &[DataMethod::Offset(OffsetData::new(1.0))],
            &mut [&mut ts],
        )
        .unwrap();
        change_methods(
            &[DataMethod::Amp(AmpData::new(2.0))],
            &mut [&mut ts],
        )
        .unwrap();
        assert_eq!(ts.methods().len(), 2);
        assert_eq!(ts.methods()[0].name(), "AmpData");
        assert_eq!(ts.methods()[1].name(), "OffsetData");
        // Replayed order: scale first, then offset.
        let raw = noisy_series();
        let expect = raw.segment(0).data()[0] * 2.0 + 1.0;
        assert_abs_diff_eq!(ts.segment(0).data()[0], expect, epsilon = 1e-6);
    }

    #[test]
    fn test_remove_methods_restores_raw() {
        let mut ts = noisy_series();
        let raw: Vec<f32> = ts.segment(0).data().to_vec();
        apply_methods(&standard_chain(), &mut [&mut ts]).unwrap();
        assert_ne!(ts.segment(0).data(), raw.as_slice());

        remove_methods(&["Demean", "TaperData", "IIRFilter"], &mut [&mut ts]).unwrap();
        assert!(ts.methods().is_empty());
        assert_eq!(ts.segment(0).data(), raw.as_slice());
    }

    #[test]
    fn test_get_method_finds_latest() {
        let mut ts = noisy_series();
        apply_methods(&standard_chain(), &mut [&mut ts]).unwrap();
        assert!(ts.get_method("IIRFilter").is_some());
        assert!(ts.get_method("RotateData").is_none());
    }

    #[test]
    fn test_capabilities() {
        let chain = standard_chain();
        assert!(!chain[0].can_append());
        assert!(!chain[1].can_append()); // two-sided cosine
        assert!(chain[2].can_append());
        assert!(!chain[0].rotation_commutative());
        assert!(chain[1].rotation_commutative());
        assert!(chain[2].rotation_commutative());

        let beg = DataMethod::Taper(TaperData::new(TaperType::CosineBeg, 5, 5, 50));
        assert!(beg.can_append());
    }

    #[test]
    fn test_rotation_in_chain_replays_as_group() {
        let mut e = TimeSeries::new();
        let mut n = TimeSeries::new();
        for (t, hang) in [(&mut e, 90.0), (&mut n, 0.0)] {
            t.set_orientation(hang, 90.0);
            let data: Vec<f32> = (0..128).map(|i| ((i as f32) * 0.2 + hang as f32).sin()).collect();
            t.add_segment(Segment::new(data, 0.0, 0.05, 1.0, 1.0).unwrap())
                .unwrap();
        }
        let methods = vec![DataMethod::Rotate(Rotation::from_azimuth(30.0))];
        apply_methods(&methods, &mut [&mut e, &mut n]).unwrap();
        let after_e: Vec<f32> = e.segment(0).data().to_vec();
        let after_n: Vec<f32> = n.segment(0).data().to_vec();

        update(&mut [&mut e, &mut n]).unwrap();
        for (a, b) in e.segment(0).data().iter().zip(after_e.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
        for (a, b) in n.segment(0).data().iter().zip(after_n.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rotation_single_series_rejected() {
        let mut ts = noisy_series();
        let mut rot = DataMethod::Rotate(Rotation::from_azimuth(10.0));
        assert!(rot.apply(&mut [&mut ts]).is_err());
    }

    #[test]
    fn test_filter_then_rotate_commutes() {
        // The IIR filter declares itself rotation-commutative: rotating
        // then filtering matches filtering then rotating. Both are
        // linear up to a constant mean shift, so compare the demeaned
        // outputs.
        let mk = |seed: f32| {
            let mut ts = TimeSeries::new();
            ts.set_orientation(if seed > 0.5 { 90.0 } else { 0.0 }, 90.0);
            let data: Vec<f32> = (0..400)
                .map(|i| {
                    let x = i as f32 / 400.0;
                    (2.0 * PI as f32 * 5.0 * x + seed).sin()
                        + 0.5 * (2.0 * PI as f32 * 11.0 * x).sin()
                })
                .collect();
            ts.add_segment(Segment::new(data, 0.0, 0.01, 1.0, 1.0).unwrap())
                .unwrap();
            ts
        };
        let filter = DataMethod::IirFilter(
            IirFilter::new(3, FilterType::BP, 2.0, 20.0, 0.01, false).unwrap(),
        );
        let rot = DataMethod::Rotate(Rotation::from_azimuth(40.0));

        let (mut e1, mut n1) = (mk(1.0), mk(0.0));
        apply_methods(&[rot.clone(), filter.clone()], &mut [&mut e1, &mut n1]).unwrap();

        let (mut e2, mut n2) = (mk(1.0), mk(0.0));
        apply_methods(&[filter, rot], &mut [&mut e2, &mut n2]).unwrap();

        for (x, y) in [(&mut e1, &mut e2), (&mut n1, &mut n2)] {
            Demean.apply(x);
            Demean.apply(y);
            for (a, b) in x.segment(0).data().iter().zip(y.segment(0).data()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-4);
            }
        }
    }
}
