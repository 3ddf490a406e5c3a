// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sample tapers.
//!
//! The cosine flavors ramp a percentage of the segment at each end (or
//! the beginning only), bounded by minimum and maximum sample counts.
//! The remaining types apply their full-length window to each segment.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::constants::PI;
use crate::ts::{Segment, TimeSeries};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum TaperType {
    #[strum(serialize = "hamming")]
    Hamming,
    #[strum(serialize = "hanning")]
    Hanning,
    #[strum(serialize = "cosine")]
    Cosine,
    #[strum(serialize = "cosineBeg")]
    CosineBeg,
    #[strum(serialize = "parzen")]
    Parzen,
    #[strum(serialize = "welch")]
    Welch,
    #[strum(serialize = "blackman")]
    Blackman,
    #[strum(serialize = "none")]
    None,
}

/// Taper each segment of a series.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaperData {
    ttype: TaperType,
    /// Cosine ramp width as a percentage of the segment length.
    width: usize,
    /// Minimum ramp length in samples.
    minpts: usize,
    /// Maximum ramp length in samples; 0 means unbounded.
    maxpts: usize,
}

impl TaperData {
    pub fn new(ttype: TaperType, width: usize, minpts: usize, maxpts: usize) -> TaperData {
        TaperData {
            ttype,
            width,
            minpts,
            maxpts,
        }
    }

    pub fn ttype(&self) -> TaperType {
        self.ttype
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn minpts(&self) -> usize {
        self.minpts
    }

    pub fn maxpts(&self) -> usize {
        self.maxpts
    }

    /// Only the begin-only cosine taper may be applied to a segment
    /// appended after earlier ones.
    pub fn can_append(&self) -> bool {
        self.ttype == TaperType::CosineBeg
    }

    pub fn apply(&self, ts: &mut TimeSeries) {
        for seg in ts.segments_mut() {
            self.apply_segment(seg);
        }
    }

    pub fn apply_segment(&self, seg: &mut Segment) {
        let n = seg.len();
        if n < 2 {
            return;
        }
        let data = seg.data_mut();
        match self.ttype {
            TaperType::None => {}
            TaperType::Cosine => {
                let len = self.ramp_len(n, 2);
                cosine_ramp_begin(data, len);
                cosine_ramp_end(data, len);
            }
            TaperType::CosineBeg => {
                let len = self.ramp_len(n, 1);
                cosine_ramp_begin(data, len);
            }
            TaperType::Hamming => full_window(data, |x| 0.54 - 0.46 * (2.0 * PI * x).cos()),
            TaperType::Hanning => full_window(data, |x| 0.5 * (1.0 - (2.0 * PI * x).cos())),
            TaperType::Blackman => full_window(data, |x| {
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            }),
            TaperType::Welch => full_window(data, |x| {
                let u = 2.0 * x - 1.0;
                1.0 - u * u
            }),
            TaperType::Parzen => full_window(data, |x| {
                let u = 2.0 * (x - 0.5).abs();
                if u <= 0.5 {
                    1.0 - 6.0 * u * u * (1.0 - u)
                } else {
                    2.0 * (1.0 - u).powi(3)
                }
            }),
        }
    }

    fn ramp_len(&self, n: usize, ends: usize) -> usize {
        let mut len = n * self.width / 100;
        if len < self.minpts {
            len = self.minpts;
        }
        if self.maxpts > 0 && len > self.maxpts {
            len = self.maxpts;
        }
        // Never let the ramps cross.
        len.min(n / (2 * ends.max(1)).max(1))
    }
}

impl fmt::Display for TaperData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TaperData: type={} width={} minpts={} maxpts={}",
            self.ttype, self.width, self.minpts, self.maxpts
        )
    }
}

fn cosine_ramp_begin(data: &mut [f32], len: usize) {
    if len == 0 {
        return;
    }
    let ang = PI / (2.0 * len as f64);
    for i in 0..len.min(data.len()) {
        let cs = ((len - 1 - i) as f64 * ang).cos();
        data[i] = (f64::from(data[i]) * cs * cs) as f32;
    }
}

fn cosine_ramp_end(data: &mut [f32], len: usize) {
    if len == 0 {
        return;
    }
    let n = data.len();
    let ang = PI / (2.0 * len as f64);
    for i in 0..len.min(n) {
        let cs = ((len - 1 - i) as f64 * ang).cos();
        data[n - 1 - i] = (f64::from(data[n - 1 - i]) * cs * cs) as f32;
    }
}

fn full_window(data: &mut [f32], w: impl Fn(f64) -> f64) {
    let n = data.len();
    for (i, v) in data.iter_mut().enumerate() {
        let x = i as f64 / (n - 1) as f64;
        *v = (f64::from(*v) * w(x)) as f32;
    }
}
