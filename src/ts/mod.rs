// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The waveform data model: uniformly sampled [`Segment`]s, the
//! segmented [`TimeSeries`] that owns them together with its method
//! chain, multichannel [`Coverage`] views, and the realtime
//! [`DataLoop`] ring buffer.

mod coverage;
mod data_loop;
mod segment;
mod series;

pub use coverage::{Coverage, CoverageError, CoverageWindow, WindowSlot};
pub use data_loop::DataLoop;
pub use segment::Segment;
pub use series::TimeSeries;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TsError {
    #[error("sample interval must be positive, got {0}")]
    NonPositiveDt(f64),

    #[error("subsegment range {i1}..{i2} is invalid for {len} samples")]
    SubsegmentRange { i1: usize, i2: usize, len: usize },

    #[error("segment starting at {t_begin} overlaps an existing segment")]
    OverlappingSegment { t_begin: f64 },

    #[error("segment sample interval {dt} is incompatible with the series interval {expected}")]
    IncompatibleDt { dt: f64, expected: f64 },
}
