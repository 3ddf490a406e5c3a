// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Signal-processing and event-location core for seismic waveform
//! analysis.
//!
//! The crate models segmented waveform data with a replayable chain of
//! processing operators, and builds the multichannel machinery on top
//! of it: coverage computation, delay-sum beamforming with F-trace
//! detection statistics, a cepstral delay estimator, an STA/LTA
//! detector, and an iterative hypocenter locator.

pub mod beam;
pub mod cepstrum;
pub(crate) mod constants;
pub mod detect;
mod error;
pub mod geom;
pub mod locate;
pub mod methods;
pub(crate) mod spectral;
pub mod ts;

// Re-exports.
pub use beam::{beam_timeseries, ftrace, ftrace_az_slow, time_lags, BeamRecipe, BeamType};
pub use cepstrum::{cepstrum, CepstrumOutput, CepstrumParams};
pub use detect::{run_detector, DetectCandidate, ExistingArrival, StaLtaRecipe};
pub use error::SeismereError;
pub use locate::{
    locate, LocateResult, LocatorParams, Observation, OriginGuess, Site, TravelTime,
    TravelTimeOracle,
};
pub use methods::{DataMethod, FilterType, IirFilter, Rotation, TaperType};
pub use ts::{Coverage, DataLoop, Segment, TimeSeries};
