// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all seismere-related errors. This should be the
//! *only* error enum that is publicly visible at the crate root; each
//! subsystem's error is classified into one of the kinds below.

use thiserror::Error;

use crate::beam::BeamError;
use crate::cepstrum::CepstrumError;
use crate::detect::DetectError;
use crate::locate::LocateError;
use crate::methods::MethodError;
use crate::ts::{CoverageError, TsError};

/// The *only* publicly visible error from seismere.
#[derive(Error, Debug)]
pub enum SeismereError {
    /// A precondition was violated at a public entry point.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// An allocation failed; fatal for the current operation.
    #[error("out of memory: {0}")]
    Memory(String),

    /// Mixed sample rates where an operation requires a uniform rate.
    #[error("sample rate mismatch: {0}")]
    SampleRate(String),

    /// An underlying reader or oracle failed.
    #[error("I/O failure: {0}")]
    Io(String),

    /// A generic error that can't be clarified further.
    #[error("{0}")]
    Generic(String),
}

// When changing the error propagation below, ensure the classification
// matches the taxonomy: per-datum problems never reach here; only
// operation-level failures do.

impl From<TsError> for SeismereError {
    fn from(e: TsError) -> Self {
        let s = e.to_string();
        match e {
            TsError::IncompatibleDt { .. } => Self::SampleRate(s),
            TsError::NonPositiveDt(_)
            | TsError::SubsegmentRange { .. }
            | TsError::OverlappingSegment { .. } => Self::InvalidArgs(s),
        }
    }
}

impl From<CoverageError> for SeismereError {
    fn from(e: CoverageError) -> Self {
        let s = e.to_string();
        match e {
            CoverageError::SampleRate { .. } => Self::SampleRate(s),
            CoverageError::NoSeries => Self::InvalidArgs(s),
        }
    }
}

impl From<MethodError> for SeismereError {
    fn from(e: MethodError) -> Self {
        let s = e.to_string();
        match e {
            MethodError::Ts(e) => Self::from(e),
            MethodError::Coverage(e) => Self::from(e),
            MethodError::VariableSampleRate => Self::SampleRate(s),
            MethodError::EmptySeries
            | MethodError::FilterOrder(_)
            | MethodError::BadSampleInterval(_)
            | MethodError::CornerFreqs { .. }
            | MethodError::SegmentApply { .. }
            | MethodError::ComponentCount(_)
            | MethodError::UnknownOrientation { .. }
            | MethodError::ConflictingRotation => Self::InvalidArgs(s),
        }
    }
}

impl From<BeamError> for SeismereError {
    fn from(e: BeamError) -> Self {
        let s = e.to_string();
        match e {
            BeamError::Coverage(e) => Self::from(e),
            BeamError::Method(e) => Self::from(e),
            BeamError::Ts(e) => Self::from(e),
            BeamError::InsufficientMemory { .. } => Self::Memory(s),
            BeamError::NoChannels | BeamError::MissingCoordinates { .. } => Self::InvalidArgs(s),
        }
    }
}

impl From<CepstrumError> for SeismereError {
    fn from(e: CepstrumError) -> Self {
        Self::InvalidArgs(e.to_string())
    }
}

impl From<DetectError> for SeismereError {
    fn from(e: DetectError) -> Self {
        let s = e.to_string();
        match e {
            DetectError::Method(e) => Self::from(e),
            DetectError::Beam(e) => Self::from(e),
            DetectError::EmptyChannel => Self::InvalidArgs(s),
        }
    }
}

impl From<LocateError> for SeismereError {
    fn from(e: LocateError) -> Self {
        let s = e.to_string();
        match e {
            LocateError::Io(_) => Self::Io(s),
            LocateError::InsufficientMemory { .. } => Self::Memory(s),
            LocateError::NoObservations | LocateError::NoFreeParameters => Self::InvalidArgs(s),
        }
    }
}

/// Fallibly allocate a filled vector, reporting the number of bytes
/// that could not be found.
pub(crate) fn try_vec<T: Clone>(value: T, len: usize) -> Result<Vec<T>, usize> {
    let mut v = Vec::new();
    match v.try_reserve_exact(len) {
        Ok(()) => {
            v.resize(len, value);
            Ok(v)
        }
        Err(_) => Err(len * std::mem::size_of::<T>()),
    }
}
