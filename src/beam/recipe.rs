// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Beam recipe records.
//!
//! These mirror the fixed-column recipe tables of array processing
//! configurations. The core only ever consumes the pre-parsed records;
//! reading and writing recipe files is a caller concern.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use vec1::Vec1;

use crate::methods::FilterType;

/// How channels are combined into a beam.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum BeamType {
    /// Delay-and-sum of the signed samples.
    #[strum(serialize = "coh")]
    #[serde(rename = "coh")]
    Coherent,
    /// Mean of the rectified samples.
    #[strum(serialize = "inc")]
    #[serde(rename = "inc")]
    Incoherent,
}

/// One row of a beam recipe table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeamRecipe {
    pub name: String,
    pub beam_type: BeamType,
    /// Rotate horizontals toward the beam azimuth first.
    pub rot: bool,
    /// Standard-deviation selector for the recipe's weighting scheme.
    pub std: i32,
    pub snr: f64,
    /// Beam azimuth \[deg\].
    pub azimuth: f64,
    /// Horizontal slowness \[s/km\].
    pub slow: f64,
    pub phase: String,
    pub flo: f64,
    pub fhi: f64,
    pub ford: usize,
    pub zero_phase: bool,
    pub ftype: FilterType,
    pub group: String,
}

/// A station participating in a beam group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeamSta {
    pub sta: String,
    pub chan: String,
    pub wgt: f64,
}

/// A named set of stations a recipe beams over. A group without
/// stations is meaningless, hence the non-empty vector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeamGroup {
    pub net: String,
    pub group: String,
    pub stas: Vec1<BeamSta>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use vec1::vec1;

    #[test]
    fn test_beam_type_text() {
        assert_eq!(BeamType::Coherent.to_string(), "coh");
        assert_eq!("inc".parse::<BeamType>().unwrap(), BeamType::Incoherent);
    }

    #[test]
    fn test_group_requires_a_station() {
        let g = BeamGroup {
            net: "IM".into(),
            group: "cb".into(),
            stas: vec1![BeamSta {
                sta: "CB01".into(),
                chan: "shz".into(),
                wgt: 1.0,
            }],
        };
        assert_eq!(g.stas.len(), 1);
    }
}
