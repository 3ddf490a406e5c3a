// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All constants *must* be double precision. `seismere` should do as many
calculations as possible in double precision before converting to a lower
precision, if it is ever required.
 */

pub use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Mean Earth radius \[km\].
pub const RADIUS_EARTH: f64 = 6371.0;

/// Kilometres per degree of great-circle arc.
pub const DEG_TO_KM: f64 = 111.19492664;

/// Deepest credible hypocentral depth \[km\]. Solutions are clamped here.
pub const MAX_DEPTH: f64 = 700.0;

/// Relative sample-interval tolerance used when deciding whether two
/// segments share a sample rate.
pub const DEFAULT_DT_TOLERANCE: f64 = 0.02;

/// Tolerance for the locator's convergence checks.
pub const CONVG_TOL: f64 = 1.0e-8;

/// Minimum number of locator iterations before convergence is tested.
/// Depth is held fixed until this many iterations have run.
pub const MIN_ITER: usize = 4;

/// History depth of standard errors and perturbation vectors kept for the
/// locator's convergence and divergence tests.
pub const MAX_HISTORY: usize = 3;

/// The effective condition number the damped SVD solution is steered
/// below when automatic damping is enabled.
pub const EFFECTIVE_COND_LIMIT: f64 = 30.0;

/// A true condition number above this on the final iteration marks the
/// solution as unusable.
pub const COND_NUM_LIMIT: f64 = 30000.0;

/// Number of airquake (or too-deep) clamps tolerated before depth is
/// pinned for the remaining iterations.
pub const MAX_AIR_QUAKES: usize = 4;

/// Tolerance for Levenberg-Marquardt per-parameter convergence checks;
/// widened by 10 for the depth parameter.
pub const CONVG_LM: f64 = 5.0e-4;

/// Initial step for the Ridders slowness-depth derivative \[km\].
pub const SL_DEPTH: f64 = 0.5;

/// Weighted-RMS inflation allowed per extra defining datum when comparing
/// Levenberg-Marquardt trial solutions.
pub const RMS_MULT: f64 = 2.0;

/// Maximum weighted RMS for a Levenberg-Marquardt solution to count as
/// converged.
pub const RMS_MAX: f64 = 3.2;
