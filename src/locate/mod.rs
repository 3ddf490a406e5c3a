// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Event location: iterative non-linear least-squares inversion of
//! travel-time, azimuth and slowness residuals.
//!
//! The main path ([`locate`]) is a damped-SVD inversion; when it
//! converges to an unacceptable fit or diverges, a Levenberg-Marquardt
//! pass with a depth grid search takes over. Travel times, their
//! partials and model errors come from an external [`TravelTimeOracle`].

mod lm;
mod svd;
#[cfg(test)]
mod tests;

pub use svd::locate;

use thiserror::Error;

use crate::constants::{MAX_DEPTH, MIN_ITER, RADIUS_EARTH};
use crate::geom::dist_azimuth;

/// Maximum number of solved-for parameters: origin time, longitude,
/// latitude, depth.
pub const MAX_PARAM: usize = 4;

/// Per-datum quality codes. Codes 1..=4 make a datum unusable outright;
/// 5 and 6 are screening codes that are re-evaluated each iteration;
/// 8 flags a failed total travel time; 11..=19 describe travel-time
/// table holes and extrapolation.
pub mod obs_code {
    pub const OK: u8 = 0;
    pub const NO_STATION: u8 = 1;
    pub const NO_TABLE: u8 = 2;
    pub const UNKNOWN_TYPE: u8 = 3;
    pub const BAD_SIGMA: u8 = 4;
    pub const LARGE_RESIDUAL: u8 = 5;
    pub const NO_CORRECTION: u8 = 6;
    pub const BAD_TOTAL_TIME: u8 = 8;
    pub const TT_HOLE: u8 = 11;

    /// True for the 12..=19 family of table-edge extrapolation codes.
    pub fn is_extrapolation(code: u8) -> bool {
        code > 11 && code < 20
    }
}

/// A station the observations refer to.
#[derive(Clone, Debug)]
pub struct Site {
    pub sta: String,
    pub lat: f64,
    pub lon: f64,
    pub elev: f64,
}

/// One arrival's measurements. Azimuth and slowness are optional; the
/// defining flags state whether each datum takes part in the inversion.
#[derive(Clone, Debug)]
pub struct Observation {
    /// Index into the site table, if the station is known.
    pub sta: Option<usize>,
    /// Phase index understood by the travel-time oracle.
    pub phase: usize,
    /// Arrival epoch time \[s\].
    pub time: f64,
    /// Arrival-time measurement error \[s\].
    pub deltim: f64,
    /// Observed azimuth \[deg\].
    pub azimuth: Option<f64>,
    /// Azimuth measurement error \[deg\].
    pub delaz: f64,
    /// Observed slowness, in the oracle's slowness unit.
    pub slow: Option<f64>,
    /// Slowness measurement error.
    pub delslo: f64,
    pub time_defining: bool,
    pub az_defining: bool,
    pub slow_defining: bool,
}

/// What the travel-time oracle reports for one observation at one
/// hypothesis.
#[derive(Clone, Copy, Debug, Default)]
pub struct TravelTime {
    /// Total travel time \[s\]; a negative value marks the datum
    /// unusable at this hypothesis.
    pub total: f64,
    /// Partial of the predicted arrival w.r.t. origin time (normally 1).
    pub dtdt0: f64,
    /// Partial w.r.t. eastward event displacement \[s/km\].
    pub dtde: f64,
    /// Partial w.r.t. northward event displacement \[s/km\].
    pub dtdn: f64,
    /// Partial w.r.t. depth \[s/km\].
    pub dtdz: f64,
    /// Predicted slowness, in the observation's slowness unit.
    pub slowness: f64,
    pub dsde: f64,
    pub dsdn: f64,
    pub dsdz: f64,
    /// Azimuth partials \[deg/km\].
    pub dazde: f64,
    pub dazdn: f64,
    /// Modelling error added to the measurement error \[s\].
    pub model_error: f64,
    /// A source-dependent correction was available and applied.
    pub has_correction: bool,
    /// Interpolation quality code (see [`obs_code`]).
    pub code: u8,
}

/// The external travel-time model. Implementations may read tables from
/// disk; failures surface as [`LocateError::Io`].
pub trait TravelTimeOracle {
    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        phase: usize,
        origin_lat: f64,
        origin_lon: f64,
        depth: f64,
        site: &Site,
        delta_deg: f64,
        esaz_deg: f64,
        need_z_derivs: bool,
    ) -> Result<TravelTime, LocateError>;
}

/// Locator configuration.
#[derive(Clone, Debug)]
pub struct LocatorParams {
    pub fix_depth: bool,
    pub fix_origin_time: bool,
    pub fix_lat_lon: bool,
    /// Damping as a percentage of the largest singular value; negative
    /// enables automatic damping driven by the condition number.
    pub damp: f64,
    pub max_iterations: usize,
    /// Screen out data whose residual exceeds `large_res_mult` sigmas.
    pub ignore_large_res: bool,
    pub large_res_mult: f64,
    /// Use only travel-time data with source-dependent corrections.
    pub use_only_sta_w_corr: bool,
    /// Azimuth SSSC hook; accepted but not applied.
    pub sssc_level: i32,
    /// Attempt the Levenberg-Marquardt fallback after the SVD phase.
    pub lm_fallback: bool,
    pub conf_level: f64,
}

impl Default for LocatorParams {
    fn default() -> LocatorParams {
        LocatorParams {
            fix_depth: false,
            fix_origin_time: false,
            fix_lat_lon: false,
            damp: -1.0,
            max_iterations: 20,
            ignore_large_res: false,
            large_res_mult: 3.0,
            use_only_sta_w_corr: false,
            sssc_level: 0,
            lm_fallback: true,
            conf_level: 0.9,
        }
    }
}

/// The starting hypothesis. An origin time of exactly zero means
/// "unknown" and is orthogonalized out on the first iteration.
#[derive(Clone, Copy, Debug)]
pub struct OriginGuess {
    pub lat: f64,
    pub lon: f64,
    pub depth: f64,
    pub time: f64,
}

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("travel-time oracle failure: {0}")]
    Io(String),

    #[error("ran out of memory; need {need} bytes for the locator working set")]
    InsufficientMemory { need: usize },

    #[error("no observations supplied")]
    NoObservations,

    #[error("origin time, epicenter and depth are all fixed")]
    NoFreeParameters,
}

/// Why an insufficient-data termination happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsufficientCause {
    General,
    TravelTimeHole,
    TravelTimeExtrapolation,
    LargeResidualScreen,
    CorrectionScreen,
}

/// Locator terminal status. The locator never fails mid-iteration; it
/// records one of these and finalizes its outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Converged,
    MaxIterations,
    Divergence,
    InsufficientData(InsufficientCause),
    SvdFailure,
    /// Converged but with an excessive condition number.
    ConditionNumber,
    /// The progress callback requested a stop.
    Aborted,
}

/// What the Levenberg-Marquardt fallback concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LmOutcome {
    NotAttempted,
    /// The SVD solution stands.
    UseSvd,
    /// LM improved the fit and converged.
    Converged,
    /// LM improved the fit but the solution still diverges.
    Diverged,
}

/// Per-observation locator output.
#[derive(Clone, Debug)]
pub struct ObsResult {
    pub time_code: u8,
    pub az_code: u8,
    pub slow_code: u8,
    pub time_res: Option<f64>,
    pub az_res: Option<f64>,
    pub slow_res: Option<f64>,
    /// Residual of the vector slowness.
    pub slow_vec_res: Option<f64>,
    /// Station-event distance \[deg\].
    pub delta: f64,
    /// Station-to-event azimuth \[deg\].
    pub seaz: f64,
    /// Event-to-station azimuth \[deg\].
    pub esaz: f64,
    /// Datum weight (inverse combined sigma).
    pub wgt: Option<f64>,
    pub time_import: Option<f64>,
    pub az_import: Option<f64>,
    pub slow_import: Option<f64>,
    /// Defining flags after final demotion of flagged data.
    pub time_defining: bool,
    pub az_defining: bool,
    pub slow_defining: bool,
}

impl ObsResult {
    fn blank(obs: &Observation) -> ObsResult {
        ObsResult {
            time_code: obs_code::OK,
            az_code: obs_code::OK,
            slow_code: obs_code::OK,
            time_res: None,
            az_res: None,
            slow_res: None,
            slow_vec_res: None,
            delta: f64::NAN,
            seaz: f64::NAN,
            esaz: f64::NAN,
            wgt: None,
            time_import: None,
            az_import: None,
            slow_import: None,
            time_defining: obs.time_defining,
            az_defining: obs.az_defining,
            slow_defining: obs.slow_defining,
        }
    }
}

/// The finished location.
#[derive(Clone, Debug)]
pub struct LocateResult {
    pub lat: f64,
    pub lon: f64,
    pub depth: f64,
    pub time: f64,
    /// Parameter covariance in (T0, east, north, depth) order; rows and
    /// columns of fixed parameters are zero.
    pub covariance: [[f64; MAX_PARAM]; MAX_PARAM],
    /// RMS of the raw travel-time residuals.
    pub sdobs: f64,
    pub wt_rms: f64,
    pub unwt_rms: f64,
    pub azimuthal_gap: f64,
    pub condition_number: f64,
    pub applied_damping: f64,
    pub rank: usize,
    pub nd_used: usize,
    pub np: usize,
    pub num_iter: usize,
    pub sum_sqrd_res: f64,
    pub termination: Termination,
    pub lm: LmOutcome,
    pub observations: Vec<ObsResult>,
}

/// What kind of datum a design-matrix row came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RowKind {
    Time,
    Slow,
    Az,
}

/// The locator's working set: the current hypothesis, the persistent
/// per-datum codes, and the design rows rebuilt every iteration (kept
/// as flat arrays; the residual loop is the hot path).
pub(crate) struct Workspace<'a> {
    pub params: LocatorParams,
    pub sites: &'a [Site],
    pub obs: &'a [Observation],
    pub oracle: &'a dyn TravelTimeOracle,

    pub codes: Vec<[u8; 3]>,
    pub res: Vec<ObsResult>,

    /// Design matrix rows, `MAX_PARAM` stride, compacted to `np`
    /// columns.
    pub at: Vec<f64>,
    pub resid: Vec<f64>,
    pub dsd: Vec<f64>,
    /// Row provenance: observation index and datum kind.
    pub rows: Vec<(usize, RowKind)>,
    /// Event-to-station azimuths of the used travel-time data.
    pub az_used: Vec<f64>,

    pub lat: f64,
    pub lon: f64,
    pub depth: f64,
    pub torg: f64,

    /// Number of free parameters when depth is free.
    pub num_params: usize,

    pub nd_used: usize,
    pub num_tt_used: usize,
    pub wt_rms: f64,
    pub unwt_rms: f64,
    pub sdobs: f64,
}

/// Per-call options for [`Workspace::accumulate`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct AccumulateOpts {
    pub num_iter: usize,
    pub fix_depth_this_iter: bool,
    /// Fill design rows (not needed when only residual statistics are
    /// wanted).
    pub deriv: bool,
    /// Take the slowness depth partial from Ridders extrapolation
    /// instead of the oracle.
    pub slow_z_ridders: bool,
    /// Final pass: compute residuals for non-defining data as well.
    pub final_pass: bool,
}

impl<'a> Workspace<'a> {
    pub fn new(
        params: &LocatorParams,
        sites: &'a [Site],
        obs: &'a [Observation],
        oracle: &'a dyn TravelTimeOracle,
        guess: &OriginGuess,
    ) -> Workspace<'a> {
        let mut num_params = 0;
        if !params.fix_origin_time {
            num_params += 1;
        }
        if !params.fix_lat_lon {
            num_params += 2;
        }
        if !params.fix_depth {
            num_params += 1;
        }
        let mut codes = vec![[obs_code::OK; 3]; obs.len()];
        for (c, o) in codes.iter_mut().zip(obs.iter()) {
            if o.sta.is_none() {
                *c = [obs_code::NO_STATION; 3];
            } else if o.deltim <= 0.0 {
                c[0] = obs_code::BAD_SIGMA;
            }
        }
        Workspace {
            params: params.clone(),
            sites,
            obs,
            oracle,
            codes,
            res: obs.iter().map(ObsResult::blank).collect(),
            at: vec![0.0; 3 * obs.len() * MAX_PARAM],
            resid: vec![0.0; 3 * obs.len()],
            dsd: vec![1.0; 3 * obs.len()],
            rows: Vec::with_capacity(3 * obs.len()),
            az_used: Vec::with_capacity(obs.len()),
            lat: guess.lat,
            lon: guess.lon,
            depth: guess.depth,
            torg: guess.time,
            num_params,
            nd_used: 0,
            num_tt_used: 0,
            wt_rms: 0.0,
            unwt_rms: 0.0,
            sdobs: f64::NAN,
        }
    }

    /// The number of free parameters this iteration.
    pub fn np(&self, fix_depth_this_iter: bool) -> usize {
        if fix_depth_this_iter && !self.params.fix_depth {
            self.num_params - 1
        } else {
            self.num_params
        }
    }

    /// Rebuild residuals, sigmas and (optionally) design rows at the
    /// current hypothesis. This is the single residual-and-derivative
    /// loop shared by the SVD and Levenberg-Marquardt paths.
    pub fn accumulate(&mut self, opts: AccumulateOpts) -> Result<(), LocateError> {
        let obs_arr = self.obs;
        let sites = self.sites;
        let need_z = !opts.fix_depth_this_iter && opts.deriv;

        for r in self.at.iter_mut() {
            *r = 0.0;
        }
        for (r, d) in self.resid.iter_mut().zip(self.dsd.iter_mut()) {
            *r = 0.0;
            *d = 1.0;
        }
        self.rows.clear();
        self.az_used.clear();
        for res in self.res.iter_mut() {
            res.time_res = None;
            res.az_res = None;
            res.slow_res = None;
            res.wgt = None;
        }

        let mut unwt_tt_sqd_sum = 0.0;
        let mut nd_used = 0usize;
        let mut num_tt_used = 0usize;

        for n in 0..obs_arr.len() {
            let obs = &obs_arr[n];
            let mut use_time = true;
            let mut use_slow = true;
            let mut use_azimuth = true;
            {
                let c = &self.codes[n];
                if c[0] > 0 && c[0] < 5 {
                    use_time = false;
                }
                if c[2] > 0 && c[2] < 5 {
                    use_slow = false;
                }
                if c[1] > 0 && c[1] < 5 {
                    use_azimuth = false;
                }
            }
            if !opts.final_pass {
                if !obs.time_defining {
                    use_time = false;
                }
                if !obs.slow_defining {
                    use_slow = false;
                }
                if !obs.az_defining {
                    use_azimuth = false;
                }
            }

            let site = match obs.sta {
                Some(i) => &sites[i],
                None => continue,
            };
            let (delta, seaz, esaz) = dist_azimuth(site.lat, site.lon, self.lat, self.lon);
            self.res[n].delta = delta;
            self.res[n].seaz = seaz;
            self.res[n].esaz = esaz;

            let mut tt = None;
            if use_time || use_slow {
                let t = self.oracle.evaluate(
                    obs.phase,
                    self.lat,
                    self.lon,
                    self.depth,
                    site,
                    delta,
                    esaz,
                    need_z,
                )?;
                let sigma_time = obs.deltim + t.model_error;

                if t.total > 0.0 {
                    self.res[n].time_res = Some(obs.time - t.total - self.torg);
                    self.res[n].slow_res = obs.slow.map(|s| s - t.slowness);
                    self.res[n].wgt = Some(1.0 / sigma_time);
                } else {
                    self.res[n].time_res = None;
                    self.res[n].slow_res = None;
                }

                if t.total < 0.0 {
                    self.codes[n][0] = obs_code::BAD_TOTAL_TIME;
                    self.codes[n][2] = obs_code::BAD_TOTAL_TIME;
                    use_time = false;
                    use_slow = false;
                } else if opts.num_iter < MIN_ITER {
                    if use_time {
                        self.codes[n][0] = obs_code::OK;
                    }
                    if use_slow {
                        self.codes[n][2] = obs_code::OK;
                    }
                } else {
                    if use_time {
                        self.codes[n][0] = t.code;
                    }
                    if use_slow {
                        self.codes[n][2] = t.code;
                    }
                }

                if use_time
                    && self.params.use_only_sta_w_corr
                    && opts.num_iter > MIN_ITER - 2
                    && !t.has_correction
                {
                    self.codes[n][0] = obs_code::NO_CORRECTION;
                }
                if use_slow && self.params.use_only_sta_w_corr && opts.num_iter > MIN_ITER - 2 {
                    self.codes[n][2] = obs_code::NO_CORRECTION;
                }

                // Large-residual screening, skipped while depth is
                // freed for the first time.
                if self.params.ignore_large_res
                    && ((opts.fix_depth_this_iter && opts.num_iter > MIN_ITER - 2)
                        || (!opts.fix_depth_this_iter && opts.num_iter >= MIN_ITER))
                {
                    if use_time {
                        if let Some(r) = self.res[n].time_res {
                            if r.abs() > self.params.large_res_mult * sigma_time {
                                self.codes[n][0] = obs_code::LARGE_RESIDUAL;
                            }
                        }
                    }
                    if use_slow {
                        if let Some(r) = self.res[n].slow_res {
                            if r.abs() > self.params.large_res_mult * obs.delslo {
                                self.codes[n][2] = obs_code::LARGE_RESIDUAL;
                            }
                        }
                    }
                }

                // Store the travel-time row.
                if use_time && self.codes[n][0] < 1 && obs.time_defining {
                    if opts.deriv {
                        self.store_row(nd_used, t.dtdt0, t.dtde, t.dtdn, t.dtdz, opts);
                    }
                    let residual = self.res[n].time_res.unwrap_or(0.0);
                    self.resid[nd_used] = residual;
                    self.dsd[nd_used] = sigma_time;
                    self.rows.push((n, RowKind::Time));
                    self.az_used.push(esaz);
                    unwt_tt_sqd_sum += residual * residual;
                    num_tt_used += 1;
                    nd_used += 1;
                }

                // Store the slowness row.
                if use_slow && self.codes[n][2] < 1 && obs.slow_defining && obs.slow.is_some() {
                    if opts.deriv {
                        let dsdz = if opts.slow_z_ridders && !opts.fix_depth_this_iter {
                            lm::slow_depth_deriv(self, n)?
                        } else {
                            t.dsdz
                        };
                        self.store_row(nd_used, 0.0, t.dsde, t.dsdn, dsdz, opts);
                    }
                    self.resid[nd_used] = self.res[n].slow_res.unwrap_or(0.0);
                    self.dsd[nd_used] = obs.delslo;
                    self.rows.push((n, RowKind::Slow));
                    nd_used += 1;
                }
                tt = Some(t);
            }

            // Azimuth is handled separately: when only azimuth data is
            // present the oracle need not be consulted at all.
            if use_azimuth {
                if let Some(observed_az) = obs.azimuth {
                    let mut azres = observed_az - seaz;
                    if azres.abs() > 180.0 {
                        azres = (360.0 - azres.abs()) * -azres.signum();
                    }
                    self.res[n].az_res = Some(azres);

                    if use_azimuth {
                        if self.params.use_only_sta_w_corr && opts.num_iter > MIN_ITER - 2 {
                            self.codes[n][1] = obs_code::NO_CORRECTION;
                        }
                        if opts.num_iter > MIN_ITER - 2
                            && self.params.ignore_large_res
                            && azres.abs() > self.params.large_res_mult * obs.delaz
                        {
                            self.codes[n][1] = obs_code::LARGE_RESIDUAL;
                        }
                    }

                    if use_azimuth && self.codes[n][1] < 1 && obs.az_defining {
                        if opts.deriv {
                            let (dazde, dazdn) = match &tt {
                                Some(t) if t.total > 0.0 => (t.dazde, t.dazdn),
                                _ => az_derivs(delta, esaz),
                            };
                            self.store_row(nd_used, 0.0, dazde, dazdn, 0.0, opts);
                        }
                        self.resid[nd_used] = azres;
                        self.dsd[nd_used] = obs.delaz;
                        self.rows.push((n, RowKind::Az));
                        nd_used += 1;
                    }
                }
            }
        }

        self.nd_used = nd_used;
        self.num_tt_used = num_tt_used;

        let mut unwt = 0.0;
        let mut wt = 0.0;
        for i in 0..nd_used {
            unwt += self.resid[i] * self.resid[i];
            let r = self.resid[i] / self.dsd[i];
            wt += r * r;
        }
        if nd_used > 0 {
            self.unwt_rms = (unwt / nd_used as f64).sqrt();
            self.wt_rms = (wt / nd_used as f64).sqrt();
        } else {
            self.unwt_rms = 0.0;
            self.wt_rms = 0.0;
        }
        self.sdobs = if num_tt_used > 0 {
            (unwt_tt_sqd_sum / num_tt_used as f64).sqrt()
        } else {
            f64::NAN
        };
        Ok(())
    }

    /// Pack a derivative row, compacting out the fixed parameters. The
    /// column order is (T0, east, north, depth).
    fn store_row(
        &mut self,
        row: usize,
        d0: f64,
        de: f64,
        dn: f64,
        dz: f64,
        opts: AccumulateOpts,
    ) {
        let base = row * MAX_PARAM;
        let mut ip = 0;
        if !self.params.fix_origin_time {
            self.at[base + ip] = d0;
            ip += 1;
        }
        if !self.params.fix_lat_lon {
            self.at[base + ip] = de;
            ip += 1;
            self.at[base + ip] = dn;
            ip += 1;
        }
        if !opts.fix_depth_this_iter && !self.params.fix_depth {
            self.at[base + ip] = dz;
        }
    }

    /// Classify an insufficient-data failure by the most specific
    /// screening code present.
    pub fn insufficient_cause(&self) -> InsufficientCause {
        for c in &self.codes {
            if c.contains(&obs_code::LARGE_RESIDUAL) {
                return InsufficientCause::LargeResidualScreen;
            }
            if c.contains(&obs_code::NO_CORRECTION) {
                return InsufficientCause::CorrectionScreen;
            }
            if c[0] == obs_code::TT_HOLE || c[2] == obs_code::TT_HOLE {
                return InsufficientCause::TravelTimeHole;
            }
            if obs_code::is_extrapolation(c[0]) || obs_code::is_extrapolation(c[2]) {
                return InsufficientCause::TravelTimeExtrapolation;
            }
        }
        InsufficientCause::General
    }
}

/// The azimuth-only partials: the change of the station-to-event
/// azimuth per km of eastward/northward event displacement.
pub(crate) fn az_derivs(delta: f64, esaz: f64) -> (f64, f64) {
    let esr = esaz.to_radians();
    let mut rt = delta.to_radians().sin() * RADIUS_EARTH;
    if rt == 0.0 {
        rt = 0.0001;
    }
    // In degrees per km.
    (
        (-esr.cos() / rt).to_degrees(),
        (esr.sin() / rt).to_degrees(),
    )
}

/// Azimuthal gap: the largest angular separation between successive
/// sorted event-to-station azimuths, including the wrap.
pub(crate) fn azimuthal_gap(az_used: &[f64]) -> f64 {
    use itertools::Itertools;

    if az_used.is_empty() {
        return 360.0;
    }
    let az: Vec<f64> = az_used
        .iter()
        .copied()
        .sorted_by(|a, b| a.partial_cmp(b).unwrap())
        .collect();
    let mut gap = 0.0f64;
    for (a, b) in az.iter().tuple_windows() {
        gap = gap.max(b - a);
    }
    gap = gap.max(360.0 - az[az.len() - 1] + az[0]);
    if !(0.0..=360.0).contains(&gap) {
        360.0
    } else {
        gap
    }
}

/// Clamp a depth into the physical range, counting airquakes and
/// too-deep excursions.
pub(crate) fn clamp_depth(depth: &mut f64, airquakes: &mut usize, too_deep: &mut usize) {
    if *depth < 0.0 {
        *airquakes += 1;
        *depth = 0.0;
    } else if *depth > MAX_DEPTH {
        *too_deep += 1;
        *depth = MAX_DEPTH;
    }
}

/// Kilometres per degree at the event depth.
pub(crate) fn km_per_deg_at(depth: f64) -> f64 {
    (RADIUS_EARTH - depth) * std::f64::consts::PI / 180.0
}
