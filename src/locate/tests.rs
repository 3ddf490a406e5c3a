// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Locator tests against a synthetic homogeneous-velocity Earth.

use approx::assert_abs_diff_eq;

use super::*;
use crate::constants::DEG_TO_KM;
use crate::geom::dist_azimuth;

/// Travel times through a uniform 6 km/s medium: `t = L / v` with
/// `L = sqrt(d^2 + z^2)`, `d` the surface distance in km. All partials
/// are analytic.
struct UniformOracle {
    v: f64,
}

impl UniformOracle {
    fn new() -> UniformOracle {
        UniformOracle { v: 6.0 }
    }

    fn travel_time(&self, delta_deg: f64, depth: f64) -> f64 {
        let d = delta_deg * DEG_TO_KM;
        (d * d + depth * depth).sqrt() / self.v
    }
}

impl TravelTimeOracle for UniformOracle {
    fn evaluate(
        &self,
        _phase: usize,
        _origin_lat: f64,
        _origin_lon: f64,
        depth: f64,
        _site: &Site,
        delta_deg: f64,
        esaz_deg: f64,
        _need_z_derivs: bool,
    ) -> Result<TravelTime, LocateError> {
        let d = delta_deg * DEG_TO_KM;
        let l = (d * d + depth * depth).sqrt().max(1e-6);
        let esr = esaz_deg.to_radians();

        let dtdd = d / (l * self.v);
        let (dazde, dazdn) = az_derivs(delta_deg, esaz_deg);
        Ok(TravelTime {
            total: l / self.v,
            dtdt0: 1.0,
            dtde: -dtdd * esr.sin(),
            dtdn: -dtdd * esr.cos(),
            dtdz: depth / (l * self.v),
            slowness: dtdd,
            dsde: -(depth * depth) / (l * l * l * self.v) * esr.sin(),
            dsdn: -(depth * depth) / (l * l * l * self.v) * esr.cos(),
            dsdz: -d * depth / (l * l * l * self.v),
            dazde,
            dazdn,
            model_error: 0.0,
            has_correction: true,
            code: obs_code::OK,
        })
    }
}

fn ring_of_sites() -> Vec<Site> {
    // Six stations at assorted distances and azimuths around the test
    // region.
    let positions = [
        (2.0, 0.0),
        (1.5, 2.5),
        (-1.8, 1.2),
        (-2.5, -1.0),
        (0.8, -3.0),
        (4.0, 2.0),
    ];
    positions
        .iter()
        .enumerate()
        .map(|(i, &(lat, lon))| Site {
            sta: format!("S{i:02}"),
            lat,
            lon,
            elev: 0.0,
        })
        .collect()
}

/// Synthesize exact arrivals for an event.
fn synthetic_observations(
    sites: &[Site],
    oracle: &UniformOracle,
    lat: f64,
    lon: f64,
    depth: f64,
    torg: f64,
    with_azimuth: bool,
) -> Vec<Observation> {
    sites
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let (delta, seaz, _) = dist_azimuth(s.lat, s.lon, lat, lon);
            Observation {
                sta: Some(i),
                phase: 0,
                time: torg + oracle.travel_time(delta, depth),
                deltim: 0.1,
                azimuth: if with_azimuth { Some(seaz) } else { None },
                delaz: 5.0,
                slow: None,
                delslo: 1.0,
                time_defining: true,
                az_defining: with_azimuth,
                slow_defining: false,
            }
        })
        .collect()
}

#[test]
fn test_fixed_point_recovery() {
    // Arrivals generated from a synthetic event: the locator recovers
    // the hypocenter.
    let sites = ring_of_sites();
    let oracle = UniformOracle::new();
    let (lat0, lon0, depth0, torg0) = (0.3, -0.2, 15.0, 1000.0);
    let obs = synthetic_observations(&sites, &oracle, lat0, lon0, depth0, torg0, true);

    let params = LocatorParams::default();
    let guess = OriginGuess {
        lat: 1.5,
        lon: 1.0,
        depth: 0.0,
        time: 0.0,
    };
    let result = locate(&params, &sites, &obs, &oracle, &guess, None).unwrap();

    assert_eq!(result.termination, Termination::Converged);
    assert_abs_diff_eq!(result.lat, lat0, epsilon = 0.02);
    assert_abs_diff_eq!(result.lon, lon0, epsilon = 0.02);
    assert_abs_diff_eq!(result.depth, depth0, epsilon = 5.0);
    assert_abs_diff_eq!(result.time, torg0, epsilon = 0.25);

    // Exact data: the residuals collapse.
    assert!(result.wt_rms < 0.1, "wt_rms = {}", result.wt_rms);
    assert!(result.sdobs < 0.1, "sdobs = {}", result.sdobs);

    // The recovered origin lies within the 95% covariance ellipsoid;
    // with exact data the misfit is far inside it.
    let mislocation_km = ((result.lat - lat0) * DEG_TO_KM).hypot((result.lon - lon0) * DEG_TO_KM);
    let sigma_horiz = (result.covariance[1][1] + result.covariance[2][2]).sqrt();
    assert!(
        mislocation_km <= (2.45 * sigma_horiz).max(1.0),
        "mislocation {mislocation_km} km vs sigma {sigma_horiz}"
    );
}

#[test]
fn test_svd_only_recovery() {
    let sites = ring_of_sites();
    let oracle = UniformOracle::new();
    let obs = synthetic_observations(&sites, &oracle, -0.1, 0.4, 30.0, 500.0, false);

    let params = LocatorParams {
        lm_fallback: false,
        ..LocatorParams::default()
    };
    let guess = OriginGuess {
        lat: 0.8,
        lon: -0.5,
        depth: 10.0,
        time: 0.0,
    };
    let result = locate(&params, &sites, &obs, &oracle, &guess, None).unwrap();

    assert_eq!(result.termination, Termination::Converged);
    assert_eq!(result.lm, LmOutcome::NotAttempted);
    assert_abs_diff_eq!(result.lat, -0.1, epsilon = 0.02);
    assert_abs_diff_eq!(result.lon, 0.4, epsilon = 0.02);
    assert_abs_diff_eq!(result.time, 500.0, epsilon = 0.3);
}

#[test]
fn test_known_origin_time_is_used() {
    let sites = ring_of_sites();
    let oracle = UniformOracle::new();
    let obs = synthetic_observations(&sites, &oracle, 0.2, 0.1, 5.0, 2000.0, true);

    let params = LocatorParams::default();
    // A non-zero initial time skips the orthogonalization.
    let guess = OriginGuess {
        lat: 0.0,
        lon: 0.0,
        depth: 5.0,
        time: 1995.0,
    };
    let result = locate(&params, &sites, &obs, &oracle, &guess, None).unwrap();
    assert_eq!(result.termination, Termination::Converged);
    assert_abs_diff_eq!(result.time, 2000.0, epsilon = 0.25);
}

#[test]
fn test_insufficient_data() {
    let sites = ring_of_sites();
    let oracle = UniformOracle::new();
    let mut obs = synthetic_observations(&sites, &oracle, 0.3, -0.2, 15.0, 1000.0, false);
    obs.truncate(2);

    let params = LocatorParams {
        lm_fallback: false,
        ..LocatorParams::default()
    };
    let guess = OriginGuess {
        lat: 0.0,
        lon: 0.0,
        depth: 0.0,
        time: 0.0,
    };
    let result = locate(&params, &sites, &obs, &oracle, &guess, None).unwrap();
    assert!(matches!(
        result.termination,
        Termination::InsufficientData(_)
    ));
    // Partial outputs: the covariance stays zero-filled.
    for row in &result.covariance {
        for &v in row {
            assert_eq!(v, 0.0);
        }
    }
}

#[test]
fn test_fix_depth_holds_depth() {
    let sites = ring_of_sites();
    let oracle = UniformOracle::new();
    let obs = synthetic_observations(&sites, &oracle, 0.3, -0.2, 12.0, 100.0, false);

    let params = LocatorParams {
        fix_depth: true,
        lm_fallback: false,
        ..LocatorParams::default()
    };
    let guess = OriginGuess {
        lat: 0.6,
        lon: 0.5,
        depth: 12.0,
        time: 0.0,
    };
    let result = locate(&params, &sites, &obs, &oracle, &guess, None).unwrap();
    assert_eq!(result.termination, Termination::Converged);
    assert_abs_diff_eq!(result.depth, 12.0);
    assert_abs_diff_eq!(result.lat, 0.3, epsilon = 0.02);
    // The depth row and column of the covariance stay empty.
    assert_eq!(result.covariance[3][3], 0.0);
}

#[test]
fn test_progress_callback_aborts() {
    let sites = ring_of_sites();
    let oracle = UniformOracle::new();
    let obs = synthetic_observations(&sites, &oracle, 0.3, -0.2, 15.0, 1000.0, true);

    let params = LocatorParams {
        lm_fallback: false,
        ..LocatorParams::default()
    };
    let guess = OriginGuess {
        lat: 3.0,
        lon: 3.0,
        depth: 0.0,
        time: 0.0,
    };
    let mut iterations_seen = 0;
    let mut cb = |_iter: usize, _origin: &OriginGuess| {
        iterations_seen += 1;
        iterations_seen < 2
    };
    let result = locate(&params, &sites, &obs, &oracle, &guess, Some(&mut cb)).unwrap();
    assert_eq!(result.termination, Termination::Aborted);
    assert!(result.num_iter <= 3);
}

#[test]
fn test_outlier_screening_drops_bad_datum() {
    let sites = ring_of_sites();
    let oracle = UniformOracle::new();
    let mut obs = synthetic_observations(&sites, &oracle, 0.3, -0.2, 15.0, 1000.0, false);
    // Loose measurement errors and one grossly mistimed arrival: the
    // outlier residual dwarfs 3 sigma while the origin-time shift it
    // induces stays inside it for the other arrivals.
    for o in obs.iter_mut() {
        o.deltim = 1.0;
    }
    obs[5].time += 9.0;

    let params = LocatorParams {
        ignore_large_res: true,
        large_res_mult: 3.0,
        lm_fallback: false,
        ..LocatorParams::default()
    };
    let guess = OriginGuess {
        lat: 0.0,
        lon: 0.0,
        depth: 10.0,
        time: 0.0,
    };
    let result = locate(&params, &sites, &obs, &oracle, &guess, None).unwrap();
    assert_eq!(result.termination, Termination::Converged);
    // The poisoned datum was screened out and flagged.
    assert_eq!(result.observations[5].time_code, obs_code::LARGE_RESIDUAL);
    assert!(!result.observations[5].time_defining);
    // ... and the solution is still close to the truth.
    assert_abs_diff_eq!(result.lat, 0.3, epsilon = 0.05);
    assert_abs_diff_eq!(result.lon, -0.2, epsilon = 0.05);
}

#[test]
fn test_azimuthal_gap_reported() {
    let sites = ring_of_sites();
    let oracle = UniformOracle::new();
    let obs = synthetic_observations(&sites, &oracle, 0.3, -0.2, 15.0, 1000.0, false);
    let params = LocatorParams {
        lm_fallback: false,
        ..LocatorParams::default()
    };
    let guess = OriginGuess {
        lat: 0.0,
        lon: 0.0,
        depth: 10.0,
        time: 0.0,
    };
    let result = locate(&params, &sites, &obs, &oracle, &guess, None).unwrap();
    assert!(result.azimuthal_gap > 0.0 && result.azimuthal_gap <= 360.0);
    // Six stations all around: the gap is far from closed but well
    // under 180 degrees.
    assert!(result.azimuthal_gap < 180.0, "gap = {}", result.azimuthal_gap);

    // Importances were attached to the used data.
    let imports: Vec<f64> = result
        .observations
        .iter()
        .filter_map(|o| o.time_import)
        .collect();
    assert_eq!(imports.len(), 6);
    for imp in imports {
        assert!((0.0..=1.0 + 1e-9).contains(&imp));
    }
}
