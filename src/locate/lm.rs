// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The Levenberg-Marquardt fallback locator.
//!
//! Runs when the SVD phase converges to an unacceptable fit or
//! diverges. Minimizes the same weighted residual vector via damped
//! normal equations, starting from a grid of trial depths (depth fixed
//! during the grid phase), then compares the best solution found
//! against the SVD baseline.

use log::debug;
use nalgebra::{DMatrix, DVector};

use super::{
    km_per_deg_at, AccumulateOpts, LmOutcome, LocateError, Workspace, MAX_PARAM,
};
use crate::constants::{
    CONVG_LM, DEG_TO_KM, MAX_DEPTH, MIN_ITER, RMS_MAX, RMS_MULT, SL_DEPTH,
};
use crate::geom::{dist_azimuth, lat_lon};

const NUM_TEST_DEPTH: usize = 8;

/// A trial solution and its fit.
#[derive(Clone, Copy, Debug)]
struct Trial {
    torg: f64,
    lon: f64,
    lat: f64,
    depth: f64,
    wt_rms: f64,
    nd: usize,
}

/// "Is the new fit better than the old?" A trial wins outright on RMS
/// with at least as much data; it may also win by using more data with
/// an RMS inflation bounded by `RMS_MULT` per extra datum, and a bad
/// old fit loses to a much better one even with fewer data.
fn lm_better(new_rms: f64, new_nd: usize, old_rms: f64, old_nd: usize) -> bool {
    (new_rms < old_rms && new_nd >= old_nd)
        || (old_nd < new_nd && new_rms / old_rms <= RMS_MULT * (new_nd - old_nd) as f64)
        || (old_rms > new_rms
            && old_nd > new_nd
            && old_rms >= RMS_MAX
            && old_rms / new_rms >= RMS_MULT * (old_nd - new_nd) as f64)
}

/// Evaluate the normal equations `alpha = J^T W J`, `beta = J^T W r` at
/// the workspace's current hypothesis. Returns `None` when too few
/// data survive screening.
fn mrqcof(
    ws: &mut Workspace,
    num_iter: usize,
    fix_depth_this_iter: bool,
) -> Result<Option<(DMatrix<f64>, DVector<f64>)>, LocateError> {
    ws.accumulate(AccumulateOpts {
        num_iter,
        fix_depth_this_iter,
        deriv: true,
        slow_z_ridders: true,
        final_pass: false,
    })?;
    let np = ws.np(fix_depth_this_iter);
    if ws.nd_used < np {
        return Ok(None);
    }
    let mut alpha = DMatrix::zeros(np, np);
    let mut beta = DVector::zeros(np);
    for i in 0..ws.nd_used {
        let sig2i = 1.0 / (ws.dsd[i] * ws.dsd[i]);
        let dy = ws.resid[i];
        for l in 0..np {
            let wt = ws.at[i * MAX_PARAM + l] * sig2i;
            for m in 0..=l {
                alpha[(l, m)] += wt * ws.at[i * MAX_PARAM + m];
            }
            beta[l] += dy * wt;
        }
    }
    for l in 0..np {
        for m in l + 1..np {
            alpha[(l, m)] = alpha[(m, l)];
        }
    }
    Ok(Some((alpha, beta)))
}

/// The compacted parameter vector at the current hypothesis: origin
/// time and depth are carried absolutely, the east/north entries are
/// offsets from the anchor point and start at zero.
fn param_vec(ws: &Workspace, fix_depth_this_iter: bool) -> Vec<f64> {
    let mut a = vec![];
    if !ws.params.fix_origin_time {
        a.push(ws.torg);
    }
    if !ws.params.fix_lat_lon {
        a.push(0.0);
        a.push(0.0);
    }
    if !fix_depth_this_iter && !ws.params.fix_depth {
        a.push(ws.depth);
    }
    a
}

/// Move the hypothesis to a trial parameter vector, anchored at
/// `anchor` = (torg, lon, lat, depth). Returns the horizontal move in
/// degrees; the depth entry of `atry` is rewritten with the clamped
/// value.
fn apply_trial(
    ws: &mut Workspace,
    anchor: &[f64; 4],
    atry: &mut [f64],
    fix_depth_this_iter: bool,
) -> f64 {
    let mut ip = 0;
    if !ws.params.fix_origin_time {
        ws.torg = atry[ip];
        ip += 1;
    }
    let mut delta = 0.0;
    if !ws.params.fix_lat_lon {
        let e = atry[ip];
        let n = atry[ip + 1];
        if e != 0.0 || n != 0.0 {
            let azi = e.atan2(n).to_degrees();
            let dist = (e * e + n * n).sqrt();
            delta = dist / km_per_deg_at(anchor[3]);
            let (lat, lon) = lat_lon(anchor[2], anchor[1], delta, azi);
            ws.lat = lat;
            ws.lon = lon;
        } else {
            ws.lat = anchor[2];
            ws.lon = anchor[1];
        }
        ip += 2;
    }
    if !fix_depth_this_iter && !ws.params.fix_depth {
        ws.depth = atry[ip].clamp(0.0, MAX_DEPTH);
        atry[ip] = ws.depth;
    } else {
        ws.depth = anchor[3];
    }
    delta
}

fn restore(ws: &mut Workspace, point: &[f64; 4]) {
    ws.torg = point[0];
    ws.lon = point[1];
    ws.lat = point[2];
    ws.depth = point[3];
}

/// The Levenberg-Marquardt phase. `svd_diverged` tells whether the SVD
/// solution being improved upon had diverged, which decides between the
/// converged and diverged outcomes when the final fit is still poor.
pub(crate) fn locate_lm(
    ws: &mut Workspace,
    init_in: &[f64; 4],
    svd_diverged: bool,
) -> Result<LmOutcome, LocateError> {
    let mut init = *init_in;

    // Save the SVD solution as the baseline.
    let depth_pinned = ws.depth <= 0.0 || ws.depth >= MAX_DEPTH;
    let orig_svd = [
        ws.torg,
        ws.lon,
        ws.lat,
        ws.depth.clamp(0.0, MAX_DEPTH),
    ];
    ws.depth = orig_svd[3];

    let svd_fix = depth_pinned || ws.params.fix_depth;
    let (svd_rms, svd_nd) = {
        ws.accumulate(AccumulateOpts {
            num_iter: MIN_ITER + 1,
            fix_depth_this_iter: svd_fix,
            deriv: false,
            slow_z_ridders: false,
            final_pass: false,
        })?;
        if ws.nd_used >= ws.np(svd_fix) {
            (ws.wt_rms, ws.nd_used)
        } else {
            (999999.9, 0)
        }
    };

    // Screening filters are held off for the search and re-enabled for
    // the verification pass.
    let ignore_large_res = ws.params.ignore_large_res;
    let use_only_sta_w_corr = ws.params.use_only_sta_w_corr;
    ws.params.ignore_large_res = false;
    ws.params.use_only_sta_w_corr = false;

    // The depth schedule: SVD depth, initial depth, the coarse grid,
    // three refinement depths around the best coarse solution, up to
    // two around the running best, then the best grid depth with depth
    // freed.
    init[3] = init[3].clamp(0.0, MAX_DEPTH);
    let mut depth_sched = [
        -1.0, init[3], 0.0, 380.0, MAX_DEPTH, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0,
    ];
    let num_depth = if ws.params.fix_depth || ignore_large_res {
        2
    } else {
        11
    };

    let mut best = Trial {
        torg: init[0],
        lon: init[1],
        lat: init[2],
        depth: init[3],
        wt_rms: 999999.9,
        nd: 1,
    };
    let mut depths = [Trial {
        torg: init[0],
        lon: init[1],
        lat: init[2],
        depth: -1.0,
        wt_rms: 999999.9,
        nd: 1,
    }; NUM_TEST_DEPTH];
    let mut best_ind = 0usize;

    for n in 0..num_depth {
        let max_iter = ws.params.max_iterations;
        let mut res_wt = 999999.9f64;
        let depth_test = n > 1 && n < NUM_TEST_DEPTH + 2;

        if n == 2 && best.wt_rms < 15.0 {
            init[0] = best.torg;
            init[1] = best.lon;
            init[2] = best.lat;
        }
        if (3..=NUM_TEST_DEPTH + 2).contains(&n) {
            best_ind = 0;
            for l in 1..n - 2 {
                let b = &depths[best_ind];
                let d = &depths[l];
                if (b.wt_rms > d.wt_rms && b.nd <= d.nd)
                    || (b.nd < d.nd && b.wt_rms <= d.wt_rms)
                {
                    best_ind = l;
                }
            }
            if n <= 5 {
                init[0] = depths[best_ind].torg;
                init[1] = depths[best_ind].lon;
                init[2] = depths[best_ind].lat;
            }
            if n == 5 {
                // Refinement depths around the winning coarse depth.
                let refine = if depths[best_ind].depth == 0.0 {
                    [33.0, 75.0, 170.0]
                } else if depths[best_ind].depth == 380.0 {
                    [140.0, 250.0, 520.0]
                } else {
                    [650.0, 550.0, 450.0]
                };
                depth_sched[5] = refine[0];
                depth_sched[6] = refine[1];
                depth_sched[7] = refine[2];
            }

            // Skip the last refinement depth when the shallow results
            // already dominate.
            if n == 7 {
                let d = &depths;
                let skip = (d[2].wt_rms < d[3].wt_rms
                    && d[2].nd >= d[3].nd
                    && d[2].wt_rms < d[4].wt_rms
                    && d[2].nd >= d[4].nd
                    && d[2].wt_rms < d[5].wt_rms
                    && d[2].nd >= d[5].nd
                    && d[2].wt_rms < d[6].wt_rms
                    && d[2].nd >= d[6].nd)
                    || (d[3].wt_rms < d[2].wt_rms
                        && d[3].nd >= d[2].nd
                        && d[5].wt_rms < d[6].wt_rms
                        && d[5].nd >= d[6].nd
                        && d[6].wt_rms < d[3].wt_rms
                        && d[6].nd >= d[3].nd)
                    || (d[4].wt_rms < d[3].wt_rms
                        && d[4].nd >= d[3].nd
                        && d[3].wt_rms < d[2].wt_rms
                        && d[3].nd >= d[2].nd
                        && d[4].wt_rms < d[5].wt_rms
                        && d[4].nd >= d[5].nd
                        && d[5].wt_rms < d[6].wt_rms
                        && d[5].nd >= d[6].nd);
                if skip {
                    continue;
                }
            }
            if n == 8
                && best.depth != 0.0
                && best.depth != MAX_DEPTH
                && best.wt_rms < depths[best_ind].wt_rms
                && best.nd >= depths[best_ind].nd
            {
                if best.depth > 33.0 {
                    depth_sched[8] = best.depth - 10.0;
                    depth_sched[9] = best.depth + 10.0;
                } else {
                    depth_sched[8] = 12.0;
                }
            }
        }
        if n == NUM_TEST_DEPTH + 2 {
            init[0] = depths[best_ind].torg;
            init[1] = depths[best_ind].lon;
            init[2] = depths[best_ind].lat;
            depth_sched[NUM_TEST_DEPTH + 2] = depths[best_ind].depth;
        }

        if n >= 1 {
            ws.torg = init[0];
            ws.lon = init[1];
            ws.lat = init[2];
            ws.depth = depth_sched[n];
        } else {
            restore(ws, &orig_svd);
        }
        if ws.depth < 0.0 {
            continue;
        }

        let mut anchor = [ws.torg, ws.lon, ws.lat, ws.depth];
        let mut lm_iter = 0usize;
        let fix_depth_this = ws.params.fix_depth || depth_test;
        let np = ws.np(fix_depth_this);

        let (mut alpha, mut beta) = match mrqcof(ws, lm_iter, fix_depth_this)? {
            Some(ab) => ab,
            None => continue,
        };
        let mut last_nd = ws.nd_used;
        let mut last_wt = ws.wt_rms;

        if n == 0 {
            best = Trial {
                torg: ws.torg,
                lon: ws.lon,
                lat: ws.lat,
                depth: ws.depth,
                wt_rms: ws.wt_rms,
                nd: last_nd,
            };
        }

        let mut a = param_vec(ws, fix_depth_this);
        let mut alamda = if ws.wt_rms > RMS_MAX / 2.0 { 1.0e-5 } else { 1.0e-3 };
        let mut alamda_last = alamda * 10.0;
        let mut sec_test = false;

        debug!(
            "LM depth pass {n}: depth {:.1} km, wt_rms {:.4}, nd {}",
            ws.depth, ws.wt_rms, last_nd
        );

        while lm_iter <= max_iter {
            // Inflate the diagonal and solve the normal equations.
            let mut covar = alpha.clone();
            for j in 0..np {
                covar[(j, j)] = alpha[(j, j)] * (1.0 + alamda);
            }
            let da = match covar.full_piv_lu().solve(&beta) {
                Some(da) => da,
                None => break,
            };
            let mut atry: Vec<f64> = a.iter().zip(da.iter()).map(|(ai, di)| ai + di).collect();
            let delta = apply_trial(ws, &anchor, &mut atry, fix_depth_this);

            // Re-evaluate only when the trial actually moved.
            let mut trial = None;
            if delta >= 1.0e-6
                && ((ws.depth - anchor[3]).abs() >= 1.0e-4 || fix_depth_this)
            {
                match mrqcof(ws, lm_iter, fix_depth_this)? {
                    Some(ab) => trial = Some(ab),
                    None => {
                        // Too little data at the trial point: fall back
                        // to the anchor and escalate the damping.
                        restore(ws, &anchor);
                        if mrqcof(ws, lm_iter, fix_depth_this)?.is_none() {
                            break;
                        }
                        alamda *= 10.0;
                        if alamda > 1.0e15 {
                            break;
                        }
                        alamda_last = alamda;
                        continue;
                    }
                }
            }

            // Per-parameter convergence, with the depth tolerance
            // widened by 10.
            let mut converged = true;
            for (i, (t, b)) in atry.iter().zip(a.iter()).enumerate() {
                let mut convg = CONVG_LM;
                if i == np - 1 && !ws.params.fix_depth && !fix_depth_this {
                    convg *= 10.0;
                }
                if (t - b).abs() > convg {
                    converged = false;
                    break;
                }
            }

            if trial.is_some() && lm_better(ws.wt_rms, ws.nd_used, last_wt, last_nd) {
                // The trial succeeded.
                res_wt = last_wt - ws.wt_rms;
                last_wt = ws.wt_rms;
                last_nd = ws.nd_used;
                alamda *= 0.1;
                let (na, nb) = trial.unwrap();
                alpha = na;
                beta = nb;
                a = param_vec(ws, fix_depth_this);
                anchor = [ws.torg, ws.lon, ws.lat, ws.depth];
                lm_iter += 1;

                // Depth-grid passes bail out early against a clearly
                // better grid entry.
                if depth_test && depths[best_ind].nd > ws.nd_used && lm_iter >= 3 {
                    break;
                }
                if depth_test
                    && lm_iter >= 5
                    && ws.wt_rms > depths[best_ind].wt_rms * 2.5
                    && depths[best_ind].nd >= ws.nd_used
                {
                    break;
                }
            } else {
                // Failure: raise the damping and retry from the anchor.
                alamda *= 10.0;
                if alamda > 1.0e15 {
                    break;
                }
                restore(ws, &anchor);
            }

            if converged && depth_test {
                break;
            }
            if (converged && alamda_last < alamda) || res_wt < 1.0e-7 || lm_iter == max_iter {
                if !sec_test {
                    restore(ws, &anchor);
                    if ignore_large_res || use_only_sta_w_corr {
                        // Second pass with the screening filters back
                        // on.
                        ws.params.ignore_large_res = ignore_large_res;
                        ws.params.use_only_sta_w_corr = use_only_sta_w_corr;
                        lm_iter = MIN_ITER + 1;
                        match mrqcof(ws, lm_iter, fix_depth_this)? {
                            Some((na, nb)) => {
                                alpha = na;
                                beta = nb;
                                alamda = 1.0e-3;
                                last_wt = ws.wt_rms;
                                last_nd = ws.nd_used;
                            }
                            None => break,
                        }
                    } else if ws.wt_rms <= RMS_MAX
                        && ws.wt_rms <= best.wt_rms * 1.5
                        && ws.nd_used >= best.nd
                    {
                        alamda = 1.0e-4;
                    } else {
                        break;
                    }
                    sec_test = true;
                } else if lm_iter > MIN_ITER + 2 {
                    break;
                }
            }
            alamda_last = alamda;
        }

        restore(ws, &anchor);
        if !depth_test {
            ws.params.ignore_large_res = ignore_large_res;
            ws.params.use_only_sta_w_corr = use_only_sta_w_corr;
        }
        ws.accumulate(AccumulateOpts {
            num_iter: MIN_ITER + 1,
            fix_depth_this_iter: fix_depth_this,
            deriv: true,
            slow_z_ridders: true,
            final_pass: false,
        })?;
        let enough = ws.nd_used >= np;
        ws.params.ignore_large_res = false;
        ws.params.use_only_sta_w_corr = false;
        if !enough {
            best.nd = 1;
        }

        if depth_test {
            depths[n - 2] = Trial {
                torg: ws.torg,
                lon: ws.lon,
                lat: ws.lat,
                depth: ws.depth,
                wt_rms: ws.wt_rms,
                nd: ws.nd_used,
            };
            continue;
        }

        if n == 0 || lm_better(ws.wt_rms, ws.nd_used, best.wt_rms, best.nd) {
            best = Trial {
                torg: ws.torg,
                lon: ws.lon,
                lat: ws.lat,
                depth: ws.depth,
                wt_rms: ws.wt_rms,
                nd: ws.nd_used,
            };
        }
    }

    ws.params.ignore_large_res = ignore_large_res;
    ws.params.use_only_sta_w_corr = use_only_sta_w_corr;

    // The SVD baseline keeps the solution unless LM genuinely improved
    // on it.
    if lm_better(svd_rms, svd_nd, best.wt_rms, best.nd) {
        restore(ws, &orig_svd);
        debug!("LM: keeping the SVD solution");
        return Ok(LmOutcome::UseSvd);
    }

    ws.torg = best.torg;
    ws.lon = best.lon;
    ws.lat = best.lat;
    ws.depth = best.depth;
    let fix_final =
        ws.params.fix_depth || ws.depth == 0.0 || ws.depth == MAX_DEPTH;
    ws.accumulate(AccumulateOpts {
        num_iter: MIN_ITER + 1,
        fix_depth_this_iter: fix_final,
        deriv: true,
        slow_z_ridders: true,
        final_pass: false,
    })?;
    if ws.nd_used < ws.np(fix_final) {
        restore(ws, &orig_svd);
        return Ok(LmOutcome::UseSvd);
    }

    debug!(
        "LM: improved solution, wt_rms {:.4} (SVD {:.4})",
        ws.wt_rms, svd_rms
    );
    if ws.wt_rms > RMS_MAX {
        if svd_diverged {
            Ok(LmOutcome::Diverged)
        } else {
            Ok(LmOutcome::Converged)
        }
    } else {
        Ok(LmOutcome::Converged)
    }
}

/// Slowness at a trial depth, in per-kilometre units, or a negative
/// value when the oracle cannot produce one.
fn get_slow(ws: &Workspace, n: usize, depth: f64) -> Result<f64, LocateError> {
    let obs = &ws.obs[n];
    let site = match obs.sta {
        Some(i) => &ws.sites[i],
        None => return Ok(-1.0),
    };
    let (delta, _, esaz) = dist_azimuth(site.lat, site.lon, ws.lat, ws.lon);
    let tt = ws
        .oracle
        .evaluate(obs.phase, ws.lat, ws.lon, depth, site, delta, esaz, false)?;
    if tt.total < 0.0 {
        Ok(-1.0)
    } else {
        Ok(tt.slowness / DEG_TO_KM)
    }
}

/// The slowness depth partial by Ridders' polynomial extrapolation,
/// with the evaluation depth clamped inside the model.
pub(crate) fn slow_depth_deriv(ws: &Workspace, n: usize) -> Result<f64, LocateError> {
    let d = ws.depth.clamp(SL_DEPTH, MAX_DEPTH - SL_DEPTH);
    dfridr(d, SL_DEPTH, n, ws)
}

/// Ridders' method: successively smaller centred differences with
/// Neville extrapolation, stopping when higher order makes the error
/// estimate worse.
fn dfridr(x: f64, h: f64, n: usize, ws: &Workspace) -> Result<f64, LocateError> {
    const CON: f64 = 1.4;
    const NTAB: usize = 10;
    const SAFE: f64 = 2.0;
    const BIG: f64 = 1.0e30;

    if h == 0.0 {
        return Ok(0.0);
    }
    let mut hh = h;
    // Shrink the step until both sampled depths are inside the model.
    let (mut f1, mut f2);
    loop {
        f1 = get_slow(ws, n, x + hh)?;
        f2 = get_slow(ws, n, x - hh)?;
        if f1 >= 0.0 && f2 >= 0.0 {
            break;
        }
        hh *= 0.75;
        if hh < 1.0e-10 {
            return Ok(0.0);
        }
    }

    let mut a = [[0.0f64; NTAB]; NTAB];
    a[0][0] = (f1 - f2) / (2.0 * hh);
    let mut err = BIG;
    let mut ans = a[0][0];

    for i in 1..NTAB {
        hh /= CON;
        let g1 = get_slow(ws, n, x + hh)?;
        let g2 = get_slow(ws, n, x - hh)?;
        a[0][i] = (g1 - g2) / (2.0 * hh);
        let mut fac = CON * CON;
        for j in 1..=i {
            a[j][i] = (a[j - 1][i] * fac - a[j - 1][i - 1]) / (fac - 1.0);
            fac *= CON * CON;
            let errt = (a[j][i] - a[j - 1][i])
                .abs()
                .max((a[j][i] - a[j - 1][i - 1]).abs());
            if errt <= err {
                err = errt;
                ans = a[j][i];
            }
        }
        if (a[i][i] - a[i - 1][i - 1]).abs() >= SAFE * err {
            break;
        }
    }
    Ok(ans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lm_better_rules() {
        // Plain improvement.
        assert!(lm_better(1.0, 10, 2.0, 10));
        // Worse fit, same data: no.
        assert!(!lm_better(3.0, 10, 2.0, 10));
        // More data with a bounded RMS inflation.
        assert!(lm_better(2.5, 12, 2.0, 10));
        // A terrible old fit loses to a much better one on fewer data.
        assert!(lm_better(1.0, 8, 8.0, 10));
        // ... but not when the old fit was already acceptable.
        assert!(!lm_better(1.0, 8, 2.0, 10));
    }
}
