// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The main hypocenter inversion: iterative damped least squares via
//! singular value decomposition.

use log::debug;
use nalgebra::{DMatrix, DVector, SVD};

use super::{
    azimuthal_gap, clamp_depth, km_per_deg_at, lm, AccumulateOpts, LmOutcome, LocateError,
    LocateResult, LocatorParams, Observation, OriginGuess, RowKind, Site, Termination,
    TravelTimeOracle, Workspace, MAX_PARAM,
};
use crate::constants::{
    COND_NUM_LIMIT, CONVG_TOL, EFFECTIVE_COND_LIMIT, MAX_AIR_QUAKES, MAX_DEPTH, MAX_HISTORY,
    MIN_ITER,
};
use crate::geom::lat_lon;

/// One damped SVD solve of the normalized system.
pub(crate) struct SvdSolution {
    pub x: [f64; MAX_PARAM],
    pub cnvgtst: f64,
    pub cond_true: f64,
    pub covar: [[f64; MAX_PARAM]; MAX_PARAM],
    pub import: Vec<f64>,
    pub applied_damping: f64,
    pub rank: usize,
}

/// Solve `min || r - A x ||` with adaptive damping:
/// `x = V * diag(s/(s^2+l^2)) * U^T * r`. Rows are normalized by the
/// per-datum sigmas here. Returns `None` when the SVD fails to
/// converge.
pub(crate) fn solve_via_svd(
    at: &[f64],
    resid: &[f64],
    dsd: &[f64],
    nd: usize,
    np: usize,
    damp: f64,
) -> Option<SvdSolution> {
    let a = DMatrix::from_fn(nd, np, |i, j| at[i * MAX_PARAM + j] / dsd[i]);
    let r = DVector::from_fn(nd, |i, _| resid[i] / dsd[i]);

    let svd = SVD::try_new(a.clone(), true, true, 1.0e-14, 300)?;
    let s = &svd.singular_values;
    let u = svd.u.as_ref()?;
    let vt = svd.v_t.as_ref()?;

    let smax = s[0];
    let smin = s[s.len() - 1];
    let cond_true = if smin > 0.0 { smax / smin } else { 1.0e30 };

    // Damping: an explicit percentage of the largest singular value, or
    // just enough to hold the effective condition number at the limit.
    let lambda = if damp >= 0.0 {
        damp / 100.0 * smax
    } else if cond_true > EFFECTIVE_COND_LIMIT {
        let l = EFFECTIVE_COND_LIMIT;
        let l2 = (smax * smax - l * l * smin * smin) / (l * l - 1.0);
        l2.max(0.0).sqrt()
    } else {
        0.0
    };

    let mut x = [0.0; MAX_PARAM];
    let mut rank = 0;
    for k in 0..s.len() {
        let sk = s[k];
        if sk > smax * 1.0e-12 {
            rank += 1;
        }
        if sk <= 0.0 {
            continue;
        }
        let coef = sk / (sk * sk + lambda * lambda) * u.column(k).dot(&r);
        for j in 0..np {
            x[j] += coef * vt[(k, j)];
        }
    }

    // The convergence functional: the fraction of the weighted residual
    // norm this step explains.
    let xv = DVector::from_fn(np, |j, _| x[j]);
    let r_norm = r.norm_squared();
    let cnvgtst = if r_norm > 0.0 {
        (a * xv).norm_squared() / r_norm
    } else {
        0.0
    };

    let mut covar = [[0.0; MAX_PARAM]; MAX_PARAM];
    for k in 0..s.len() {
        let sk = s[k];
        if sk <= 0.0 {
            continue;
        }
        let den = sk * sk + lambda * lambda;
        let w = sk * sk / (den * den);
        for i in 0..np {
            for j in 0..np {
                covar[i][j] += w * vt[(k, i)] * vt[(k, j)];
            }
        }
    }

    // Data importances: the diagonal of the data resolution matrix.
    let mut import = vec![0.0; nd];
    for (i, imp) in import.iter_mut().enumerate() {
        for k in 0..s.len() {
            let sk = s[k];
            if sk <= 0.0 {
                continue;
            }
            *imp += u[(i, k)] * u[(i, k)] * sk * sk / (sk * sk + lambda * lambda);
        }
    }

    Some(SvdSolution {
        x,
        cnvgtst,
        cond_true,
        covar,
        import,
        applied_damping: lambda,
        rank,
    })
}

/// Locate an event: iterate travel-time/azimuth/slowness residuals
/// against the oracle, solving the damped least-squares system each
/// step, with depth clamping, outlier screening, step-length control
/// and a Levenberg-Marquardt fallback. The locator never fails during
/// iteration; terminal conditions are recorded in the result. Only
/// oracle I/O errors and allocation failures surface as `Err`.
pub fn locate(
    params: &LocatorParams,
    sites: &[Site],
    obs: &[Observation],
    oracle: &dyn TravelTimeOracle,
    guess: &OriginGuess,
    mut progress: Option<&mut dyn FnMut(usize, &OriginGuess) -> bool>,
) -> Result<LocateResult, LocateError> {
    if obs.is_empty() {
        return Err(LocateError::NoObservations);
    }
    let mut ws = Workspace::new(params, sites, obs, oracle, guess);
    if ws.num_params == 0 {
        return Err(LocateError::NoFreeParameters);
    }

    let mut convergence = false;
    let mut divergence = false;
    let mut aborted = false;
    let mut ldenuis = false;
    let mut return_err = false;
    let mut num_air_quakes = 0usize;
    let mut num_too_deep = 0usize;
    let mut num_iter = 0usize;
    let mut step = 1.0f64;
    let mut cnvgold = 1.0f64;
    let mut termination = Termination::Converged;
    let mut lm_outcome = LmOutcome::NotAttempted;

    let mut init = [0.0f64; MAX_PARAM];
    let mut cnvghats = [0.0f64; MAX_HISTORY];
    let mut dxnrms = [0.0f64; MAX_HISTORY];
    let mut nds = [0usize; MAX_HISTORY];
    let mut yold = [0.0f64; MAX_PARAM];
    let mut fix_depth_this_iter;
    let mut np;

    loop {
        // Never permit an airquake: clamp the depth, and after too many
        // clamps pin it for the remaining iterations.
        clamp_depth(&mut ws.depth, &mut num_air_quakes, &mut num_too_deep);
        if !ldenuis {
            init = [ws.torg, ws.lon, ws.lat, ws.depth];
        }
        fix_depth_this_iter = if num_iter < MIN_ITER - 1 {
            true
        } else if num_air_quakes > MAX_AIR_QUAKES {
            ws.depth = 0.0;
            true
        } else if num_too_deep > MAX_AIR_QUAKES {
            ws.depth = MAX_DEPTH;
            true
        } else {
            ws.params.fix_depth
        };
        np = ws.np(fix_depth_this_iter);

        ws.accumulate(AccumulateOpts {
            num_iter,
            fix_depth_this_iter,
            deriv: true,
            slow_z_ridders: false,
            final_pass: convergence || divergence || aborted,
        })?;

        if ws.nd_used < np {
            termination = Termination::InsufficientData(ws.insufficient_cause());
            return_err = true;
        } else {
            if !ldenuis && ws.torg == 0.0 {
                orthogonalize_origin_time(&mut ws, np);
                init[0] = ws.torg;
            }
            ldenuis = true;

            // Convergence or divergence was established last iteration;
            // the residuals have now been recalculated one final time.
            if convergence || divergence || aborted {
                break;
            }

            let sol = match solve_via_svd(
                &ws.at,
                &ws.resid,
                &ws.dsd,
                ws.nd_used,
                np,
                ws.params.damp,
            ) {
                Some(sol) => sol,
                None => {
                    return Ok(finalize(
                        &mut ws,
                        np,
                        num_iter,
                        Termination::SvdFailure,
                        lm_outcome,
                        None,
                    ));
                }
            };

            debug!(
                "iteration {num_iter}: nd={} wt_rms={:.4} cnvgtst={:.3e} cond={:.3e}",
                ws.nd_used, ws.wt_rms, sol.cnvgtst, sol.cond_true
            );

            let mut ssq = 0.0;
            for v in sol.x.iter().take(np) {
                ssq += v * v;
            }
            let mut dxnorm = ssq.sqrt();

            // Scale down very large perturbations, harder in later
            // iterations.
            let mut xsol = sol.x;
            let dxmax = if num_iter < ws.params.max_iterations / 5 + 1 {
                3000.0
            } else {
                1500.0
            };
            if dxnorm > dxmax {
                let scale = dxmax / dxnorm;
                for v in xsol.iter_mut().take(np) {
                    *v *= scale;
                }
                dxnorm = dxmax;
            }

            let mut ysol = uncompact(&ws, fix_depth_this_iter, &xsol);

            // Keep the convergence-test history of the two previous
            // iterations.
            for i in (1..=(MAX_HISTORY - 1).min(num_iter)).rev() {
                cnvghats[i] = cnvghats[i - 1];
                dxnrms[i] = dxnrms[i - 1];
                nds[i] = nds[i - 1];
            }
            nds[0] = ws.nd_used;
            cnvghats[0] = sol.cnvgtst;
            dxnrms[0] = dxnorm;
            let cnvgtst = sol.cnvgtst;

            if num_iter > MIN_ITER - 1 {
                if dxnorm > 0.0 && cnvgtst > 0.0 {
                    let (dxn01, dxn12) = if dxnrms[1] <= 0.0 || dxnrms[2] <= 0.0 {
                        (1.05, 1.05)
                    } else {
                        (dxnrms[0] / dxnrms[1], dxnrms[1] / dxnrms[2])
                    };
                    if dxn12 > 1.1
                        && dxn01 > dxn12
                        && num_iter > MIN_ITER + 2
                        && dxnorm > 1000.0
                    {
                        divergence = true;
                    } else if nds[0] == nds[1] && (cnvgtst < CONVG_TOL || dxnorm < 0.5) {
                        convergence = true;
                    } else if (ws.wt_rms < 0.001 || dxnorm < 0.001) && num_iter > MIN_ITER + 2 {
                        convergence = true;
                    } else {
                        let cnvg01 = if cnvghats[1] <= 0.0 || cnvghats[2] <= 0.0 {
                            cnvgtst
                        } else {
                            (cnvghats[1] / cnvghats[2] - cnvghats[0] / cnvghats[1]).abs()
                        };
                        let cnvg12 = (cnvghats[0] - cnvghats[2]).abs();
                        if (cnvgtst < 1.01 * cnvgold && cnvgtst < CONVG_TOL)
                            || (num_iter > 3 * ws.params.max_iterations / 4
                                && (cnvgtst < CONVG_TOL.sqrt()
                                    || cnvg01 < CONVG_TOL
                                    || cnvg12 < CONVG_TOL.sqrt()))
                        {
                            convergence = true;
                        }
                    }
                } else {
                    convergence = true;
                }
            }

            // Step-length weighting: half steps of the previous
            // solution vector when the convergence functional rises or
            // its history flattens.
            if num_iter > MIN_ITER + 2
                && (cnvgtst > cnvgold || cnvghats[0] - cnvghats[2] == 0.0)
                && step > 0.05
            {
                step *= 0.5;
                if step != 0.5 {
                    for i in 0..MAX_PARAM {
                        ysol[i] = step * yold[i];
                    }
                } else {
                    for i in 0..MAX_PARAM {
                        ysol[i] *= step;
                        yold[i] = ysol[i];
                    }
                }
            } else {
                step = 1.0;
                cnvgold = cnvgtst;
            }

            // Perturb the hypothesis: (east, north) km through the
            // great-circle destination, then time and depth.
            if ysol[1] != 0.0 || ysol[2] != 0.0 {
                let azi = ysol[1].atan2(ysol[2]).to_degrees();
                let dist = (ysol[1] * ysol[1] + ysol[2] * ysol[2]).sqrt();
                let delta = dist / km_per_deg_at(ws.depth);
                let (lat, lon) = lat_lon(ws.lat, ws.lon, delta, azi);
                ws.lat = lat;
                ws.lon = lon;
            }
            ws.torg += ysol[0];
            if !fix_depth_this_iter {
                ws.depth += ysol[3];
            }

            if convergence {
                termination = Termination::Converged;
                if sol.cond_true > COND_NUM_LIMIT {
                    termination = Termination::ConditionNumber;
                    divergence = true;
                }
            } else if divergence {
                termination = Termination::Divergence;
            } else if num_iter >= ws.params.max_iterations {
                termination = Termination::MaxIterations;
                divergence = true;
            } else {
                num_iter += 1;
            }

            if let Some(cb) = progress.as_mut() {
                let here = OriginGuess {
                    lat: ws.lat,
                    lon: ws.lon,
                    depth: ws.depth,
                    time: ws.torg,
                };
                if !convergence && !divergence && !cb(num_iter, &here) {
                    aborted = true;
                    termination = Termination::Aborted;
                }
            }
        }

        // The Levenberg-Marquardt fallback takes over once the SVD
        // phase has converged or given up.
        if return_err {
            divergence = true;
        }
        if (convergence || divergence) && !aborted {
            if ws.params.lm_fallback && lm_outcome == LmOutcome::NotAttempted {
                lm_outcome = lm::locate_lm(&mut ws, &init, divergence)?;
                match lm_outcome {
                    LmOutcome::Converged => {
                        return_err = false;
                        convergence = true;
                        divergence = false;
                        termination = Termination::Converged;
                        reset_depth_pins(&ws, &mut num_air_quakes, &mut num_too_deep);
                    }
                    LmOutcome::Diverged => {
                        return_err = false;
                        convergence = false;
                        divergence = true;
                        reset_depth_pins(&ws, &mut num_air_quakes, &mut num_too_deep);
                    }
                    LmOutcome::UseSvd | LmOutcome::NotAttempted => {
                        if return_err {
                            return Ok(finalize(
                                &mut ws,
                                np,
                                num_iter,
                                termination,
                                lm_outcome,
                                None,
                            ));
                        }
                    }
                }
            } else if return_err {
                return Ok(finalize(&mut ws, np, num_iter, termination, lm_outcome, None));
            }
        }
        // Always recalculate the residuals one final time.
    }

    // Wrap up: the covariance matrix and the data importances come from
    // a second SVD pass over the final system.
    let sol = solve_via_svd(&ws.at, &ws.resid, &ws.dsd, ws.nd_used, np, ws.params.damp);
    if sol.is_none() {
        termination = Termination::SvdFailure;
    }
    Ok(finalize(&mut ws, np, num_iter, termination, lm_outcome, sol))
}

/// Replace an unknown origin time with the weighted mean travel-time
/// residual and subtract the weighted mean of each partial from the
/// travel-time rows.
fn orthogonalize_origin_time(ws: &mut Workspace, np: usize) {
    let mut asum = 0.0;
    let mut amean = [0.0f64; MAX_PARAM];
    let mut dmean = 0.0;
    for (row, &(n, kind)) in ws.rows.iter().enumerate() {
        if kind != RowKind::Time {
            continue;
        }
        let deltim = ws.obs[n].deltim;
        let dacc = 1.0 / (deltim * deltim);
        for (m, am) in amean.iter_mut().enumerate().take(np).skip(1) {
            *am += dacc * ws.at[row * MAX_PARAM + m];
        }
        asum += dacc;
        dmean += dacc * ws.resid[row];
    }
    if asum <= 0.0 {
        ws.torg = 0.0;
        return;
    }
    for am in amean.iter_mut().take(np).skip(1) {
        *am /= asum;
    }
    ws.torg = dmean / asum;
    for (row, &(n, kind)) in ws.rows.iter().enumerate() {
        if kind != RowKind::Time {
            continue;
        }
        for m in 1..np {
            if ws.at[row * MAX_PARAM + m] != 0.0 {
                ws.at[row * MAX_PARAM + m] -= amean[m];
            }
        }
        ws.resid[row] -= ws.torg;
        ws.res[n].time_res = Some(ws.resid[row]);
    }
    // The weighted RMS must reflect the shifted residuals.
    let mut unwt = 0.0;
    let mut wt = 0.0;
    for i in 0..ws.nd_used {
        unwt += ws.resid[i] * ws.resid[i];
        let r = ws.resid[i] / ws.dsd[i];
        wt += r * r;
    }
    if ws.nd_used > 0 {
        ws.unwt_rms = (unwt / ws.nd_used as f64).sqrt();
        ws.wt_rms = (wt / ws.nd_used as f64).sqrt();
    }
}

/// Expand a compacted solution vector to (T0, east, north, depth).
fn uncompact(ws: &Workspace, fix_depth_this_iter: bool, xsol: &[f64; MAX_PARAM]) -> [f64; MAX_PARAM] {
    let mut ysol = [0.0; MAX_PARAM];
    let mut ip = 0;
    if !ws.params.fix_origin_time {
        ysol[0] = xsol[ip];
        ip += 1;
    }
    if !ws.params.fix_lat_lon {
        ysol[1] = xsol[ip];
        ip += 1;
        ysol[2] = xsol[ip];
        ip += 1;
    }
    if !fix_depth_this_iter && !ws.params.fix_depth {
        ysol[3] = xsol[ip];
    }
    ysol
}

/// Indices of the free parameters in (T0, east, north, depth) order.
fn free_params(ws: &Workspace, np: usize) -> Vec<usize> {
    let mut free = vec![];
    if !ws.params.fix_origin_time {
        free.push(0);
    }
    if !ws.params.fix_lat_lon {
        free.push(1);
        free.push(2);
    }
    if free.len() < np {
        free.push(3);
    }
    free
}

fn reset_depth_pins(ws: &Workspace, num_air_quakes: &mut usize, num_too_deep: &mut usize) {
    if ws.depth == 0.0 {
        *num_air_quakes = MAX_AIR_QUAKES + 1;
        *num_too_deep = 0;
    } else if ws.depth == MAX_DEPTH {
        *num_too_deep = MAX_AIR_QUAKES + 1;
        *num_air_quakes = 0;
    } else {
        *num_air_quakes = 0;
        *num_too_deep = 0;
    }
}

/// Assemble the result record: covariance, importances, azimuthal gap,
/// slowness-vector residuals and the final defining-flag demotion.
fn finalize(
    ws: &mut Workspace,
    np: usize,
    num_iter: usize,
    termination: Termination,
    lm: LmOutcome,
    sol: Option<SvdSolution>,
) -> LocateResult {
    let mut sum_sqrd_res = 0.0;
    for i in 0..ws.nd_used {
        let r = ws.resid[i] / ws.dsd[i];
        sum_sqrd_res += r * r;
    }

    let mut covariance = [[0.0; MAX_PARAM]; MAX_PARAM];
    let mut condition_number = 0.0;
    let mut applied_damping = 0.0;
    let mut rank = 0;
    if let Some(sol) = &sol {
        let free = free_params(ws, np);
        for (i, &pi) in free.iter().enumerate() {
            for (j, &pj) in free.iter().enumerate() {
                covariance[pi][pj] = sol.covar[i][j];
            }
        }
        condition_number = sol.cond_true;
        applied_damping = sol.applied_damping;
        rank = sol.rank;

        for (row, &(n, kind)) in ws.rows.iter().enumerate() {
            let imp = sol.import.get(row).copied();
            match kind {
                RowKind::Time => ws.res[n].time_import = imp,
                RowKind::Az => ws.res[n].az_import = imp,
                RowKind::Slow => ws.res[n].slow_import = imp,
            }
        }
    }

    let azimuthal_gap = azimuthal_gap(&ws.az_used);

    if ws.depth < 0.0 {
        ws.depth = 0.0;
    }

    // Residual of the vector slowness.
    for (n, obs) in ws.obs.iter().enumerate() {
        if let (Some(_), Some(slow), Some(slores), Some(azres)) = (
            obs.azimuth,
            obs.slow,
            ws.res[n].slow_res,
            ws.res[n].az_res,
        ) {
            let slodel = slow - slores;
            let svr = slow * slow + slodel * slodel
                - 2.0 * slow * slodel * azres.to_radians().cos();
            ws.res[n].slow_vec_res = Some(svr.abs().sqrt());
        }
    }

    // Final demotion: data with nonzero codes are no longer defining,
    // and data that never produced a usable residual lose it.
    for (n, res) in ws.res.iter_mut().enumerate() {
        let c = &ws.codes[n];
        res.time_code = c[0];
        res.az_code = c[1];
        res.slow_code = c[2];
        if c[0] > 0 {
            res.time_defining = false;
            if c[0] < 4 {
                res.time_res = None;
                res.wgt = None;
            }
        }
        if c[1] > 0 {
            res.az_defining = false;
            if c[1] < 5 {
                res.az_res = None;
            }
        }
        if c[2] > 0 {
            res.slow_defining = false;
            if c[2] < 5 {
                res.slow_res = None;
            }
        }
    }

    LocateResult {
        lat: ws.lat,
        lon: ws.lon,
        depth: ws.depth,
        time: ws.torg,
        covariance,
        sdobs: ws.sdobs,
        wt_rms: ws.wt_rms,
        unwt_rms: ws.unwt_rms,
        azimuthal_gap,
        condition_number,
        applied_damping,
        rank,
        nd_used: ws.nd_used,
        np,
        num_iter,
        sum_sqrd_res,
        termination,
        lm,
        observations: ws.res.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_via_svd_recovers_exact_solution() {
        // A well-conditioned 6x2 system with an exact solution.
        let x_true = [1.5, -2.0];
        let rows: [[f64; 2]; 6] = [
            [1.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [2.0, -1.0],
            [0.5, 0.25],
            [-1.0, 2.0],
        ];
        let mut at = vec![0.0; 6 * MAX_PARAM];
        let mut resid = vec![0.0; 6];
        let dsd = vec![1.0; 6];
        for (i, row) in rows.iter().enumerate() {
            at[i * MAX_PARAM] = row[0];
            at[i * MAX_PARAM + 1] = row[1];
            resid[i] = row[0] * x_true[0] + row[1] * x_true[1];
        }
        let sol = solve_via_svd(&at, &resid, &dsd, 6, 2, -1.0).unwrap();
        approx::assert_abs_diff_eq!(sol.x[0], x_true[0], epsilon = 1e-10);
        approx::assert_abs_diff_eq!(sol.x[1], x_true[1], epsilon = 1e-10);
        // The full residual is explained by the step.
        approx::assert_abs_diff_eq!(sol.cnvgtst, 1.0, epsilon = 1e-10);
        assert_eq!(sol.rank, 2);
    }

    #[test]
    fn test_damping_engages_on_bad_conditioning() {
        // Two nearly collinear columns force a huge condition number;
        // automatic damping must kick in.
        let rows: [[f64; 2]; 4] = [
            [1.0, 1.0],
            [1.0, 1.0 + 1e-9],
            [2.0, 2.0],
            [1.0, 0.9999999],
        ];
        let mut at = vec![0.0; 4 * MAX_PARAM];
        let mut resid = vec![0.0; 4];
        let dsd = vec![1.0; 4];
        for (i, row) in rows.iter().enumerate() {
            at[i * MAX_PARAM] = row[0];
            at[i * MAX_PARAM + 1] = row[1];
            resid[i] = 1.0;
        }
        let sol = solve_via_svd(&at, &resid, &dsd, 4, 2, -1.0).unwrap();
        assert!(sol.cond_true > EFFECTIVE_COND_LIMIT);
        assert!(sol.applied_damping > 0.0);
        // The damped step stays bounded.
        assert!(sol.x[0].abs() < 10.0 && sol.x[1].abs() < 10.0);
    }

    #[test]
    fn test_azimuthal_gap() {
        approx::assert_abs_diff_eq!(azimuthal_gap(&[0.0, 90.0, 180.0, 270.0]), 90.0);
        approx::assert_abs_diff_eq!(azimuthal_gap(&[10.0, 20.0]), 350.0);
        approx::assert_abs_diff_eq!(azimuthal_gap(&[]), 360.0);
    }
}
