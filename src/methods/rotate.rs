// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Component rotation.
//!
//! Rotates two horizontal components (by azimuth) or a full
//! three-component set (by Euler angles) into a new coordinate system.
//! The series are first unrotated from their *current* Euler state back
//! to (E, N, Up), so repeated rotations compose correctly; the state is
//! tracked on every component.

use std::fmt;

use crate::ts::{Coverage, Segment, TimeSeries};

use super::MethodError;

/// A rotation of 2 or 3 components described by the Euler angles
/// (alpha, beta, gamma), in degrees, that take the (E, N, Up) system to
/// the target system.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rotation {
    alpha: f64,
    beta: f64,
    gamma: f64,
}

impl Rotation {
    pub fn from_euler(alpha: f64, beta: f64, gamma: f64) -> Rotation {
        Rotation { alpha, beta, gamma }
    }

    /// A horizontal rotation to the given azimuth (degrees clockwise
    /// from north to the new x axis).
    pub fn from_azimuth(azimuth: f64) -> Rotation {
        Rotation {
            alpha: 90.0 - azimuth,
            beta: 0.0,
            gamma: 0.0,
        }
    }

    /// A rotation to the given azimuth and incidence (degrees from
    /// vertical).
    pub fn from_azimuth_incidence(azimuth: f64, incidence: f64) -> Rotation {
        Rotation {
            alpha: 90.0 - azimuth,
            beta: incidence - 90.0,
            gamma: 0.0,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Rotate a component set in place. `ts` is ordered (x, y) or
    /// (x, y, z), normally (E, N) or (E, N, Up). A 2-component call with
    /// a nonzero beta, unknown component orientation, or mismatched
    /// sample rates fails with an invalid-argument error.
    pub fn apply(&self, ts: &mut [&mut TimeSeries]) -> Result<(), MethodError> {
        if !(2..=3).contains(&ts.len()) {
            return Err(MethodError::ComponentCount(ts.len()));
        }
        if ts.len() == 2 && self.beta != 0.0 {
            return Err(MethodError::ComponentCount(2));
        }
        check_components(ts)?;

        // Use the average calibration of the inputs for the rebuilt
        // segments.
        let mut calib = 0.0;
        let mut calper = 0.0;
        for (i, t) in ts.iter().enumerate() {
            calib += t.segment(0).calib();
            if i == 0 {
                calper = t.segment(0).calper();
            }
        }
        calib /= ts.len() as f64;

        let (cur_alpha, cur_beta, cur_gamma) = ts[0].euler().unwrap_or((0.0, 0.0, 0.0));

        let means: Vec<f64> = ts.iter().map(|t| t.mean()).collect();
        let a_mean = means.iter().sum::<f64>() / means.len() as f64;

        let shared: Vec<&TimeSeries> = ts.iter().map(|t| &**t).collect();
        let cov = Coverage::full(&shared)?;

        // Rotate every coverage window, collecting replacement segments
        // per channel.
        let mut rebuilt: Vec<Vec<Segment>> = vec![vec![]; ts.len()];
        for w in cov.windows() {
            let aligned = w.aligned(&shared);
            let mut chans: Vec<Vec<f64>> = (0..ts.len())
                .map(|c| {
                    aligned
                        .row(c)
                        .iter()
                        .map(|&v| f64::from(v) - means[c])
                        .collect()
                })
                .collect();

            if ts.len() == 2 {
                let angle = -(cur_alpha - cur_gamma) + self.alpha - self.gamma;
                let (x, y) = chans.split_at_mut(1);
                rotate_2d(&mut x[0], &mut y[0], angle);
            } else {
                let (x, rest) = chans.split_at_mut(1);
                let (y, z) = rest.split_at_mut(1);
                rotate_3d(
                    &mut x[0],
                    &mut y[0],
                    &mut z[0],
                    (cur_alpha, cur_beta, cur_gamma),
                    (self.alpha, self.beta, self.gamma),
                );
            }

            for (c, chan) in chans.iter_mut().enumerate() {
                for v in chan.iter_mut() {
                    *v += a_mean;
                }
                rebuilt[c].push(Segment::from_f64(chan, w.t_min, cov.dt(), calib, calper)?);
            }
        }

        for (t, segs) in ts.iter_mut().zip(rebuilt) {
            t.remove_all_segments();
            for seg in segs {
                t.push_current(seg)?;
            }
            t.set_euler(self.alpha, self.beta, self.gamma);
        }
        Ok(())
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RotateData: {:.2} {:.2} {:.2}",
            self.alpha, self.beta, self.gamma
        )
    }
}

/// Verify the set looks like orthogonal components of one station: every
/// series has samples, a known orientation (or an already-established
/// Euler state), and the sample rates agree.
fn check_components(ts: &[&mut TimeSeries]) -> Result<(), MethodError> {
    for t in ts.iter() {
        if t.is_empty() {
            return Err(MethodError::EmptySeries);
        }
        if t.euler().is_none() && (t.hang().is_none() || t.vang().is_none()) {
            return Err(MethodError::UnknownOrientation {
                sta: t.sta().to_string(),
                chan: t.chan().to_string(),
            });
        }
    }
    let rate0 = 1.0 / ts[0].segment(0).dt();
    for t in ts.iter().skip(1) {
        let rate = 1.0 / t.segment(0).dt();
        if (rate0 - rate).abs() >= rate0 * 1e-4 {
            return Err(MethodError::VariableSampleRate);
        }
    }
    Ok(())
}

/// Rotate a pair of horizontal arrays by `angle` degrees
/// (counter-clockwise from the old x axis to the new x axis).
pub(crate) fn rotate_2d(x: &mut [f64], y: &mut [f64], angle: f64) {
    let rangle = angle.to_radians();
    let (sin_a, cos_a) = rangle.sin_cos();
    for (xi, yi) in x.iter_mut().zip(y.iter_mut()) {
        let xx = *xi * cos_a + *yi * sin_a;
        let yy = -*xi * sin_a + *yi * cos_a;
        *xi = xx;
        *yi = yy;
    }
}

/// Euler rotation matrix taking (E, N, Up) to the system described by
/// (alpha, beta, gamma) degrees.
fn euler_matrix(alpha: f64, beta: f64, gamma: f64) -> [[f64; 3]; 3] {
    let a = alpha.to_radians();
    let b = beta.to_radians();
    let g = gamma.to_radians();
    let (sina, cosa) = a.sin_cos();
    let (sinb, cosb) = b.sin_cos();
    let (sing, cosg) = g.sin_cos();
    [
        [
            cosa * cosb * cosg - sina * sing,
            sina * cosb * cosg + cosa * sing,
            -sinb * cosg,
        ],
        [
            -cosa * cosb * sing - sina * cosg,
            -sina * cosb * sing + cosa * cosg,
            sinb * sing,
        ],
        [cosa * sinb, sina * sinb, cosb],
    ]
}

/// Rotate three orthogonal arrays from the `cur` Euler state to the
/// `new` one, passing through (E, N, Up).
pub(crate) fn rotate_3d(
    x: &mut [f64],
    y: &mut [f64],
    z: &mut [f64],
    cur: (f64, f64, f64),
    new: (f64, f64, f64),
) {
    // First unrotate from the current system to (E, N, Up): the inverse
    // of an Euler rotation (a, b, g) is the rotation (-g, -b, -a).
    let c = euler_matrix(-cur.2, -cur.1, -cur.0);
    let d = euler_matrix(new.0, new.1, new.2);

    let mut e = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let mut sum = 0.0;
            for (k, ck) in c.iter().enumerate() {
                sum += d[i][k] * ck[j];
            }
            e[i][j] = sum;
        }
    }

    for ((xi, yi), zi) in x.iter_mut().zip(y.iter_mut()).zip(z.iter_mut()) {
        let xx = *xi * e[0][0] + *yi * e[0][1] + *zi * e[0][2];
        let yy = *xi * e[1][0] + *yi * e[1][1] + *zi * e[1][2];
        let zz = *xi * e[2][0] + *yi * e[2][1] + *zi * e[2][2];
        *xi = xx;
        *yi = yy;
        *zi = zz;
    }
}

/// The horizontal rotation angle that maximizes power on the radial
/// component over `[t_min, t_max]`, in degrees. Analytically,
/// `0.5*atan2(2*sum(x*y), sum(y*y - x*x))` over the demeaned window.
pub fn max_angle(
    x: &TimeSeries,
    y: &TimeSeries,
    t_min: f64,
    t_max: f64,
) -> Result<f64, MethodError> {
    let e_mean = x.mean();
    let n_mean = y.mean();
    let cov = Coverage::new(&[x, y], t_min, t_max)?;

    let mut sum1 = 0.0;
    let mut sum2 = 0.0;
    for w in cov.windows() {
        let a = w.aligned(&[x, y]);
        for j in 0..w.npts {
            let xv = f64::from(a[(0, j)]) - e_mean;
            let yv = f64::from(a[(1, j)]) - n_mean;
            sum1 += xv * yv;
            sum2 += yv * yv - xv * xv;
        }
    }
    if sum1 == 0.0 && sum2 == 0.0 {
        return Ok(0.0);
    }
    Ok((0.5 * (2.0 * sum1).atan2(sum2)).to_degrees())
}

/// The horizontal angle that maximizes radial power, then the vertical
/// angle maximizing power on the z axis with the rotated horizontal as
/// the new reference. Returns `(theta, phi)` in degrees.
pub fn max_angles(
    x: &TimeSeries,
    y: &TimeSeries,
    z: &TimeSeries,
    t_min: f64,
    t_max: f64,
) -> Result<(f64, f64), MethodError> {
    let e_mean = x.mean();
    let n_mean = y.mean();
    let z_mean = z.mean();

    let cov = Coverage::new(&[x, y, z], t_min, t_max)?;
    let mut sum1 = 0.0;
    let mut sum2 = 0.0;
    for w in cov.windows() {
        let a = w.aligned(&[x, y, z]);
        for j in 0..w.npts {
            let xv = f64::from(a[(0, j)]) - e_mean;
            let yv = f64::from(a[(1, j)]) - n_mean;
            sum1 += xv * yv;
            sum2 += yv * yv - xv * xv;
        }
    }
    let max_theta = if sum1 == 0.0 && sum2 == 0.0 {
        0.0
    } else {
        0.5 * (2.0 * sum1).atan2(sum2)
    };

    let (sn, cs) = max_theta.sin_cos();
    let mut phi_sum1 = 0.0;
    let mut phi_sum2 = 0.0;
    for w in cov.windows() {
        let a = w.aligned(&[x, y, z]);
        for j in 0..w.npts {
            let xv = f64::from(a[(0, j)]) - e_mean;
            let yv = f64::from(a[(1, j)]) - n_mean;
            let zv = f64::from(a[(2, j)]) - z_mean;
            let r = sn * xv + cs * yv;
            phi_sum1 += r * zv;
            phi_sum2 += zv * zv - r * r;
        }
    }
    let max_phi = if phi_sum1 == 0.0 && phi_sum2 == 0.0 {
        0.0
    } else {
        0.5 * (2.0 * phi_sum1).atan2(phi_sum2)
    };

    let mut theta = max_theta.to_degrees();
    let phi = max_phi.to_degrees();
    if theta > 0.0 {
        theta -= 180.0;
    } else {
        theta += 180.0;
    }
    Ok((theta, phi))
}
